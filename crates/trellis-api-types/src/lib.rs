//! Wire types shared by trellis CRUD endpoints and their HTTP clients.

use serde::{Deserialize, Serialize};

/// Stable numeric codes carried in the envelope `code` field.
pub mod codes {
    pub const OK: i32 = 0;
    pub const BAD_REQUEST: i32 = 40000;
    pub const NOT_FOUND: i32 = 40400;
    pub const CONFLICT: i32 = 40900;
    pub const CANCELLED: i32 = 49900;
    pub const INTERNAL: i32 = 50000;
    pub const AFTER_HOOK: i32 = 50001;
    pub const TRANSIENT: i32 = 50300;
}

/// Reserved query parameter names understood by list endpoints.
pub mod params {
    pub const PAGE: &str = "page";
    pub const SIZE: &str = "size";
    pub const EXPAND: &str = "_expand";
    pub const DEPTH: &str = "_depth";
    pub const FUZZY: &str = "_fuzzy";
    pub const SORT_BY: &str = "_sortby";
    pub const NO_CACHE: &str = "_nocache";
    pub const COLUMN_NAME: &str = "_column_name";
    pub const START_TIME: &str = "_start_time";
    pub const END_TIME: &str = "_end_time";
    pub const OR: &str = "_or";
    pub const INDEX: &str = "_index";
    pub const SELECT: &str = "_select";
    pub const NO_TOTAL: &str = "_nototal";
    pub const CURSOR_VALUE: &str = "_cursor_value";
    pub const CURSOR_FIELDS: &str = "_cursor_fields";
    pub const CURSOR_NEXT: &str = "_cursor_next";
    pub const SHOW_DELETED: &str = "_show_deleted";

    pub const RESERVED: &[&str] = &[
        PAGE,
        SIZE,
        EXPAND,
        DEPTH,
        FUZZY,
        SORT_BY,
        NO_CACHE,
        COLUMN_NAME,
        START_TIME,
        END_TIME,
        OR,
        INDEX,
        SELECT,
        NO_TOTAL,
        CURSOR_VALUE,
        CURSOR_FIELDS,
        CURSOR_NEXT,
        SHOW_DELETED,
    ];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }
}

/// Response envelope written by every controller endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: codes::OK,
            msg: String::new(),
            data: Some(data),
        }
    }

    pub fn failure(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::OK
    }
}

/// Payload of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPayload<T> {
    pub items: Vec<T>,
    /// Omitted when the caller asked for `_nototal=true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Run the whole batch in one transaction.
    #[serde(default)]
    pub atomic: bool,
}

/// Body of the `/batch` endpoints: either `items` or `ids` is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub options: BatchOptions,
}

impl<T> Default for BatchRequest<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ids: Vec::new(),
            options: BatchOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleteSummary {
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
}
