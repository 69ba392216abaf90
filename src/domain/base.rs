//! The record embedded in every model.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const ID: &str = "id";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const DELETED_AT: &str = "deleted_at";
pub const REMARK: &str = "remark";
pub const ORDER: &str = "order";

/// Columns that survive every projection.
pub const IDENTITY_COLUMNS: [&str; 3] = [ID, CREATED_AT, UPDATED_AT];

/// Identity and audit columns shared by every model.
///
/// Flattened into the model with `#[serde(flatten)]`, so the base columns sit
/// next to the model's own fields on the wire and in storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated_by: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub order: Option<u32>,
}

impl Base {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn timestamps_serialize_as_rfc3339_and_are_omitted_when_unset() {
        let base = Base {
            id: "u1".into(),
            created_at: Some(datetime!(2024-03-01 10:00:00 UTC)),
            ..Base::default()
        };
        let json = serde_json::to_value(&base).expect("serialize");
        assert_eq!(json["created_at"], "2024-03-01T10:00:00Z");
        assert!(json.get("updated_at").is_none());
        assert!(json.get("deleted_at").is_none());
        assert_eq!(json["remark"], serde_json::Value::Null);
    }

    #[test]
    fn missing_columns_deserialize_to_defaults() {
        let base: Base = serde_json::from_value(serde_json::json!({ "id": "x" })).expect("base");
        assert_eq!(base, Base::with_id("x"));
    }
}
