//! Storage port implemented by the engines under `infra::store`.
//!
//! Rows travel as JSON objects holding the base columns next to the model's
//! own fields. Engines evaluate a [`Plan`] and never see model types.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::schema::Schema;

use super::filter::{Condition, FilterSet};

pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("duplicate value for unique field `{field}` in `{table}`")]
    Duplicate { table: String, field: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("storage timeout")]
    Timeout,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported by this engine: {0}")]
    Unsupported(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

/// Inclusive window on a time column; either bound may be open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub column: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

impl TimeRange {
    /// Builds a window, swapping reversed bounds.
    pub fn new(
        column: impl Into<String>,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Self {
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if s > e => (Some(e), Some(s)),
            other => other,
        };
        Self {
            column: column.into(),
            start,
            end,
        }
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at <= end)
    }
}

/// Raw filter fragment; `?` placeholders are bound to `args` in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFilter {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Keyset position: rows strictly after `values` under `keys`.
///
/// Keys compare lexicographically, each in its own direction, with nulls
/// sorting before every other value. The last key is normally `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Seek {
    pub keys: Vec<OrderBy>,
    pub values: Vec<Value>,
}

/// A fully resolved read against one table.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub table: String,
    #[serde(skip)]
    pub schema: &'static Schema,
    pub filters: FilterSet,
    /// Always combined with AND, independent of the filter combinator.
    pub guards: Vec<Condition>,
    pub time_range: Option<TimeRange>,
    pub raw: Vec<RawFilter>,
    pub include_deleted: bool,
    pub order: Vec<OrderBy>,
    pub seek: Option<Seek>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub lock: bool,
    pub index_hint: Option<String>,
}

impl Plan {
    pub fn new(table: impl Into<String>, schema: &'static Schema) -> Self {
        Self {
            table: table.into(),
            schema,
            filters: FilterSet::default(),
            guards: Vec::new(),
            time_range: None,
            raw: Vec::new(),
            include_deleted: false,
            order: Vec::new(),
            seek: None,
            limit: None,
            offset: 0,
            lock: false,
            index_hint: None,
        }
    }

    /// Restrict the plan to the given ids.
    pub fn with_ids(mut self, ids: &[String]) -> Self {
        self.guards.push(Condition::In {
            column: crate::domain::base::ID.to_string(),
            values: ids.iter().cloned().map(Value::String).collect(),
        });
        self
    }

    /// The same plan without paging, ordering or seek, for counting.
    pub fn for_count(&self) -> Self {
        Self {
            order: Vec::new(),
            seek: None,
            limit: None,
            offset: 0,
            lock: false,
            ..self.clone()
        }
    }
}

/// Storage engine.
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    /// Create the table when missing, plus its unique indexes.
    async fn ensure_table(&self, table: &str, schema: &Schema) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Unit of work. Dropping it without `commit` discards every change.
#[async_trait]
pub trait Transaction: Send {
    /// Insert or replace rows by id. An existing row keeps its `created_at`.
    async fn upsert(
        &mut self,
        table: &str,
        schema: &Schema,
        rows: Vec<Row>,
    ) -> Result<(), StoreError>;

    async fn select(&mut self, plan: &Plan) -> Result<Vec<Row>, StoreError>;

    async fn count(&mut self, plan: &Plan) -> Result<u64, StoreError>;

    /// Set one column of a live row, returning the affected row count.
    async fn set_column(
        &mut self,
        table: &str,
        id: &str,
        column: &str,
        value: Value,
        updated_at: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    async fn soft_delete(
        &mut self,
        table: &str,
        ids: &[String],
        at: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    async fn purge(&mut self, table: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// Physically remove every soft-deleted row.
    async fn cleanup(&mut self, table: &str) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn reversed_time_bounds_are_swapped() {
        let early = datetime!(2024-01-01 00:00:00 UTC);
        let late = datetime!(2024-02-01 00:00:00 UTC);
        let range = TimeRange::new("created_at", Some(late), Some(early));
        assert_eq!(range.start, Some(early));
        assert_eq!(range.end, Some(late));
        assert!(range.contains(early));
        assert!(range.contains(late));
        assert!(!range.contains(datetime!(2024-02-01 00:00:01 UTC)));
    }

    #[test]
    fn count_plan_drops_paging() {
        static SCHEMA: once_cell::sync::Lazy<Schema> = once_cell::sync::Lazy::new(Schema::new);
        let mut plan = Plan::new("users", &SCHEMA);
        plan.limit = Some(10);
        plan.offset = 20;
        plan.order.push(OrderBy::desc("name"));
        let count = plan.for_count();
        assert!(count.limit.is_none());
        assert_eq!(count.offset, 0);
        assert!(count.order.is_empty());
    }
}
