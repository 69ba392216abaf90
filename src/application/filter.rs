//! Filter conditions evaluated by storage engines.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::domain::schema::{FieldKind, Schema};

use super::store::Row;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    NotIn { column: String, values: Vec<Value> },
    Contains { column: String, needle: String },
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::Eq {
            column: column.into(),
            value,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Condition::Eq { column, .. }
            | Condition::In { column, .. }
            | Condition::NotIn { column, .. }
            | Condition::Contains { column, .. } => column,
        }
    }

    /// Equality on a string column becomes a containment match.
    pub fn fuzzy(self, schema: &Schema) -> Self {
        match self {
            Condition::Eq {
                column,
                value: Value::String(needle),
            } if schema
                .column(&column)
                .is_some_and(|field| field.kind == FieldKind::String) =>
            {
                Condition::Contains { column, needle }
            }
            other => other,
        }
    }

    pub fn matches(&self, row: &Row, schema: &Schema) -> bool {
        let kind = column_kind(schema, self.column());
        let actual = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Condition::Eq { value, .. } => values_equal(kind, actual, value),
            Condition::In { values, .. } => values.iter().any(|v| values_equal(kind, actual, v)),
            Condition::NotIn { values, .. } => {
                !values.iter().any(|v| values_equal(kind, actual, v))
            }
            Condition::Contains { needle, .. } => match actual {
                Value::String(s) => s.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

/// Field conditions combined with one boolean operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterSet {
    pub combinator: Combinator,
    pub conditions: Vec<Condition>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn push(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    /// An empty set matches every row.
    pub fn matches(&self, row: &Row, schema: &Schema) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.combinator {
            Combinator::And => self.conditions.iter().all(|c| c.matches(row, schema)),
            Combinator::Or => self.conditions.iter().any(|c| c.matches(row, schema)),
        }
    }
}

pub fn column_kind(schema: &Schema, column: &str) -> FieldKind {
    schema
        .column(column)
        .map(|field| field.kind)
        .unwrap_or(FieldKind::Json)
}

pub fn values_equal(kind: FieldKind, left: &Value, right: &Value) -> bool {
    compare_values(kind, left, right) == Ordering::Equal
}

/// Total order over stored values of one column kind. Nulls sort first.
pub fn compare_values(kind: FieldKind, left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => return Ordering::Equal,
        (Value::Null, _) => return Ordering::Less,
        (_, Value::Null) => return Ordering::Greater,
        _ => {}
    }
    match kind {
        FieldKind::Int | FieldKind::Float => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => fallback(left, right),
        },
        FieldKind::Bool => match (left.as_bool(), right.as_bool()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => fallback(left, right),
        },
        FieldKind::Time => match (parse_time(left), parse_time(right)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => fallback(left, right),
        },
        FieldKind::String | FieldKind::Json => fallback(left, right),
    }
}

pub fn parse_time(value: &Value) -> Option<OffsetDateTime> {
    value
        .as_str()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

fn fallback(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => left.to_string().cmp(&right.to_string()),
    }
}
