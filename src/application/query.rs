//! Query-string decoding into a list descriptor.

use serde::Serialize;
use serde_json::Value;
use time::{PrimitiveDateTime, format_description::FormatItem, macros::format_description};
use tracing::debug;
use trellis_api_types::params;

use crate::config::CrudSettings;
use crate::domain::schema::{Field, FieldKind, Schema};

use super::cursor::CursorQuery;
use super::error::Error;
use super::filter::Condition;
use super::store::{Direction, OrderBy, TimeRange};

const DATETIME_LAYOUT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Structured form of a list request.
///
/// Serialized as part of list cache keys, so two requests with the same
/// descriptor share one cache entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub expand: Vec<String>,
    pub depth: Option<u32>,
    pub fuzzy: bool,
    pub sort: Vec<OrderBy>,
    pub nocache: bool,
    pub time_range: Option<TimeRange>,
    pub or: bool,
    pub index: Option<String>,
    pub select: Vec<String>,
    pub nototal: bool,
    pub cursor: Option<CursorQuery>,
    pub show_deleted: bool,
    pub filters: Vec<Condition>,
}

impl ListQuery {
    /// Decode query pairs against `schema`.
    ///
    /// Reserved names configure the descriptor; other names that match a
    /// filterable field become equality filters, the rest are ignored.
    pub fn decode(
        pairs: &[(String, String)],
        schema: &Schema,
        limits: &CrudSettings,
    ) -> Result<Self, Error> {
        let mut query = ListQuery::default();
        let mut column_name: Option<String> = None;
        let mut start_time = None;
        let mut end_time = None;
        let mut cursor_value: Option<String> = None;
        let mut cursor_fields: Vec<String> = Vec::new();
        let mut cursor_next = true;

        for (name, value) in pairs {
            match name.as_str() {
                params::PAGE => query.page = Some(parse_positive(name, value)?),
                params::SIZE => {
                    let size = parse_positive(name, value)?;
                    query.size = Some(size.min(limits.max_page_size));
                }
                params::EXPAND => {
                    query.expand = split_csv(value);
                    for relation in &query.expand {
                        if schema.relation_named(relation).is_none() {
                            return Err(Error::bad_request(format!(
                                "`{relation}` is not an expandable relation"
                            )));
                        }
                    }
                }
                params::DEPTH => {
                    let depth: u32 = value.trim().parse().map_err(|_| {
                        Error::bad_request(format!("`{name}` must be a non-negative integer"))
                    })?;
                    query.depth = Some(depth.min(limits.max_expand_depth));
                }
                params::FUZZY => query.fuzzy = parse_bool(name, value)?,
                params::SORT_BY => query.sort = parse_sort(value, schema)?,
                params::NO_CACHE => query.nocache = parse_bool(name, value)?,
                params::COLUMN_NAME => {
                    let column = value.trim();
                    column_name = (!column.is_empty()).then(|| column.to_string());
                }
                params::START_TIME => start_time = parse_datetime(name, value)?,
                params::END_TIME => end_time = parse_datetime(name, value)?,
                params::OR => query.or = parse_bool(name, value)?,
                params::INDEX => {
                    let index = value.trim();
                    query.index = (!index.is_empty()).then(|| index.to_string());
                }
                params::SELECT => {
                    query.select = split_csv(value);
                    for column in &query.select {
                        ensure_column(schema, column, name)?;
                    }
                }
                params::NO_TOTAL => query.nototal = parse_bool(name, value)?,
                params::CURSOR_VALUE => {
                    let token = value.trim();
                    cursor_value = (!token.is_empty()).then(|| token.to_string());
                }
                params::CURSOR_FIELDS => {
                    cursor_fields = split_csv(value);
                    for column in &cursor_fields {
                        ensure_column(schema, column, name)?;
                    }
                }
                params::CURSOR_NEXT => cursor_next = parse_bool(name, value)?,
                params::SHOW_DELETED => query.show_deleted = parse_bool(name, value)?,
                _ => match schema.filter_field(name) {
                    Some(field) => {
                        if let Some(condition) = parse_filter(field, value)? {
                            query.filters.retain(|existing| existing.column() != field.name);
                            query.filters.push(condition);
                        }
                    }
                    None => debug!(
                        target = "trellis::query",
                        param = %name,
                        "ignoring query parameter that names no filterable field"
                    ),
                },
            }
        }

        if start_time.is_some() || end_time.is_some() {
            let column = column_name.ok_or_else(|| {
                Error::bad_request(format!(
                    "`{}` is required with a time window",
                    params::COLUMN_NAME
                ))
            })?;
            match schema.column(&column) {
                Some(field) if field.kind == FieldKind::Time => {}
                _ => {
                    return Err(Error::bad_request(format!(
                        "`{column}` is not a time column"
                    )));
                }
            }
            query.time_range = Some(TimeRange::new(column, start_time, end_time));
        }

        if cursor_value.is_some() && cursor_fields.is_empty() {
            return Err(Error::bad_request(format!(
                "`{}` requires `{}`",
                params::CURSOR_VALUE,
                params::CURSOR_FIELDS
            )));
        }
        if !cursor_fields.is_empty() {
            if query.page.is_some() {
                return Err(Error::bad_request(format!(
                    "cursor pagination cannot be combined with `{}`",
                    params::PAGE
                )));
            }
            query.cursor = Some(CursorQuery {
                value: cursor_value,
                fields: cursor_fields,
                next: cursor_next,
            });
        }

        Ok(query)
    }

    /// Relation depth to expand, at least one when anything is expanded.
    pub fn expand_depth(&self) -> u32 {
        self.depth.unwrap_or(1).max(1)
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn ensure_column(schema: &Schema, column: &str, param: &str) -> Result<(), Error> {
    if schema.has_column(column) {
        Ok(())
    } else {
        Err(Error::bad_request(format!(
            "`{param}` names unknown column `{column}`"
        )))
    }
}

fn parse_positive(name: &str, value: &str) -> Result<u32, Error> {
    match value.trim().parse::<u32>() {
        Ok(parsed) if parsed >= 1 => Ok(parsed),
        _ => Err(Error::bad_request(format!(
            "`{name}` must be an integer of at least 1"
        ))),
    }
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::bad_request(format!("`{name}` must be a boolean"))),
    }
}

fn parse_datetime(name: &str, value: &str) -> Result<Option<time::OffsetDateTime>, Error> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    PrimitiveDateTime::parse(value, DATETIME_LAYOUT)
        .map(|parsed| Some(parsed.assume_utc()))
        .map_err(|err| {
            Error::bad_request(format!(
                "`{name}` must use the `YYYY-MM-DD HH:MM:SS` layout: {err}"
            ))
        })
}

fn parse_sort(value: &str, schema: &Schema) -> Result<Vec<OrderBy>, Error> {
    split_csv(value)
        .into_iter()
        .map(|clause| {
            let mut parts = clause.split_whitespace();
            let column = parts.next().unwrap_or_default();
            ensure_column(schema, column, params::SORT_BY)?;
            let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => Direction::Asc,
                Some("desc") => Direction::Desc,
                Some(other) => {
                    return Err(Error::bad_request(format!(
                        "unknown sort direction `{other}`"
                    )));
                }
            };
            if parts.next().is_some() {
                return Err(Error::bad_request(format!(
                    "malformed sort clause `{clause}`"
                )));
            }
            Ok(OrderBy {
                column: column.to_string(),
                direction,
            })
        })
        .collect()
}

/// Parse one filter value; zero values of non-optional fields yield `None`.
fn parse_filter(field: &Field, raw: &str) -> Result<Option<Condition>, Error> {
    let invalid = |expected: &str| {
        Error::bad_request(format!("filter `{}` expects {expected}", field.name))
    };
    let value = match field.kind {
        FieldKind::String | FieldKind::Json => Value::String(raw.to_string()),
        FieldKind::Int => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid("an integer"))?,
        FieldKind::Float => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid("a number"))?,
        FieldKind::Bool => Value::Bool(parse_bool(field.name, raw).map_err(|_| invalid("a boolean"))?),
        FieldKind::Time => match parse_datetime(field.name, raw)? {
            Some(at) => at
                .format(&time::format_description::well_known::Rfc3339)
                .map(Value::String)
                .map_err(|err| Error::internal(err.to_string()))?,
            None => Value::String(String::new()),
        },
    };
    if !field.is_set(&value) {
        return Ok(None);
    }
    Ok(Some(Condition::eq(field.name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::Relation;
    use serde_json::json;
    use time::macros::datetime;

    fn schema() -> Schema {
        Schema::new()
            .field(Field::string("name").filterable())
            .field(Field::string("email").optional().filterable())
            .field(Field::int("age").filterable())
            .field(Field::bool("active").filterable())
            .relation(Relation::belongs_to("group", "groups", "group_id"))
    }

    fn decode(pairs: &[(&str, &str)]) -> Result<ListQuery, Error> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ListQuery::decode(&pairs, &schema(), &CrudSettings::default())
    }

    #[test]
    fn reserved_parameters_populate_the_descriptor() {
        let query = decode(&[
            ("page", "2"),
            ("size", "5"),
            ("_expand", "group"),
            ("_depth", "2"),
            ("_fuzzy", "true"),
            ("_sortby", "name desc, age"),
            ("_select", "name,age"),
            ("_nototal", "1"),
            ("_index", "idx_users_name"),
        ])
        .expect("decode");
        assert_eq!(query.page, Some(2));
        assert_eq!(query.size, Some(5));
        assert_eq!(query.expand, vec!["group"]);
        assert_eq!(query.expand_depth(), 2);
        assert!(query.fuzzy && query.nototal);
        assert_eq!(query.sort, vec![OrderBy::desc("name"), OrderBy::asc("age")]);
        assert_eq!(query.select, vec!["name", "age"]);
        assert_eq!(query.index.as_deref(), Some("idx_users_name"));
    }

    #[test]
    fn size_is_clamped_and_zero_rejected() {
        assert_eq!(decode(&[("size", "50000")]).expect("decode").size, Some(1000));
        assert!(matches!(decode(&[("size", "0")]), Err(Error::BadRequest(_))));
        assert!(matches!(decode(&[("page", "0")]), Err(Error::BadRequest(_))));
    }

    #[test]
    fn zero_values_follow_the_optional_rule() {
        let query = decode(&[("name", ""), ("age", "0"), ("email", ""), ("active", "false")])
            .expect("decode");
        assert_eq!(query.filters, vec![Condition::eq("email", json!(""))]);
    }

    #[test]
    fn unknown_parameters_are_ignored_but_bad_values_rejected() {
        let query = decode(&[("nickname", "x"), ("name", "u3")]).expect("decode");
        assert_eq!(query.filters, vec![Condition::eq("name", json!("u3"))]);
        assert!(matches!(decode(&[("age", "old")]), Err(Error::BadRequest(_))));
    }

    #[test]
    fn time_window_is_swapped_and_needs_a_time_column() {
        let query = decode(&[
            ("_column_name", "created_at"),
            ("_start_time", "2024-02-01 00:00:00"),
            ("_end_time", "2024-01-01 00:00:00"),
        ])
        .expect("decode");
        let range = query.time_range.expect("range");
        assert_eq!(range.start, Some(datetime!(2024-01-01 00:00:00 UTC)));
        assert_eq!(range.end, Some(datetime!(2024-02-01 00:00:00 UTC)));

        assert!(decode(&[("_start_time", "2024-01-01 00:00:00")]).is_err());
        assert!(
            decode(&[("_column_name", "name"), ("_start_time", "2024-01-01 00:00:00")]).is_err()
        );
        assert!(decode(&[("_column_name", "created_at"), ("_start_time", "yesterday")]).is_err());
    }

    #[test]
    fn cursor_excludes_page_and_requires_fields() {
        let query = decode(&[("_cursor_fields", "age"), ("_cursor_next", "false")]).expect("decode");
        let cursor = query.cursor.expect("cursor");
        assert_eq!(cursor.fields, vec!["age"]);
        assert!(!cursor.next);

        assert!(decode(&[("_cursor_fields", "age"), ("page", "1")]).is_err());
        assert!(decode(&[("_cursor_value", "abc")]).is_err());
    }

    #[test]
    fn unknown_columns_in_reserved_lists_are_rejected() {
        assert!(decode(&[("_sortby", "nickname")]).is_err());
        assert!(decode(&[("_sortby", "name sideways")]).is_err());
        assert!(decode(&[("_select", "nickname")]).is_err());
        assert!(decode(&[("_expand", "friends")]).is_err());
    }
}
