//! Postgres engine.
//!
//! Every table has the same physical shape: `id TEXT PRIMARY KEY`, the
//! serialized record in `data JSONB` and a mirrored `deleted_at` column.
//! Columns are read with `data->>'name'` cast by field kind, and unique
//! fields get partial unique indexes over live rows.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row as _};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::application::filter::{Combinator, Condition, parse_time};
use crate::application::store::{
    Direction, OrderBy, Plan, RawFilter, Row, Seek, Store, StoreError, Transaction,
};
use crate::domain::base::{DELETED_AT, ID};
use crate::domain::{FieldKind, Schema};

use super::util::{map_sqlx_error, unique_index_name, validate_identifier};

#[derive(Clone)]
pub struct PostgresStore {
    name: String,
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(name, pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_table(&self, table: &str, schema: &Schema) -> Result<(), StoreError> {
        let table = validate_identifier(table)?;
        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                id TEXT PRIMARY KEY, \
                data JSONB NOT NULL, \
                deleted_at TIMESTAMPTZ NULL\
            )"
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        for field in schema.unique_fields() {
            let column = validate_identifier(field.name)?;
            let index = unique_index_name(table, column);
            let statement = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"{index}\" ON \"{table}\" \
                 ((data->>'{column}')) WHERE deleted_at IS NULL"
            );
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        debug!(target = "trellis::store", table, "postgres table ensured");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

/// SQL expression reading `column`, cast to its declared kind.
fn column_expr(schema: &Schema, column: &str) -> Result<String, StoreError> {
    let column = validate_identifier(column)?;
    if column == ID {
        return Ok("id".to_string());
    }
    if column == DELETED_AT {
        return Ok("deleted_at".to_string());
    }
    let kind = schema
        .column(column)
        .map(|field| field.kind)
        .unwrap_or(FieldKind::Json);
    Ok(match kind {
        FieldKind::String => format!("(data->>'{column}')"),
        FieldKind::Int => format!("((data->>'{column}')::bigint)"),
        FieldKind::Float => format!("((data->>'{column}')::double precision)"),
        FieldKind::Bool => format!("((data->>'{column}')::boolean)"),
        FieldKind::Time => format!("((data->>'{column}')::timestamptz)"),
        FieldKind::Json => format!("(data->'{column}')"),
    })
}

fn column_kind(schema: &Schema, column: &str) -> FieldKind {
    match column {
        ID => FieldKind::String,
        DELETED_AT => FieldKind::Time,
        _ => schema
            .column(column)
            .map(|field| field.kind)
            .unwrap_or(FieldKind::Json),
    }
}

fn invalid(kind: FieldKind, value: &Value) -> StoreError {
    StoreError::InvalidInput(format!("`{value}` is not a valid {} value", kind.as_str()))
}

/// Bind `value` with the SQL type matching `kind`.
fn push_typed(
    qb: &mut QueryBuilder<'static, Postgres>,
    kind: FieldKind,
    value: &Value,
) -> Result<(), StoreError> {
    match (kind, value) {
        (_, Value::Null) => {
            qb.push("NULL");
        }
        (FieldKind::String, Value::String(s)) => {
            qb.push_bind(s.clone());
        }
        (FieldKind::String, other) => {
            qb.push_bind(other.to_string());
        }
        (FieldKind::Int, other) => {
            let parsed = other
                .as_i64()
                .or_else(|| other.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| invalid(kind, other))?;
            qb.push_bind(parsed);
        }
        (FieldKind::Float, other) => {
            let parsed = other
                .as_f64()
                .or_else(|| other.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| invalid(kind, other))?;
            qb.push_bind(parsed);
        }
        (FieldKind::Bool, other) => {
            let parsed = other
                .as_bool()
                .or_else(|| other.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| invalid(kind, other))?;
            qb.push_bind(parsed);
        }
        (FieldKind::Time, other) => {
            let parsed = parse_time(other).ok_or_else(|| invalid(kind, other))?;
            qb.push_bind(parsed);
        }
        (FieldKind::Json, other) => {
            qb.push_bind(Json(other.clone()));
        }
    }
    Ok(())
}

/// Bind a raw-filter argument by its JSON type.
fn push_raw_arg(qb: &mut QueryBuilder<'static, Postgres>, value: &Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        other => {
            qb.push_bind(Json(other.clone()));
        }
    }
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn push_condition(
    qb: &mut QueryBuilder<'static, Postgres>,
    schema: &Schema,
    condition: &Condition,
) -> Result<(), StoreError> {
    let expr = column_expr(schema, condition.column())?;
    let kind = column_kind(schema, condition.column());
    match condition {
        Condition::Eq { value, .. } if value.is_null() => {
            qb.push(format!("{expr} IS NULL"));
        }
        Condition::Eq { value, .. } => {
            qb.push(format!("{expr} = "));
            push_typed(qb, kind, value)?;
        }
        Condition::In { values, .. } if values.is_empty() => {
            qb.push("FALSE");
        }
        Condition::NotIn { values, .. } if values.is_empty() => {
            qb.push("TRUE");
        }
        Condition::In { values, .. } => {
            qb.push(format!("{expr} IN ("));
            push_list(qb, kind, values)?;
            qb.push(")");
        }
        Condition::NotIn { values, .. } => {
            qb.push(format!("({expr} IS NULL OR {expr} NOT IN ("));
            push_list(qb, kind, values)?;
            qb.push("))");
        }
        Condition::Contains { needle, .. } => {
            qb.push(format!("(data->>'{}') LIKE ", validate_identifier(condition.column())?));
            qb.push_bind(escape_like(needle));
        }
    }
    Ok(())
}

fn push_list(
    qb: &mut QueryBuilder<'static, Postgres>,
    kind: FieldKind,
    values: &[Value],
) -> Result<(), StoreError> {
    for (position, value) in values.iter().enumerate() {
        if position > 0 {
            qb.push(", ");
        }
        push_typed(qb, kind, value)?;
    }
    Ok(())
}

/// Raw SQL with `?` placeholders bound in order.
fn push_raw(qb: &mut QueryBuilder<'static, Postgres>, raw: &RawFilter) -> Result<(), StoreError> {
    let parts: Vec<&str> = raw.sql.split('?').collect();
    if parts.len() - 1 != raw.args.len() {
        return Err(StoreError::InvalidInput(format!(
            "raw filter has {} placeholders but {} arguments",
            parts.len() - 1,
            raw.args.len()
        )));
    }
    qb.push("(");
    for (position, part) in parts.iter().enumerate() {
        qb.push(*part);
        if let Some(arg) = raw.args.get(position) {
            push_raw_arg(qb, arg);
        }
    }
    qb.push(")");
    Ok(())
}

/// `FROM "table" WHERE ...` for `plan`, without ordering or paging.
fn push_where(
    qb: &mut QueryBuilder<'static, Postgres>,
    plan: &Plan,
) -> Result<(), StoreError> {
    let table = validate_identifier(&plan.table)?;
    let schema = plan.schema;
    qb.push(format!(" FROM \"{table}\" WHERE TRUE"));
    if !plan.include_deleted {
        qb.push(" AND deleted_at IS NULL");
    }
    for guard in &plan.guards {
        qb.push(" AND ");
        push_condition(qb, schema, guard)?;
    }
    if !plan.filters.is_empty() {
        let joiner = match plan.filters.combinator {
            Combinator::And => " AND ",
            Combinator::Or => " OR ",
        };
        qb.push(" AND (");
        for (position, condition) in plan.filters.conditions.iter().enumerate() {
            if position > 0 {
                qb.push(joiner);
            }
            push_condition(qb, schema, condition)?;
        }
        qb.push(")");
    }
    if let Some(range) = &plan.time_range {
        let expr = column_expr(schema, &range.column)?;
        if let Some(start) = range.start {
            qb.push(format!(" AND {expr} >= "));
            qb.push_bind(start);
        }
        if let Some(end) = range.end {
            qb.push(format!(" AND {expr} <= "));
            qb.push_bind(end);
        }
    }
    for raw in &plan.raw {
        qb.push(" AND ");
        push_raw(qb, raw)?;
    }
    if let Some(seek) = &plan.seek
        && !seek.keys.is_empty()
    {
        qb.push(" AND ");
        push_seek(qb, schema, seek)?;
    }
    Ok(())
}

/// Lexicographic "strictly after" over the seek keys, expanded into
/// `k1 past v1 OR (k1 = v1 AND k2 past v2) OR ...` so each key keeps its own
/// direction. Nulls sort first, matching the `ORDER BY` clause.
fn push_seek(
    qb: &mut QueryBuilder<'static, Postgres>,
    schema: &Schema,
    seek: &Seek,
) -> Result<(), StoreError> {
    let keys: Vec<(&OrderBy, &Value)> = seek.keys.iter().zip(&seek.values).collect();
    qb.push("(");
    for position in 0..keys.len() {
        if position > 0 {
            qb.push(" OR ");
        }
        qb.push("(");
        for (key, bound) in &keys[..position] {
            let expr = column_expr(schema, &key.column)?;
            if bound.is_null() {
                qb.push(format!("{expr} IS NULL AND "));
            } else {
                qb.push(format!("{expr} = "));
                push_typed(qb, column_kind(schema, &key.column), bound)?;
                qb.push(" AND ");
            }
        }
        let (key, bound) = keys[position];
        let expr = column_expr(schema, &key.column)?;
        match (key.direction, bound.is_null()) {
            (Direction::Asc, true) => {
                qb.push(format!("{expr} IS NOT NULL"));
            }
            (Direction::Asc, false) => {
                qb.push(format!("{expr} > "));
                push_typed(qb, column_kind(schema, &key.column), bound)?;
            }
            (Direction::Desc, true) => {
                qb.push("FALSE");
            }
            (Direction::Desc, false) => {
                qb.push(format!("({expr} < "));
                push_typed(qb, column_kind(schema, &key.column), bound)?;
                qb.push(format!(" OR {expr} IS NULL)"));
            }
        }
        qb.push(")");
    }
    qb.push(")");
    Ok(())
}

fn decode_row(row: PgRow) -> Result<Row, StoreError> {
    let Json(data): Json<Value> = row.try_get("data").map_err(map_sqlx_error)?;
    match data {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "stored record is not an object: {other}"
        ))),
    }
}

fn timestamp(at: OffsetDateTime) -> Result<String, StoreError> {
    at.format(&Rfc3339)
        .map_err(|err| StoreError::Serialization(err.to_string()))
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn upsert(
        &mut self,
        table: &str,
        _schema: &Schema,
        rows: Vec<Row>,
    ) -> Result<(), StoreError> {
        let table = validate_identifier(table)?;
        // One statement cannot touch the same id twice; the last write wins.
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, Row> = HashMap::new();
        for row in rows {
            let id = row
                .get(ID)
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| StoreError::InvalidInput("row without id".to_string()))?
                .to_string();
            if latest.insert(id.clone(), row).is_none() {
                order.push(id);
            }
        }
        if order.is_empty() {
            return Ok(());
        }

        let mut values = Vec::with_capacity(order.len());
        for id in order {
            if let Some(row) = latest.remove(&id) {
                let deleted_at = row.get(DELETED_AT).and_then(parse_time);
                values.push((id, Value::Object(row), deleted_at));
            }
        }

        let mut qb: QueryBuilder<'static, Postgres> =
            QueryBuilder::new(format!("INSERT INTO \"{table}\" (id, data, deleted_at) "));
        qb.push_values(values, |mut b, (id, data, deleted_at)| {
            b.push_bind(id).push_bind(Json(data)).push_bind(deleted_at);
        });
        qb.push(format!(
            " ON CONFLICT (id) DO UPDATE SET \
             data = EXCLUDED.data || jsonb_strip_nulls(jsonb_build_object('created_at', \"{table}\".data->'created_at')), \
             deleted_at = EXCLUDED.deleted_at"
        ));
        qb.build()
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn select(&mut self, plan: &Plan) -> Result<Vec<Row>, StoreError> {
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new("SELECT data");
        push_where(&mut qb, plan)?;
        if let Some(index) = &plan.index_hint {
            debug!(
                target = "trellis::store",
                index = %index,
                "postgres plans its own indexes; hint ignored"
            );
        }
        if !plan.order.is_empty() {
            let mut clauses = Vec::with_capacity(plan.order.len());
            for clause in &plan.order {
                let expr = column_expr(plan.schema, &clause.column)?;
                let nulls = match clause.direction {
                    Direction::Asc => "NULLS FIRST",
                    Direction::Desc => "NULLS LAST",
                };
                clauses.push(format!("{expr} {} {nulls}", clause.direction.as_sql()));
            }
            qb.push(format!(" ORDER BY {}", clauses.join(", ")));
        }
        if let Some(limit) = plan.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if plan.offset > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(i64::try_from(plan.offset).unwrap_or(i64::MAX));
        }
        if plan.lock {
            qb.push(" FOR UPDATE");
        }
        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn count(&mut self, plan: &Plan) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new("SELECT COUNT(*)");
        push_where(&mut qb, plan)?;
        let total: i64 = qb
            .build_query_scalar()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        u64::try_from(total)
            .map_err(|_| StoreError::from_persistence("count exceeds supported range"))
    }

    async fn set_column(
        &mut self,
        table: &str,
        id: &str,
        column: &str,
        value: Value,
        updated_at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let table = validate_identifier(table)?;
        let column = validate_identifier(column)?;
        let statement = format!(
            "UPDATE \"{table}\" SET data = jsonb_set(data, ARRAY[$1]::text[], $2::jsonb, true) \
             || jsonb_build_object('updated_at', $3::text) \
             WHERE id = $4 AND deleted_at IS NULL"
        );
        let result = sqlx::query(&statement)
            .bind(column)
            .bind(Json(value))
            .bind(timestamp(updated_at)?)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn soft_delete(
        &mut self,
        table: &str,
        ids: &[String],
        at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let table = validate_identifier(table)?;
        let statement = format!(
            "UPDATE \"{table}\" SET deleted_at = $1, \
             data = data || jsonb_build_object('deleted_at', $2::text, 'updated_at', $2::text) \
             WHERE id = ANY($3) AND deleted_at IS NULL"
        );
        let result = sqlx::query(&statement)
            .bind(at)
            .bind(timestamp(at)?)
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn purge(&mut self, table: &str, ids: &[String]) -> Result<u64, StoreError> {
        let table = validate_identifier(table)?;
        let statement = format!("DELETE FROM \"{table}\" WHERE id = ANY($1)");
        let result = sqlx::query(&statement)
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn cleanup(&mut self, table: &str) -> Result<u64, StoreError> {
        let table = validate_identifier(table)?;
        let statement = format!("DELETE FROM \"{table}\" WHERE deleted_at IS NOT NULL");
        let result = sqlx::query(&statement)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
