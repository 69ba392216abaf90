//! In-process engine.
//!
//! One mutex guards every table. A transaction holds the lock for its whole
//! life and writes into a lazily cloned working copy that replaces the
//! shared state on commit, so units of work are serializable and a dropped
//! transaction leaves no trace. Raw predicates are not supported.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::application::filter::{column_kind, compare_values, parse_time, values_equal};
use crate::application::store::{Direction, Plan, Row, Seek, Store, StoreError, Transaction};
use crate::domain::Schema;
use crate::domain::base::{CREATED_AT, DELETED_AT, ID, UPDATED_AT};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, Row>>,
}

#[derive(Clone)]
pub struct MemoryStore {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_table(&self, table: &str, _schema: &Schema) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            working: None,
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    /// Copy of the shared state taken on the first write.
    working: Option<MemoryState>,
}

impl MemoryTransaction {
    fn view(&self) -> &MemoryState {
        self.working.as_ref().unwrap_or(&*self.guard)
    }

    fn view_mut(&mut self) -> &mut MemoryState {
        let guard = &self.guard;
        self.working.get_or_insert_with(|| (**guard).clone())
    }

    fn table_mut(&mut self, table: &str) -> &mut BTreeMap<String, Row> {
        self.view_mut().tables.entry(table.to_string()).or_default()
    }

    fn matching(&self, plan: &Plan) -> Result<Vec<Row>, StoreError> {
        if !plan.raw.is_empty() {
            return Err(StoreError::Unsupported(
                "raw predicates need a SQL engine".to_string(),
            ));
        }
        let Some(rows) = self.view().tables.get(&plan.table) else {
            return Ok(Vec::new());
        };
        let schema = plan.schema;
        Ok(rows
            .values()
            .filter(|row| plan.include_deleted || !is_deleted(row))
            .filter(|row| plan.guards.iter().all(|guard| guard.matches(row, schema)))
            .filter(|row| plan.filters.matches(row, schema))
            .filter(|row| match &plan.time_range {
                Some(range) => row
                    .get(&range.column)
                    .and_then(parse_time)
                    .is_some_and(|at| range.contains(at)),
                None => true,
            })
            .filter(|row| match &plan.seek {
                Some(seek) => past_seek(row, seek, schema),
                None => true,
            })
            .cloned()
            .collect())
    }
}

fn is_deleted(row: &Row) -> bool {
    row.get(DELETED_AT).is_some_and(|value| !value.is_null())
}

fn row_id(row: &Row) -> &str {
    row.get(ID).and_then(Value::as_str).unwrap_or_default()
}

fn timestamp(at: OffsetDateTime) -> Result<Value, StoreError> {
    at.format(&Rfc3339)
        .map(Value::String)
        .map_err(|err| StoreError::Serialization(err.to_string()))
}

/// Whether `row` sorts strictly after the seek position.
fn past_seek(row: &Row, seek: &Seek, schema: &Schema) -> bool {
    for (key, bound) in seek.keys.iter().zip(&seek.values) {
        let actual = row.get(&key.column).unwrap_or(&Value::Null);
        let ordering = compare_values(column_kind(schema, &key.column), actual, bound);
        match (ordering, key.direction) {
            (Ordering::Equal, _) => continue,
            (Ordering::Greater, Direction::Asc) | (Ordering::Less, Direction::Desc) => return true,
            _ => return false,
        }
    }
    false
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn upsert(
        &mut self,
        table: &str,
        schema: &Schema,
        rows: Vec<Row>,
    ) -> Result<(), StoreError> {
        let unique: Vec<_> = schema.unique_fields().collect();
        let stored = self.table_mut(table);
        for mut row in rows {
            let id = row_id(&row).to_string();
            if id.is_empty() {
                return Err(StoreError::InvalidInput("row without id".to_string()));
            }
            if !is_deleted(&row) {
                for field in &unique {
                    let Some(value) = row.get(field.name).filter(|value| !value.is_null()) else {
                        continue;
                    };
                    let taken = stored.values().any(|other| {
                        row_id(other) != id
                            && !is_deleted(other)
                            && other
                                .get(field.name)
                                .is_some_and(|existing| values_equal(field.kind, existing, value))
                    });
                    if taken {
                        return Err(StoreError::Duplicate {
                            table: table.to_string(),
                            field: field.name.to_string(),
                        });
                    }
                }
            }
            if let Some(created_at) = stored
                .get(&id)
                .and_then(|existing| existing.get(CREATED_AT))
                .filter(|value| !value.is_null())
            {
                row.insert(CREATED_AT.to_string(), created_at.clone());
            }
            stored.insert(id, row);
        }
        Ok(())
    }

    async fn select(&mut self, plan: &Plan) -> Result<Vec<Row>, StoreError> {
        let mut rows = self.matching(plan)?;
        if !plan.order.is_empty() {
            let schema = plan.schema;
            rows.sort_by(|left, right| {
                for clause in &plan.order {
                    let kind = column_kind(schema, &clause.column);
                    let ordering = compare_values(
                        kind,
                        left.get(&clause.column).unwrap_or(&Value::Null),
                        right.get(&clause.column).unwrap_or(&Value::Null),
                    );
                    let ordering = match clause.direction {
                        Direction::Asc => ordering,
                        Direction::Desc => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }
        let rows = rows.into_iter().skip(plan.offset);
        Ok(match plan.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn count(&mut self, plan: &Plan) -> Result<u64, StoreError> {
        Ok(self.matching(plan)?.len() as u64)
    }

    async fn set_column(
        &mut self,
        table: &str,
        id: &str,
        column: &str,
        value: Value,
        updated_at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let live = self
            .view()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .is_some_and(|row| !is_deleted(row));
        if !live {
            return Ok(0);
        }
        let updated_at = timestamp(updated_at)?;
        if let Some(row) = self.table_mut(table).get_mut(id) {
            row.insert(column.to_string(), value);
            row.insert(UPDATED_AT.to_string(), updated_at);
        }
        Ok(1)
    }

    async fn soft_delete(
        &mut self,
        table: &str,
        ids: &[String],
        at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let at = timestamp(at)?;
        let rows = self.table_mut(table);
        let mut affected = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id)
                && !is_deleted(row)
            {
                row.insert(DELETED_AT.to_string(), at.clone());
                row.insert(UPDATED_AT.to_string(), at.clone());
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn purge(&mut self, table: &str, ids: &[String]) -> Result<u64, StoreError> {
        let rows = self.table_mut(table);
        Ok(ids.iter().filter(|id| rows.remove(*id).is_some()).count() as u64)
    }

    async fn cleanup(&mut self, table: &str) -> Result<u64, StoreError> {
        let rows = self.table_mut(table);
        let before = rows.len();
        rows.retain(|_, row| !is_deleted(row));
        Ok((before - rows.len()) as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if let Some(working) = self.working.take() {
            *self.guard = working;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::filter::Condition;
    use crate::application::store::OrderBy;
    use crate::domain::Field;
    use once_cell::sync::Lazy;
    use serde_json::json;

    static PEOPLE: Lazy<Schema> = Lazy::new(|| {
        Schema::new()
            .field(Field::string("name").filterable())
            .field(Field::string("email").optional().unique())
            .field(Field::int("age"))
    });

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::default();
        store.ensure_table("people", &PEOPLE).await.expect("table");
        let mut tx = store.begin().await.expect("begin");
        tx.upsert(
            "people",
            &PEOPLE,
            vec![
                row(json!({ "id": "a", "name": "ann", "age": 30, "email": "ann@x" })),
                row(json!({ "id": "b", "name": "bob", "age": 25, "email": null })),
                row(json!({ "id": "c", "name": "cy", "age": 30, "email": null })),
            ],
        )
        .await
        .expect("upsert");
        tx.commit().await.expect("commit");
        store
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = seeded().await;
        {
            let mut tx = store.begin().await.expect("begin");
            tx.purge("people", &["a".to_string()]).await.expect("purge");
        }
        let mut tx = store.begin().await.expect("begin");
        let plan = Plan::new("people", &PEOPLE);
        assert_eq!(tx.count(&plan).await.expect("count"), 3);
    }

    #[tokio::test]
    async fn unique_fields_ignore_nulls_and_soft_deleted_rows() {
        let store = seeded().await;
        let mut tx = store.begin().await.expect("begin");
        let clash = tx
            .upsert(
                "people",
                &PEOPLE,
                vec![row(json!({ "id": "d", "name": "dup", "age": 1, "email": "ann@x" }))],
            )
            .await;
        assert!(matches!(clash, Err(StoreError::Duplicate { ref field, .. }) if field == "email"));

        tx.soft_delete("people", &["a".to_string()], OffsetDateTime::now_utc())
            .await
            .expect("soft delete");
        tx.upsert(
            "people",
            &PEOPLE,
            vec![row(json!({ "id": "d", "name": "dup", "age": 1, "email": "ann@x" }))],
        )
        .await
        .expect("email is free once the holder is deleted");
    }

    #[tokio::test]
    async fn ordering_paging_and_seek() {
        let store = seeded().await;
        let mut tx = store.begin().await.expect("begin");
        let mut plan = Plan::new("people", &PEOPLE);
        plan.order = vec![OrderBy::desc("age"), OrderBy::asc(ID)];
        let ids: Vec<String> = tx
            .select(&plan)
            .await
            .expect("select")
            .iter()
            .map(|row| row_id(row).to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        plan.limit = Some(1);
        plan.offset = 1;
        let page = tx.select(&plan).await.expect("page");
        assert_eq!(row_id(&page[0]), "c");

        let mut seek = Plan::new("people", &PEOPLE);
        seek.order = vec![OrderBy::asc("age"), OrderBy::asc(ID)];
        seek.seek = Some(Seek {
            keys: seek.order.clone(),
            values: vec![json!(30), json!("a")],
        });
        let after = tx.select(&seek).await.expect("seek");
        assert_eq!(after.len(), 1);
        assert_eq!(row_id(&after[0]), "c");
    }

    async fn seek_ids(
        tx: &mut Box<dyn Transaction>,
        keys: Vec<OrderBy>,
        values: Vec<Value>,
    ) -> Vec<String> {
        let mut plan = Plan::new("people", &PEOPLE);
        plan.order = keys.clone();
        plan.seek = Some(Seek { keys, values });
        tx.select(&plan)
            .await
            .expect("seek")
            .iter()
            .map(|row| row_id(row).to_string())
            .collect()
    }

    #[tokio::test]
    async fn seek_follows_each_key_direction() {
        let store = seeded().await;
        let mut tx = store.begin().await.expect("begin");
        let keys = vec![OrderBy::desc("age"), OrderBy::asc("name"), OrderBy::asc(ID)];
        let after = seek_ids(&mut tx, keys, vec![json!(30), json!("ann"), json!("a")]).await;
        assert_eq!(after, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn seek_places_nulls_before_values() {
        let store = seeded().await;
        let mut tx = store.begin().await.expect("begin");

        let ascending = vec![OrderBy::asc("email"), OrderBy::asc(ID)];
        let after = seek_ids(&mut tx, ascending, vec![Value::Null, json!("b")]).await;
        assert_eq!(after, vec!["c", "a"]);

        let descending = vec![OrderBy::desc("email"), OrderBy::asc(ID)];
        let after = seek_ids(
            &mut tx,
            descending.clone(),
            vec![json!("ann@x"), json!("a")],
        )
        .await;
        assert_eq!(after, vec!["b", "c"]);
        let after = seek_ids(&mut tx, descending, vec![Value::Null, json!("c")]).await;
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_raw_filters_are_unsupported() {
        let store = seeded().await;
        let mut tx = store.begin().await.expect("begin");
        tx.set_column(
            "people",
            "a",
            CREATED_AT,
            json!("2020-01-01T00:00:00Z"),
            OffsetDateTime::now_utc(),
        )
        .await
        .expect("stamp");
        tx.upsert(
            "people",
            &PEOPLE,
            vec![row(json!({
                "id": "a",
                "name": "ann2",
                "age": 31,
                "created_at": "2030-01-01T00:00:00Z",
            }))],
        )
        .await
        .expect("replace");
        let plan = Plan::new("people", &PEOPLE).with_ids(&["a".to_string()]);
        let rows = tx.select(&plan).await.expect("select");
        assert_eq!(rows[0]["created_at"], "2020-01-01T00:00:00Z");
        assert_eq!(rows[0]["name"], "ann2");

        let mut raw = Plan::new("people", &PEOPLE);
        raw.raw.push(crate::application::store::RawFilter {
            sql: "age > ?".into(),
            args: vec![json!(1)],
        });
        assert!(matches!(tx.select(&raw).await, Err(StoreError::Unsupported(_))));

        let mut filtered = Plan::new("people", &PEOPLE);
        filtered.guards.push(Condition::NotIn {
            column: "name".into(),
            values: vec![json!("ann2")],
        });
        assert_eq!(tx.count(&filtered).await.expect("count"), 2);
    }
}
