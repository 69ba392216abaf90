//! Relation expansion.
//!
//! Each level issues one `IN` lookup per relation, whatever the number of
//! parent rows. The first level expands the relations the caller named;
//! deeper levels expand every relation of the target model.

use std::collections::HashSet;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::application::error::Error;
use crate::application::filter::{Condition, values_equal};
use crate::application::registry::ModelRegistry;
use crate::application::store::{OrderBy, Plan, Row, Transaction};
use crate::domain::base::ID;
use crate::domain::{FieldKind, Schema};

pub(crate) fn expand_rows<'t>(
    txn: &'t mut dyn Transaction,
    models: &'t ModelRegistry,
    schema: &'static Schema,
    rows: &'t mut [Row],
    names: &'t [String],
    depth: u32,
) -> BoxFuture<'t, Result<(), Error>> {
    Box::pin(async move {
        if rows.is_empty() || names.is_empty() || depth == 0 {
            return Ok(());
        }
        for name in names {
            let relation = schema.relation_named(name).ok_or_else(|| {
                Error::bad_request(format!("`{name}` is not an expandable relation"))
            })?;
            let target = models.entry_for_table(relation.target).ok_or_else(|| {
                Error::internal(format!(
                    "relation `{name}` targets unregistered table `{}`",
                    relation.target
                ))
            })?;

            let mut seen = HashSet::new();
            let keys: Vec<Value> = rows
                .iter()
                .filter_map(|row| row.get(relation.local_field))
                .filter(|value| !value.is_null())
                .filter(|value| seen.insert(value.to_string()))
                .cloned()
                .collect();

            let mut related = if keys.is_empty() {
                Vec::new()
            } else {
                let mut plan = Plan::new(target.table.clone(), target.schema);
                plan.guards.push(Condition::In {
                    column: relation.foreign_field.to_string(),
                    values: keys,
                });
                plan.order = vec![OrderBy::asc(ID)];
                txn.select(&plan).await?
            };

            if depth > 1 {
                let nested: Vec<String> = target
                    .schema
                    .relations
                    .iter()
                    .map(|relation| relation.name.to_string())
                    .collect();
                expand_rows(
                    &mut *txn,
                    models,
                    target.schema,
                    &mut related,
                    &nested,
                    depth - 1,
                )
                .await?;
            }

            for row in rows.iter_mut() {
                let key = row.get(relation.local_field).cloned().unwrap_or(Value::Null);
                let mut matches = related.iter().filter(|candidate| {
                    !key.is_null()
                        && values_equal(
                            FieldKind::String,
                            candidate.get(relation.foreign_field).unwrap_or(&Value::Null),
                            &key,
                        )
                });
                let value = if relation.many {
                    Value::Array(matches.map(|m| Value::Object(m.clone())).collect())
                } else {
                    matches
                        .next()
                        .map(|m| Value::Object(m.clone()))
                        .unwrap_or(Value::Null)
                };
                row.insert(relation.name.to_string(), value);
            }
        }
        Ok(())
    })
}
