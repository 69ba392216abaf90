//! Mutating operations.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, debug_span, warn};
use uuid::Uuid;

use crate::application::error::Error;
use crate::application::store::{Plan, Row, Store, Transaction};
use crate::domain::base::{CREATED_AT, CREATED_BY, DELETED_AT, ID, UPDATED_AT, UPDATED_BY};
use crate::domain::{Model, Schema};

use super::{Database, Invalidation, from_row, to_row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Update,
    Partial,
}

impl WriteMode {
    fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Create => "create",
            WriteMode::Update => "update",
            WriteMode::Partial => "update_partial",
        }
    }

    fn after_phase(&self) -> &'static str {
        match self {
            WriteMode::Create => "create_after",
            WriteMode::Update | WriteMode::Partial => "update_after",
        }
    }
}

/// Audit values stamped on every row of one call.
struct Stamp {
    now: OffsetDateTime,
    actor: String,
}

impl<'a, M: Model> Database<'a, M> {
    /// Insert `items`, assigning ids to those without one.
    ///
    /// Existing ids are replaced as by [`Database::update`].
    pub async fn create(self, items: &mut [M]) -> Result<(), Error> {
        self.save(items, WriteMode::Create).await
    }

    /// Replace every column of `items`; missing ids are inserted.
    pub async fn update(self, items: &mut [M]) -> Result<(), Error> {
        self.save(items, WriteMode::Update).await
    }

    /// Overwrite only the fields of each item that are set.
    ///
    /// Zero values of non-optional fields leave the stored value alone. Every
    /// item needs an id of a live row; on success the items hold the merged
    /// records.
    pub async fn update_partial(self, items: &mut [M]) -> Result<(), Error> {
        self.save(items, WriteMode::Partial).await
    }

    async fn save(self, items: &mut [M], mode: WriteMode) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        let table = self.table_name();
        let store_name = self.store_name();
        let Database {
            db, ctx, opts, tx, ..
        } = self;
        let span = debug_span!(
            parent: ctx.span(),
            "crud.write",
            op = mode.as_str(),
            table = %table,
            items = items.len()
        );
        let ctx = ctx.with_span(span);
        let schema = M::schema();

        match mode {
            WriteMode::Partial => {
                if let Some(position) = items.iter().position(|item| item.id().is_empty()) {
                    return Err(Error::bad_request(format!(
                        "item {position} has no id to update"
                    )));
                }
            }
            WriteMode::Create | WriteMode::Update => {
                for item in items.iter_mut() {
                    if item.base().id.is_empty() {
                        item.base_mut().id = Uuid::now_v7().to_string();
                    }
                }
            }
        }
        ctx.check(false)?;

        if opts.hooks {
            for item in items.iter_mut() {
                match mode {
                    WriteMode::Create => item.create_before(&ctx).await?,
                    WriteMode::Update | WriteMode::Partial => item.update_before(&ctx).await?,
                }
            }
            ctx.check(false)?;
        }

        let stamp = Stamp {
            now: OffsetDateTime::now_utc(),
            actor: ctx.actor().unwrap_or_default().to_string(),
        };
        for item in items.iter_mut() {
            let base = item.base_mut();
            base.created_at.get_or_insert(stamp.now);
            base.updated_at = Some(stamp.now);
            if base.created_by.is_empty() {
                base.created_by.clone_from(&stamp.actor);
            }
            base.updated_by.clone_from(&stamp.actor);
            if mode == WriteMode::Create {
                base.deleted_at = None;
            }
        }
        let rows = items.iter().map(to_row).collect::<Result<Vec<Row>, Error>>()?;
        let ids: Vec<String> = items.iter().map(|item| item.id().to_string()).collect();
        let chunk = opts.limit.unwrap_or(items.len()).max(1);
        let caches = Arc::clone(db.caches());

        match tx {
            Some(tx) => {
                if opts.try_run {
                    debug!(
                        target = "trellis::database",
                        table = %table,
                        "try-run inside a caller transaction skips persistence"
                    );
                    return Ok(());
                }
                for range in chunks(rows.len(), chunk) {
                    let batch = rows[range.clone()].to_vec();
                    let stored = ctx
                        .run(
                            false,
                            write_chunk(tx.transaction(), &table, schema, mode, batch, &stamp),
                        )
                        .await?;
                    absorb(&mut items[range], stored, mode)?;
                }
                tx.defer(Invalidation::for_model::<M>(caches, table.clone(), ids));
            }
            None => {
                let store = db.store(store_name.as_deref())?;
                let mut committed: Vec<String> = Vec::new();
                let mut outcome = Ok(());
                for range in chunks(rows.len(), chunk) {
                    let batch = rows[range.clone()].to_vec();
                    let result = ctx
                        .run(
                            !committed.is_empty(),
                            write_own(
                                store.as_ref(),
                                &table,
                                schema,
                                mode,
                                batch,
                                &stamp,
                                opts.try_run,
                            ),
                        )
                        .await;
                    match result {
                        Ok(stored) => {
                            absorb(&mut items[range.clone()], stored, mode)?;
                            if !opts.try_run {
                                committed.extend_from_slice(&ids[range]);
                            }
                        }
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                if !committed.is_empty() {
                    Invalidation::for_model::<M>(Arc::clone(&caches), table.clone(), committed)
                        .run()
                        .await;
                }
                outcome?;
                if opts.try_run {
                    debug!(target = "trellis::database", table = %table, "try-run rolled back");
                    return Ok(());
                }
            }
        }

        counter!(
            "trellis_crud_writes_total",
            "op" => mode.as_str(),
            "table" => table.clone()
        )
        .increment(items.len() as u64);

        if opts.hooks {
            let after = ctx
                .run(true, async {
                    for item in items.iter() {
                        match mode {
                            WriteMode::Create => item.create_after(&ctx).await?,
                            WriteMode::Update | WriteMode::Partial => {
                                item.update_after(&ctx).await?
                            }
                        }
                    }
                    Ok::<(), Error>(())
                })
                .await;
            if let Err(err) = after {
                return Err(match err {
                    Error::Cancelled { .. } => err,
                    other => Error::after_hook(mode.after_phase(), other),
                });
            }
        }
        Ok(())
    }

    /// Remove `items` by id: soft delete, or physically with `with_purge()`.
    ///
    /// The items are reloaded first so hooks see the stored records.
    pub async fn delete(self, items: &mut [M]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        if let Some(position) = items.iter().position(|item| item.id().is_empty()) {
            return Err(Error::bad_request(format!(
                "item {position} has no id to delete"
            )));
        }
        let table = self.table_name();
        let store_name = self.store_name();
        let Database {
            db, ctx, opts, mut tx, ..
        } = self;
        let span = debug_span!(
            parent: ctx.span(),
            "crud.write",
            op = "delete",
            table = %table,
            items = items.len()
        );
        let ctx = ctx.with_span(span);
        let schema = M::schema();
        let ids: Vec<String> = items.iter().map(|item| item.id().to_string()).collect();
        let lookup = {
            let mut plan = Plan::new(table.clone(), schema).with_ids(&ids);
            plan.include_deleted = opts.purge;
            plan
        };
        let loaded = match tx.as_deref_mut() {
            Some(tx) => ctx.run(false, select_rows(tx.transaction(), &lookup)).await?,
            None => {
                let store = db.store(store_name.as_deref())?;
                ctx.run(false, async {
                    let mut txn = store.begin().await?;
                    let rows = select_rows(txn.as_mut(), &lookup).await?;
                    txn.commit().await?;
                    Ok::<_, Error>(rows)
                })
                .await?
            }
        };
        let mut by_id: HashMap<String, Row> = loaded
            .into_iter()
            .filter_map(|row| Some((row.get(ID)?.as_str()?.to_string(), row)))
            .collect();
        for item in items.iter_mut() {
            let row = by_id
                .remove(item.id())
                .ok_or_else(|| Error::not_found(format!("{table} `{}`", item.id())))?;
            *item = from_row(row)?;
        }

        if opts.hooks {
            for item in items.iter() {
                item.delete_before(&ctx).await?;
            }
            ctx.check(false)?;
        }

        let now = OffsetDateTime::now_utc();
        let chunk = opts.limit.unwrap_or(ids.len()).max(1);
        let caches = Arc::clone(db.caches());
        match tx {
            Some(tx) => {
                if opts.try_run {
                    return Ok(());
                }
                for range in chunks(ids.len(), chunk) {
                    ctx.run(
                        false,
                        remove_chunk(tx.transaction(), &table, &ids[range], opts.purge, now),
                    )
                    .await?;
                }
                tx.defer(Invalidation::for_model::<M>(caches, table.clone(), ids.clone()));
            }
            None => {
                let store = db.store(store_name.as_deref())?;
                let mut committed: Vec<String> = Vec::new();
                let mut outcome = Ok(());
                for range in chunks(ids.len(), chunk) {
                    let batch = &ids[range];
                    let result = ctx
                        .run(!committed.is_empty(), async {
                            let mut txn = store.begin().await?;
                            match remove_chunk(txn.as_mut(), &table, batch, opts.purge, now).await {
                                Ok(()) if opts.try_run => txn.rollback().await?,
                                Ok(()) => txn.commit().await?,
                                Err(err) => {
                                    discard(txn, &table).await;
                                    return Err(err);
                                }
                            }
                            Ok::<(), Error>(())
                        })
                        .await;
                    match result {
                        Ok(()) if !opts.try_run => committed.extend_from_slice(batch),
                        Ok(()) => {}
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                if !committed.is_empty() {
                    Invalidation::for_model::<M>(Arc::clone(&caches), table.clone(), committed)
                        .run()
                        .await;
                }
                outcome?;
                if opts.try_run {
                    return Ok(());
                }
            }
        }

        if !opts.purge {
            for item in items.iter_mut() {
                item.base_mut().deleted_at = Some(now);
            }
        }
        counter!(
            "trellis_crud_writes_total",
            "op" => if opts.purge { "purge" } else { "delete" },
            "table" => table.clone()
        )
        .increment(items.len() as u64);

        if opts.hooks {
            let after = ctx
                .run(true, async {
                    for item in items.iter() {
                        item.delete_after(&ctx).await?;
                    }
                    Ok::<(), Error>(())
                })
                .await;
            if let Err(err) = after {
                return Err(match err {
                    Error::Cancelled { .. } => err,
                    other => Error::after_hook("delete_after", other),
                });
            }
        }
        Ok(())
    }

    /// Set one column of one live row. Hooks do not run.
    pub async fn update_by_id<V: Serialize>(
        self,
        id: &str,
        column: &str,
        value: V,
    ) -> Result<(), Error> {
        let schema = M::schema();
        if id.is_empty() {
            return Err(Error::bad_request("an id is required"));
        }
        if column == ID || !schema.has_column(column) {
            return Err(Error::bad_request(format!(
                "`{column}` is not an updatable column"
            )));
        }
        let value = serde_json::to_value(value)?;
        let table = self.table_name();
        let store_name = self.store_name();
        let Database { db, ctx, tx, .. } = self;
        let now = OffsetDateTime::now_utc();
        let ids = vec![id.to_string()];
        let caches = Arc::clone(db.caches());

        let affected = match tx {
            Some(tx) => {
                let affected = ctx
                    .run(false, async {
                        tx.transaction()
                            .set_column(&table, id, column, value, now)
                            .await
                            .map_err(Error::from)
                    })
                    .await?;
                if affected > 0 {
                    tx.defer(Invalidation::for_model::<M>(caches, table.clone(), ids));
                }
                affected
            }
            None => {
                let store = db.store(store_name.as_deref())?;
                let affected = ctx
                    .run(false, async {
                        let mut txn = store.begin().await?;
                        let affected = txn.set_column(&table, id, column, value, now).await?;
                        txn.commit().await?;
                        Ok::<_, Error>(affected)
                    })
                    .await?;
                if affected > 0 {
                    Invalidation::for_model::<M>(caches, table.clone(), ids)
                        .run()
                        .await;
                }
                affected
            }
        };
        if affected == 0 {
            return Err(Error::not_found(format!("{table} `{id}`")));
        }
        Ok(())
    }

    /// Physically remove every soft-deleted row of the table.
    pub async fn cleanup(self) -> Result<u64, Error> {
        let table = self.table_name();
        let store_name = self.store_name();
        let Database { db, ctx, tx, .. } = self;
        let caches = Arc::clone(db.caches());
        let purged = match tx {
            Some(tx) => {
                let purged = ctx
                    .run(false, async {
                        tx.transaction().cleanup(&table).await.map_err(Error::from)
                    })
                    .await?;
                tx.defer(Invalidation::for_model::<M>(caches, table.clone(), Vec::new()));
                purged
            }
            None => {
                let store = db.store(store_name.as_deref())?;
                let purged = ctx
                    .run(false, async {
                        let mut txn = store.begin().await?;
                        let purged = txn.cleanup(&table).await?;
                        txn.commit().await?;
                        Ok::<_, Error>(purged)
                    })
                    .await?;
                Invalidation::for_model::<M>(caches, table.clone(), Vec::new())
                    .run()
                    .await;
                purged
            }
        };
        debug!(target = "trellis::database", table = %table, purged, "cleanup finished");
        Ok(purged)
    }
}

fn chunks(len: usize, size: usize) -> impl Iterator<Item = Range<usize>> {
    (0..len)
        .step_by(size)
        .map(move |start| start..(start + size).min(len))
}

async fn select_rows(txn: &mut dyn Transaction, plan: &Plan) -> Result<Vec<Row>, Error> {
    txn.select(plan).await.map_err(Error::from)
}

async fn discard(txn: Box<dyn Transaction>, table: &str) {
    if let Err(err) = txn.rollback().await {
        warn!(
            target = "trellis::database",
            table,
            error = %err,
            "rollback after failed write failed"
        );
    }
}

/// One batch in its own unit of work: committed, or rolled back on failure
/// and for try-runs.
async fn write_own(
    store: &dyn Store,
    table: &str,
    schema: &'static Schema,
    mode: WriteMode,
    rows: Vec<Row>,
    stamp: &Stamp,
    try_run: bool,
) -> Result<Vec<Row>, Error> {
    let mut txn = store.begin().await?;
    match write_chunk(txn.as_mut(), table, schema, mode, rows, stamp).await {
        Ok(stored) => {
            if try_run {
                txn.rollback().await?;
            } else {
                txn.commit().await?;
            }
            Ok(stored)
        }
        Err(err) => {
            discard(txn, table).await;
            Err(err)
        }
    }
}

/// Persist one batch and return the stored rows in input order.
async fn write_chunk(
    txn: &mut dyn Transaction,
    table: &str,
    schema: &'static Schema,
    mode: WriteMode,
    rows: Vec<Row>,
    stamp: &Stamp,
) -> Result<Vec<Row>, Error> {
    let ids: Vec<String> = rows.iter().map(row_id).collect();
    let to_write = match mode {
        WriteMode::Create | WriteMode::Update => rows,
        WriteMode::Partial => {
            let mut plan = Plan::new(table, schema).with_ids(&ids);
            plan.lock = true;
            let mut existing = index_by_id(txn.select(&plan).await?);
            rows.into_iter()
                .map(|incoming| {
                    let id = row_id(&incoming);
                    let current = existing
                        .remove(&id)
                        .ok_or_else(|| Error::not_found(format!("{table} `{id}`")))?;
                    Ok(merge(current, &incoming, schema, stamp))
                })
                .collect::<Result<Vec<Row>, Error>>()?
        }
    };
    txn.upsert(table, schema, to_write).await?;

    let mut plan = Plan::new(table, schema).with_ids(&ids);
    plan.include_deleted = true;
    let mut stored = index_by_id(txn.select(&plan).await?);
    ids.iter()
        .map(|id| {
            stored
                .remove(id)
                .ok_or_else(|| Error::internal(format!("{table} `{id}` vanished after write")))
        })
        .collect()
}

async fn remove_chunk(
    txn: &mut dyn Transaction,
    table: &str,
    ids: &[String],
    purge: bool,
    now: OffsetDateTime,
) -> Result<(), Error> {
    if purge {
        txn.purge(table, ids).await?;
    } else {
        txn.soft_delete(table, ids, now).await?;
    }
    Ok(())
}

/// Overlay the set fields of `incoming` onto `current`.
fn merge(mut current: Row, incoming: &Row, schema: &Schema, stamp: &Stamp) -> Row {
    for field in schema.fields.iter().chain(Schema::base_fields()) {
        if matches!(
            field.name,
            ID | CREATED_AT | CREATED_BY | UPDATED_AT | UPDATED_BY | DELETED_AT
        ) {
            continue;
        }
        if let Some(value) = incoming.get(field.name)
            && field.is_set(value)
        {
            current.insert(field.name.to_string(), value.clone());
        }
    }
    if let Ok(now) = stamp.now.format(&Rfc3339) {
        current.insert(UPDATED_AT.to_string(), Value::String(now));
    }
    current.insert(UPDATED_BY.to_string(), Value::String(stamp.actor.clone()));
    current
}

fn row_id(row: &Row) -> String {
    row.get(ID)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn index_by_id(rows: Vec<Row>) -> HashMap<String, Row> {
    rows.into_iter().map(|row| (row_id(&row), row)).collect()
}

/// Copy what storage decided back into the caller's items.
fn absorb<M: Model>(items: &mut [M], stored: Vec<Row>, mode: WriteMode) -> Result<(), Error> {
    for (item, row) in items.iter_mut().zip(stored) {
        match mode {
            WriteMode::Partial => *item = from_row(row)?,
            WriteMode::Create | WriteMode::Update => {
                let stored: M = from_row(row)?;
                item.base_mut().created_at = stored.base().created_at;
                item.base_mut().created_by = stored.base().created_by.clone();
            }
        }
    }
    Ok(())
}
