//! Read operations: list, get and count.

use metrics::counter;
use serde::Serialize;
use tracing::{debug_span, warn};

use crate::application::cursor::{CursorQuery, CursorToken};
use crate::application::error::Error;
use crate::application::filter::Condition;
use crate::application::registry::ModelRegistry;
use crate::application::store::{Direction, OrderBy, Plan, Row, Seek, Transaction};
use crate::cache::{Cache, Traced, list_key, record_key};
use crate::domain::base::{ID, IDENTITY_COLUMNS};
use crate::domain::{Model, Schema};

use super::expand::expand_rows;
use super::options::{Options, Paging};
use super::{Database, ListPage, from_row, to_row};

/// Everything that shapes a list result, hashed into its cache key.
#[derive(Serialize)]
struct ListCacheKey<'p> {
    plan: &'p Plan,
    order: &'p [OrderBy],
    select: &'p [String],
    paging: &'p Paging,
    total: bool,
}

struct RawPage {
    rows: Vec<Row>,
    total: Option<u64>,
    next_cursor: Option<String>,
    prev_cursor: Option<String>,
}

impl<'a, M: Model> Database<'a, M> {
    /// Rows matching the configured filters, one page at a time.
    ///
    /// Without `with_page`/`with_cursor` every matching row is returned.
    /// Results are ordered by the requested sort with `id` as tiebreaker,
    /// else by `id` ascending.
    pub async fn list(self) -> Result<ListPage<M>, Error> {
        let table = self.table_name();
        let store_name = self.store_name();
        let cache_reads = self.cache_reads();
        let Database { db, ctx, opts, tx, .. } = self;
        let span = debug_span!(parent: ctx.span(), "crud.read", op = "list", table = %table);
        let ctx = ctx.with_span(span);
        let schema = M::schema();

        if opts.hooks {
            M::list_before(&ctx).await?;
        }
        validate_shape(schema, &opts)?;
        let plan = list_plan(&table, schema, &opts);

        let lists = db
            .caches()
            .cache::<ListPage<M>>()
            .with_span(ctx.span().clone());
        let key = if cache_reads && opts.expand.is_empty() {
            let descriptor = ListCacheKey {
                plan: &plan,
                order: &opts.order,
                select: &opts.select,
                paging: &opts.paging,
                total: opts.total,
            };
            let generation = db.caches().generations().current(&table);
            match list_key(&table, generation, &descriptor) {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!(
                        target = "trellis::cache",
                        table = %table,
                        error = %err,
                        "list descriptor has no cache key; reading uncached"
                    );
                    None
                }
            }
        } else {
            None
        };
        if let Some(key) = &key {
            match lists.get(key).await {
                Ok(mut page) => {
                    counter!("trellis_crud_reads_total", "op" => "list", "table" => table.clone())
                        .increment(1);
                    if opts.hooks {
                        M::list_after(&ctx, &mut page.items).await?;
                    }
                    return Ok(page);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(
                    target = "trellis::cache",
                    table = %table,
                    error = %err,
                    "list cache read failed"
                ),
            }
        }

        let models = db.models();
        let raw = match tx {
            Some(tx) => {
                ctx.run(false, fetch_page::<M>(tx.transaction(), models, plan, &opts))
                    .await?
            }
            None => {
                let store = db.store(store_name.as_deref())?;
                ctx.run(false, async {
                    let mut txn = store.begin().await?;
                    let page = fetch_page::<M>(txn.as_mut(), models, plan, &opts).await?;
                    txn.commit().await?;
                    Ok::<_, Error>(page)
                })
                .await?
            }
        };
        let mut page = ListPage {
            items: raw
                .rows
                .into_iter()
                .map(from_row::<M>)
                .collect::<Result<Vec<M>, Error>>()?,
            total: raw.total,
            next_cursor: raw.next_cursor,
            prev_cursor: raw.prev_cursor,
        };

        if let Some(key) = key {
            match lists.set(&key, page.clone(), None).await {
                Ok(()) => {
                    if let Some(evicted) = db.caches().list_keys().track(&table, &key)
                        && let Err(err) = lists.delete(&evicted).await
                    {
                        warn!(
                            target = "trellis::cache",
                            table = %table,
                            key = %evicted,
                            error = %err,
                            "failed to drop untracked list page"
                        );
                    }
                }
                Err(err) => warn!(
                    target = "trellis::cache",
                    table = %table,
                    error = %err,
                    "list cache populate failed"
                ),
            }
        }
        counter!("trellis_crud_reads_total", "op" => "list", "table" => table.clone())
            .increment(1);

        if opts.hooks {
            M::list_after(&ctx, &mut page.items).await?;
        }
        Ok(page)
    }

    /// One record by id. Soft-deleted rows are hidden unless
    /// `with_show_deleted()` is set.
    pub async fn get(self, id: &str) -> Result<M, Error> {
        if id.is_empty() {
            return Err(Error::bad_request("an id is required"));
        }
        let table = self.table_name();
        let store_name = self.store_name();
        let cache_reads = self.cache_reads();
        let Database { db, ctx, opts, tx, .. } = self;
        let span = debug_span!(parent: ctx.span(), "crud.read", op = "get", table = %table, id);
        let ctx = ctx.with_span(span);
        let schema = M::schema();

        if opts.hooks {
            M::get_before(&ctx, id).await?;
        }
        validate_shape(schema, &opts)?;

        let cacheable =
            cache_reads && opts.expand.is_empty() && opts.select.is_empty() && !opts.show_deleted;
        let records = db.caches().cache::<M>().with_span(ctx.span().clone());
        let key = record_key(&table, id);
        let cached = if cacheable {
            match records.get(&key).await {
                Ok(item) => Some(item),
                Err(err) if err.is_not_found() => None,
                Err(err) => {
                    warn!(
                        target = "trellis::cache",
                        table = %table,
                        error = %err,
                        "record cache read failed"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut item = match cached {
            Some(item) => item,
            None => {
                let generation = db.caches().generations().current(&table);
                let mut plan = Plan::new(table.clone(), schema).with_ids(&[id.to_string()]);
                plan.include_deleted = opts.show_deleted;
                plan.lock = opts.lock;
                plan.limit = Some(1);
                let models = db.models();
                let row = match tx {
                    Some(tx) => {
                        ctx.run(false, fetch_one::<M>(tx.transaction(), models, plan, &opts))
                            .await?
                    }
                    None => {
                        let store = db.store(store_name.as_deref())?;
                        ctx.run(false, async {
                            let mut txn = store.begin().await?;
                            let row = fetch_one::<M>(txn.as_mut(), models, plan, &opts).await?;
                            txn.commit().await?;
                            Ok::<_, Error>(row)
                        })
                        .await?
                    }
                };
                let row = row.ok_or_else(|| Error::not_found(format!("{table} `{id}`")))?;
                let item: M = from_row(row)?;
                if cacheable {
                    fill_record(&records, &key, &item, || {
                        db.caches().generations().current(&table) != generation
                    })
                    .await;
                }
                item
            }
        };
        counter!("trellis_crud_reads_total", "op" => "get", "table" => table.clone())
            .increment(1);

        if opts.hooks {
            item.get_after(&ctx).await?;
        }
        Ok(item)
    }

    /// Number of rows matching the configured filters.
    pub async fn count(self) -> Result<u64, Error> {
        let table = self.table_name();
        let store_name = self.store_name();
        let Database { db, ctx, opts, tx, .. } = self;
        let schema = M::schema();
        let plan = list_plan(&table, schema, &opts).for_count();
        match tx {
            Some(tx) => {
                ctx.run(false, async {
                    tx.transaction().count(&plan).await.map_err(Error::from)
                })
                .await
            }
            None => {
                let store = db.store(store_name.as_deref())?;
                ctx.run(false, async {
                    let mut txn = store.begin().await?;
                    let total = txn.count(&plan).await?;
                    txn.commit().await?;
                    Ok::<_, Error>(total)
                })
                .await
            }
        }
    }
}

/// Store a freshly read record, then drop it again when a write to its
/// table landed while it was being read.
async fn fill_record<M: Model>(
    records: &Traced<M>,
    key: &str,
    item: &M,
    written_since: impl Fn() -> bool,
) {
    if let Err(err) = records.set(key, item.clone(), None).await {
        warn!(
            target = "trellis::cache",
            key = %key,
            error = %err,
            "record cache populate failed"
        );
        return;
    }
    if written_since()
        && let Err(err) = records.delete(key).await
    {
        warn!(
            target = "trellis::cache",
            key = %key,
            error = %err,
            "failed to drop record filled during a write"
        );
    }
}

fn validate_shape(schema: &Schema, opts: &Options) -> Result<(), Error> {
    if let Some(column) = opts.select.iter().find(|column| !schema.has_column(column)) {
        return Err(Error::bad_request(format!(
            "cannot select unknown column `{column}`"
        )));
    }
    if let Some(relation) = opts
        .expand
        .iter()
        .find(|relation| schema.relation_named(relation).is_none())
    {
        return Err(Error::bad_request(format!(
            "`{relation}` is not an expandable relation"
        )));
    }
    if let Some(clause) = opts.order.iter().find(|clause| !schema.has_column(&clause.column)) {
        return Err(Error::bad_request(format!(
            "cannot sort by unknown column `{}`",
            clause.column
        )));
    }
    Ok(())
}

/// Filters of a list call, with the schema's sentinel rows excluded.
fn list_plan(table: &str, schema: &'static Schema, opts: &Options) -> Plan {
    let mut plan = Plan::new(table, schema);
    plan.filters = opts.filters.clone();
    plan.raw = opts.raw.clone();
    plan.time_range = opts.time_range.clone();
    plan.include_deleted = opts.show_deleted;
    plan.lock = opts.lock;
    plan.index_hint = opts.index.clone();
    for exclusion in &schema.exclusions {
        plan.guards.push(Condition::NotIn {
            column: exclusion.field.to_string(),
            values: exclusion
                .values
                .iter()
                .map(|value| serde_json::Value::String((*value).to_string()))
                .collect(),
        });
    }
    plan
}

/// Requested order with an `id` tiebreaker, or `id` ascending.
fn with_tiebreaker(order: &[OrderBy]) -> Vec<OrderBy> {
    let mut order = order.to_vec();
    if !order.iter().any(|clause| clause.column == ID) {
        order.push(OrderBy::asc(ID));
    }
    order
}

async fn fetch_page<M: Model>(
    txn: &mut dyn Transaction,
    models: &ModelRegistry,
    mut plan: Plan,
    opts: &Options,
) -> Result<RawPage, Error> {
    let total = if opts.total {
        Some(txn.count(&plan.for_count()).await?)
    } else {
        None
    };
    let (rows, next_cursor, prev_cursor) = match &opts.paging {
        Paging::Unbounded => {
            plan.order = with_tiebreaker(&opts.order);
            (txn.select(&plan).await?, None, None)
        }
        Paging::Page { page, size } => {
            plan.order = with_tiebreaker(&opts.order);
            plan.limit = Some(*size as usize);
            plan.offset = (page.saturating_sub(1) as usize).saturating_mul(*size as usize);
            (txn.select(&plan).await?, None, None)
        }
        Paging::Cursor { cursor, size } => {
            seek_page(txn, plan, &opts.order, cursor, *size as usize).await?
        }
    };
    let mut rows = project::<M>(rows, &opts.select)?;
    expand_rows(txn, models, M::schema(), &mut rows, &opts.expand, opts.depth).await?;
    Ok(RawPage {
        rows,
        total,
        next_cursor,
        prev_cursor,
    })
}

async fn fetch_one<M: Model>(
    txn: &mut dyn Transaction,
    models: &ModelRegistry,
    plan: Plan,
    opts: &Options,
) -> Result<Option<Row>, Error> {
    let rows = txn.select(&plan).await?;
    let mut rows = project::<M>(rows, &opts.select)?;
    rows.truncate(1);
    expand_rows(txn, models, M::schema(), &mut rows, &opts.expand, opts.depth).await?;
    Ok(rows.pop())
}

/// Keyset page around a cursor token.
///
/// Each cursor field keeps its requested direction (ascending when not
/// sorted on), followed by the `id` tiebreaker. Paging backwards reverses
/// every key. One extra row is fetched to learn whether another page exists.
async fn seek_page(
    txn: &mut dyn Transaction,
    mut plan: Plan,
    order: &[OrderBy],
    cursor: &CursorQuery,
    size: usize,
) -> Result<(Vec<Row>, Option<String>, Option<String>), Error> {
    let forward = cursor.next || cursor.value.is_none();
    let key = |column: &str| {
        let direction = order
            .iter()
            .find(|clause| clause.column == column)
            .map(|clause| clause.direction)
            .unwrap_or(Direction::Asc);
        OrderBy {
            column: column.to_string(),
            direction: if forward {
                direction
            } else {
                direction.reverse()
            },
        }
    };

    plan.order = cursor
        .fields
        .iter()
        .filter(|field| field.as_str() != ID)
        .map(|field| key(field.as_str()))
        .chain(std::iter::once(key(ID)))
        .collect();
    if let Some(value) = &cursor.value {
        let token = CursorToken::decode(value, cursor.fields.len())?;
        let mut values: Vec<serde_json::Value> = cursor
            .fields
            .iter()
            .zip(token.values)
            .filter(|(field, _)| field.as_str() != ID)
            .map(|(_, value)| value)
            .collect();
        values.push(serde_json::Value::String(token.id));
        plan.seek = Some(Seek {
            keys: plan.order.clone(),
            values,
        });
    }
    plan.limit = Some(size + 1);

    let mut rows = txn.select(&plan).await?;
    let has_more = rows.len() > size;
    rows.truncate(size);
    if !forward {
        rows.reverse();
    }

    let first = rows
        .first()
        .map(|row| CursorToken::from_row(row, &cursor.fields).encode());
    let last = rows
        .last()
        .map(|row| CursorToken::from_row(row, &cursor.fields).encode());
    let (next, prev) = if forward {
        (
            if has_more { last } else { None },
            if cursor.value.is_some() { first } else { None },
        )
    } else {
        (last, if has_more { first } else { None })
    };
    Ok((rows, next, prev))
}

/// Keep the selected columns plus identity columns; everything else takes
/// the model's default value.
fn project<M: Model>(rows: Vec<Row>, select: &[String]) -> Result<Vec<Row>, Error> {
    if select.is_empty() {
        return Ok(rows);
    }
    let defaults = to_row(&M::default())?;
    Ok(rows
        .into_iter()
        .map(|mut row| {
            let mut projected = defaults.clone();
            let keep = select
                .iter()
                .map(String::as_str)
                .chain(IDENTITY_COLUMNS.iter().copied());
            for column in keep {
                if let Some(value) = row.remove(column) {
                    projected.insert(column.to_string(), value);
                }
            }
            projected
        })
        .collect())
}
