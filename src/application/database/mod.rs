//! Generic CRUD over any registered model.
//!
//! [`Db`] is the shared handle: default and named storage engines, the cache
//! registry, the model registry and CRUD limits. `db.table::<M>()` starts a
//! [`Database`] builder; modifiers configure it and one terminal operation
//! consumes it.
//!
//! A mutating call moves through `validate → before hooks → persist → after
//! hooks → cache invalidation`. A failure before persistence has no side
//! effects; a failure while persisting rolls back the active batch; an
//! after-hook failure is reported as [`Error::AfterHook`] while the mutation
//! stays durable.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use trellis_api_types::ListPayload;

use crate::cache::{CacheConfig, CacheRegistry};
use crate::config::CrudSettings;
use crate::domain::{Model, Schema};

use super::context::Context;
use super::cursor::CursorQuery;
use super::error::Error;
use super::filter::{Combinator, Condition};
use super::query::ListQuery;
use super::registry::ModelRegistry;
use super::store::{OrderBy, RawFilter, Row, Store, TimeRange, Transaction};

mod expand;
mod invalidate;
mod options;
mod read;
mod write;

pub(crate) use invalidate::{Invalidation, invalidate_model};
use options::{Options, Paging};

/// One page of list results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPage<M> {
    pub items: Vec<M>,
    pub total: Option<u64>,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
}

impl<M> ListPage<M> {
    pub fn map<R>(self, f: impl FnMut(M) -> R) -> ListPage<R> {
        ListPage {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            next_cursor: self.next_cursor,
            prev_cursor: self.prev_cursor,
        }
    }

    pub fn into_payload(self) -> ListPayload<M> {
        ListPayload {
            items: self.items,
            total: self.total,
            next_cursor: self.next_cursor,
            prev_cursor: self.prev_cursor,
        }
    }
}

struct DbInner {
    default_store: Arc<dyn Store>,
    stores: HashMap<String, Arc<dyn Store>>,
    caches: Arc<CacheRegistry>,
    models: Arc<ModelRegistry>,
    settings: CrudSettings,
}

/// Shared entry point of the CRUD layer. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

pub struct DbBuilder {
    default_store: Arc<dyn Store>,
    stores: HashMap<String, Arc<dyn Store>>,
    caches: Option<Arc<CacheRegistry>>,
    models: Option<Arc<ModelRegistry>>,
    settings: CrudSettings,
}

impl DbBuilder {
    /// Register a secondary engine reachable through `with_db(name)`.
    pub fn store(mut self, name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    pub fn caches(mut self, caches: Arc<CacheRegistry>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn models(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn settings(mut self, settings: CrudSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Db, Error> {
        let caches = match self.caches {
            Some(caches) => caches,
            None => {
                let disabled = CacheConfig {
                    enabled: false,
                    ..CacheConfig::default()
                };
                Arc::new(
                    CacheRegistry::new(disabled)
                        .map_err(|err| Error::internal(format!("cache registry: {err}")))?,
                )
            }
        };
        Ok(Db {
            inner: Arc::new(DbInner {
                default_store: self.default_store,
                stores: self.stores,
                caches,
                models: self.models.unwrap_or_else(ModelRegistry::empty),
                settings: self.settings,
            }),
        })
    }
}

impl Db {
    pub fn builder(default_store: Arc<dyn Store>) -> DbBuilder {
        DbBuilder {
            default_store,
            stores: HashMap::new(),
            caches: None,
            models: None,
            settings: CrudSettings::default(),
        }
    }

    pub fn table<M: Model>(&self) -> Database<'_, M> {
        Database {
            db: self,
            ctx: Context::background(),
            opts: Options::new(&self.inner.settings),
            tx: None,
            _model: PhantomData,
        }
    }

    /// Start a unit of work on the default engine or a named one.
    ///
    /// Cache invalidations of operations run inside it are deferred until
    /// [`Tx::commit`].
    pub async fn begin(&self, store: Option<&str>) -> Result<Tx, Error> {
        let store = self.store(store)?;
        let inner = store.begin().await?;
        Ok(Tx {
            store: store.name().to_string(),
            inner,
            pending: Vec::new(),
        })
    }

    /// Resolve an engine by name; `None` is the default engine.
    pub fn store(&self, name: Option<&str>) -> Result<Arc<dyn Store>, Error> {
        match name {
            None => Ok(Arc::clone(&self.inner.default_store)),
            Some(name) if name == self.inner.default_store.name() => {
                Ok(Arc::clone(&self.inner.default_store))
            }
            Some(name) => self
                .inner
                .stores
                .get(name)
                .cloned()
                .ok_or_else(|| Error::internal(format!("unknown store `{name}`"))),
        }
    }

    /// Physically remove soft-deleted rows of a registered table.
    pub async fn cleanup_table(&self, table: &str) -> Result<u64, Error> {
        let entry = self
            .inner
            .models
            .entry_for_table(table)
            .ok_or_else(|| Error::not_found(format!("table `{table}`")))?;
        let mut tx = self.begin(entry.store.as_deref()).await?;
        let purged = tx.transaction().cleanup(table).await?;
        tx.defer(entry.invalidation(Arc::clone(&self.inner.caches), Vec::new()));
        tx.commit().await?;
        tracing::info!(
            target = "trellis::database",
            table,
            purged,
            "soft-deleted rows purged"
        );
        Ok(purged)
    }

    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.inner.caches
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.inner.models
    }

    pub fn settings(&self) -> &CrudSettings {
        &self.inner.settings
    }
}

/// An open unit of work. Dropping it without [`Tx::commit`] rolls back.
pub struct Tx {
    store: String,
    inner: Box<dyn Transaction>,
    pending: Vec<Invalidation>,
}

impl Tx {
    pub fn store_name(&self) -> &str {
        &self.store
    }

    pub(crate) fn transaction(&mut self) -> &mut dyn Transaction {
        self.inner.as_mut()
    }

    pub(crate) fn defer(&mut self, invalidation: Invalidation) {
        self.pending.push(invalidation);
    }

    pub async fn commit(self) -> Result<(), Error> {
        self.inner.commit().await?;
        for invalidation in self.pending {
            invalidation.run().await;
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), Error> {
        self.inner.rollback().await.map_err(Error::from)
    }
}

/// Builder for one CRUD operation on `M`.
pub struct Database<'a, M: Model> {
    db: &'a Db,
    ctx: Context,
    opts: Options,
    tx: Option<&'a mut Tx>,
    _model: PhantomData<fn() -> M>,
}

impl<'a, M: Model> Database<'a, M> {
    fn table_name(&self) -> String {
        self.opts.table.clone().unwrap_or_else(M::table_name)
    }

    fn store_name(&self) -> Option<String> {
        self.opts
            .store
            .clone()
            .or_else(|| self.db.inner.models.store_for::<M>().map(str::to_string))
    }

    /// Reads inside a transaction may see uncommitted rows and bypass the cache.
    fn cache_reads(&self) -> bool {
        self.opts.cache
            && !self.opts.nocache
            && self.tx.is_none()
            && self.db.inner.caches.is_enabled()
    }

    pub fn with_context(mut self, ctx: &Context) -> Self {
        self.ctx = ctx.clone();
        self
    }

    /// Rows per write batch; a negative value writes everything at once.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.opts.limit = usize::try_from(limit).ok().map(|limit| limit.max(1));
        self
    }

    /// Equality filters from every filterable field of `probe` that is set.
    ///
    /// With `fuzzy`, string equality becomes containment.
    pub fn with_query(mut self, probe: &M, fuzzy: bool) -> Self {
        let schema = M::schema();
        let row = match serde_json::to_value(probe) {
            Ok(Value::Object(row)) => row,
            _ => return self,
        };
        for field in schema.fields.iter().chain(Schema::base_fields()) {
            if !field.filterable {
                continue;
            }
            let Some(value) = row.get(field.name) else {
                continue;
            };
            if !field.is_set(value) {
                continue;
            }
            let condition = Condition::eq(field.name, value.clone());
            let condition = if fuzzy {
                condition.fuzzy(schema)
            } else {
                condition
            };
            self.opts.filters.conditions.retain(|c| c.column() != field.name);
            self.opts.filters.push(condition);
        }
        self.opts.fuzzy |= fuzzy;
        self
    }

    /// Raw predicate with `?` placeholders bound to `args`.
    ///
    /// Only SQL engines accept raw predicates.
    pub fn with_query_raw(mut self, sql: impl Into<String>, args: Vec<Value>) -> Self {
        let sql = sql.into();
        if !sql.trim().is_empty() {
            self.opts.raw.push(RawFilter { sql, args });
        }
        self
    }

    pub fn with_time_range(
        mut self,
        column: impl Into<String>,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Self {
        self.opts.time_range = Some(TimeRange::new(column.into(), start, end));
        self
    }

    pub fn with_select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opts.select = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_order(mut self, order: Vec<OrderBy>) -> Self {
        self.opts.order = order;
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.opts.index = Some(index.into());
        self
    }

    /// Combine filters with AND (the default).
    pub fn with_and(mut self) -> Self {
        self.opts.filters.combinator = Combinator::And;
        self
    }

    pub fn with_or(mut self) -> Self {
        self.opts.filters.combinator = Combinator::Or;
        self
    }

    /// Run inside a caller-owned unit of work.
    ///
    /// Before-hooks then run inside it too and cache invalidation waits for
    /// [`Tx::commit`].
    pub fn with_transaction(mut self, tx: &'a mut Tx) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Lock selected rows until the unit of work ends.
    pub fn with_lock(mut self) -> Self {
        self.opts.lock = true;
        self
    }

    /// Delete physically instead of stamping `deleted_at`.
    pub fn with_purge(mut self) -> Self {
        self.opts.purge = true;
        self
    }

    pub fn without_hook(mut self) -> Self {
        self.opts.hooks = false;
        self
    }

    /// Serve reads through the cache and populate it on miss.
    pub fn with_cache(mut self) -> Self {
        self.opts.cache = true;
        self
    }

    /// Route to a named engine.
    pub fn with_db(mut self, store: impl Into<String>) -> Self {
        self.opts.store = Some(store.into());
        self
    }

    /// Target another table with the same schema.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.opts.table = Some(table.into());
        self
    }

    /// Validate and persist, then roll back instead of committing.
    pub fn with_try_run(mut self) -> Self {
        self.opts.try_run = true;
        self
    }

    pub fn with_page(mut self, page: u32, size: u32) -> Self {
        self.opts.paging = Paging::Page {
            page: page.max(1),
            size: self.opts.page_size(Some(size)),
        };
        self
    }

    pub fn with_cursor(mut self, cursor: CursorQuery, size: u32) -> Self {
        self.opts.paging = Paging::Cursor {
            cursor,
            size: self.opts.page_size(Some(size)),
        };
        self
    }

    /// Attach related rows, `depth` levels deep.
    pub fn with_expand<I, S>(mut self, relations: I, depth: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opts.expand = relations.into_iter().map(Into::into).collect();
        self.opts.depth = depth.clamp(1, self.opts.max_depth.max(1));
        self
    }

    pub fn without_total(mut self) -> Self {
        self.opts.total = false;
        self
    }

    pub fn with_show_deleted(mut self) -> Self {
        self.opts.show_deleted = true;
        self
    }

    /// Apply a decoded list request.
    ///
    /// Paging is only touched when the request names a page, a size or a
    /// cursor.
    pub fn with_descriptor(mut self, query: &ListQuery) -> Self {
        let schema = M::schema();
        for condition in &query.filters {
            let condition = if query.fuzzy {
                condition.clone().fuzzy(schema)
            } else {
                condition.clone()
            };
            self.opts.filters.conditions.retain(|c| c.column() != condition.column());
            self.opts.filters.push(condition);
        }
        self.opts.fuzzy |= query.fuzzy;
        if query.or {
            self.opts.filters.combinator = Combinator::Or;
        }
        if let Some(range) = &query.time_range {
            self.opts.time_range = Some(range.clone());
        }
        if !query.select.is_empty() {
            self.opts.select = query.select.clone();
        }
        if !query.sort.is_empty() {
            self.opts.order = query.sort.clone();
        }
        if let Some(index) = &query.index {
            self.opts.index = Some(index.clone());
        }
        if !query.expand.is_empty() {
            self = self.with_expand(query.expand.clone(), query.expand_depth());
        }
        self.opts.total = !query.nototal;
        self.opts.nocache |= query.nocache;
        self.opts.show_deleted |= query.show_deleted;
        let size = self.opts.page_size(query.size);
        match (&query.cursor, &self.opts.paging) {
            (Some(cursor), _) => {
                self.opts.paging = Paging::Cursor {
                    cursor: cursor.clone(),
                    size,
                };
            }
            (None, Paging::Page { page, size: preset }) => {
                self.opts.paging = Paging::Page {
                    page: query.page.unwrap_or(*page),
                    size: if query.size.is_some() { size } else { *preset },
                };
            }
            (None, _) if query.page.is_some() || query.size.is_some() => {
                self.opts.paging = Paging::Page {
                    page: query.page.unwrap_or(1),
                    size,
                };
            }
            (None, _) => {}
        }
        self
    }
}

/// Serialize a model into a storable row, dropping relation fields.
pub(crate) fn to_row<M: Model>(item: &M) -> Result<Row, Error> {
    match serde_json::to_value(item)? {
        Value::Object(mut row) => {
            for relation in &M::schema().relations {
                row.remove(relation.name);
            }
            Ok(row)
        }
        other => Err(Error::internal(format!(
            "model `{}` serialized to {other} instead of an object",
            std::any::type_name::<M>()
        ))),
    }
}

pub(crate) fn from_row<M: Model>(row: Row) -> Result<M, Error> {
    serde_json::from_value(Value::Object(row)).map_err(Error::from)
}
