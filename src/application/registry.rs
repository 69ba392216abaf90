//! Registry of the models served by one process.
//!
//! Built once at startup; `bootstrap` then creates every table and inserts
//! the declared seed rows.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::cache::CacheRegistry;
use crate::domain::base::UPDATED_AT;
use crate::domain::{Model, Schema};

use super::database::{Db, Invalidation};
use super::error::Error;
use super::hooks::{NoopService, Service};

type SeedFn = Box<dyn Fn(Db) -> BoxFuture<'static, Result<SeedOutcome, Error>> + Send + Sync>;
type InvalidateFn = fn(Arc<CacheRegistry>, String, Vec<String>) -> BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedOutcome {
    pub inserted: usize,
    pub refreshed: usize,
}

/// One registered model, type-erased.
pub struct ModelEntry {
    pub table: String,
    pub type_name: &'static str,
    pub schema: &'static Schema,
    /// Named engine; `None` is the default one.
    pub store: Option<String>,
    type_id: TypeId,
    seed: Option<SeedFn>,
    invalidate: InvalidateFn,
}

impl ModelEntry {
    pub(crate) fn invalidation(&self, caches: Arc<CacheRegistry>, ids: Vec<String>) -> Invalidation {
        Invalidation::from_fn(caches, self.table.clone(), ids, self.invalidate)
    }
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("table", &self.table)
            .field("type_name", &self.type_name)
            .field("store", &self.store)
            .field("seeded", &self.seed.is_some())
            .finish()
    }
}

pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
    by_table: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

#[derive(Default)]
pub struct ModelRegistryBuilder {
    entries: Vec<ModelEntry>,
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ModelRegistryBuilder {
    pub fn register<M: Model>(self) -> Self {
        self.register_entry::<M>(None, Vec::new())
    }

    /// Register `M` with rows inserted by `bootstrap`.
    ///
    /// Seeds without an id get one derived from their content, so the same
    /// seed maps to the same row on every start.
    pub fn register_seeded<M: Model>(self, seeds: Vec<M>) -> Self {
        self.register_entry::<M>(None, seeds)
    }

    /// Register `M` on a named engine.
    pub fn register_on<M: Model>(self, store: impl Into<String>) -> Self {
        self.register_entry::<M>(Some(store.into()), Vec::new())
    }

    pub fn register_entry<M: Model>(mut self, store: Option<String>, seeds: Vec<M>) -> Self {
        let seed = (!seeds.is_empty()).then(|| seed_fn(seeds));
        self.entries.push(ModelEntry {
            table: M::table_name(),
            type_name: type_name::<M>(),
            schema: M::schema(),
            store,
            type_id: TypeId::of::<M>(),
            seed,
            invalidate: super::database::invalidate_model::<M>,
        });
        self
    }

    /// Service hooks for `M`; models without one get [`NoopService`].
    pub fn with_service<M: Model>(mut self, service: impl Service<M>) -> Self {
        let service: Arc<dyn Service<M>> = Arc::new(service);
        self.services
            .insert(TypeId::of::<M>(), Arc::new(service) as Arc<dyn Any + Send + Sync>);
        self
    }

    pub fn build(self) -> Result<Arc<ModelRegistry>, Error> {
        let mut by_table = HashMap::new();
        let mut by_type = HashMap::new();
        for (position, entry) in self.entries.iter().enumerate() {
            let short = short_type_name(entry.type_name);
            if short.ends_with("Request") || short.ends_with("Response") {
                return Err(Error::bad_request(format!(
                    "`{short}` looks like a request or response shape, not a model"
                )));
            }
            if entry.schema.is_empty() {
                return Err(Error::bad_request(format!(
                    "`{short}` declares no fields beyond the base record"
                )));
            }
            if by_table.insert(entry.table.clone(), position).is_some() {
                return Err(Error::conflict(format!(
                    "table `{}` is registered twice",
                    entry.table
                )));
            }
            by_type.insert(entry.type_id, position);
        }
        Ok(Arc::new(ModelRegistry {
            entries: self.entries,
            by_table,
            by_type,
            services: self.services,
        }))
    }
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            entries: Vec::new(),
            by_table: HashMap::new(),
            by_type: HashMap::new(),
            services: HashMap::new(),
        })
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn entry_for_table(&self, table: &str) -> Option<&ModelEntry> {
        self.by_table.get(table).map(|&position| &self.entries[position])
    }

    pub fn entry_for<M: Model>(&self) -> Option<&ModelEntry> {
        self.by_type
            .get(&TypeId::of::<M>())
            .map(|&position| &self.entries[position])
    }

    pub fn store_for<M: Model>(&self) -> Option<&str> {
        self.entry_for::<M>().and_then(|entry| entry.store.as_deref())
    }

    pub fn service<M: Model>(&self) -> Arc<dyn Service<M>> {
        self.services
            .get(&TypeId::of::<M>())
            .and_then(|service| {
                Arc::clone(service)
                    .downcast::<Arc<dyn Service<M>>>()
                    .ok()
            })
            .map(|service| Arc::clone(&*service))
            .unwrap_or_else(|| Arc::new(NoopService))
    }

    /// Create every table, then insert seeds in registration order.
    pub async fn bootstrap(&self, db: &Db) -> Result<(), Error> {
        for entry in &self.entries {
            let store = db.store(entry.store.as_deref())?;
            store.ensure_table(&entry.table, entry.schema).await?;
            info!(
                target = "trellis::registry",
                table = %entry.table,
                store = store.name(),
                "table ready"
            );
        }
        for entry in &self.entries {
            let Some(seed) = &entry.seed else {
                continue;
            };
            let outcome = seed(db.clone()).await?;
            info!(
                target = "trellis::registry",
                table = %entry.table,
                inserted = outcome.inserted,
                refreshed = outcome.refreshed,
                "seed rows applied"
            );
        }
        Ok(())
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn seed_fn<M: Model>(seeds: Vec<M>) -> SeedFn {
    let seeds = Arc::new(seeds);
    Box::new(move |db: Db| {
        let seeds = Arc::clone(&seeds);
        Box::pin(async move { apply_seeds(&db, &seeds).await })
    })
}

/// Insert missing seeds; seeds already stored only get `updated_at` bumped.
async fn apply_seeds<M: Model>(db: &Db, seeds: &[M]) -> Result<SeedOutcome, Error> {
    let mut pending = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let mut seed = seed.clone();
        if seed.base().id.is_empty() {
            seed.base_mut().id = content_id(&seed)?;
        }
        pending.push(seed);
    }

    let mut outcome = SeedOutcome::default();
    let mut fresh = Vec::new();
    for seed in pending {
        let stored = db
            .table::<M>()
            .without_hook()
            .with_show_deleted()
            .get(seed.id())
            .await;
        match stored {
            Ok(stored) if stored.base().is_deleted() => {}
            Ok(_) => {
                let now = OffsetDateTime::now_utc()
                    .format(&Rfc3339)
                    .map_err(|err| Error::internal(format!("format timestamp: {err}")))?;
                db.table::<M>()
                    .update_by_id(seed.id(), UPDATED_AT, now)
                    .await?;
                outcome.refreshed += 1;
            }
            Err(Error::NotFound(_)) => fresh.push(seed),
            Err(err) => return Err(err),
        }
    }
    if !fresh.is_empty() {
        outcome.inserted = fresh.len();
        db.table::<M>().without_hook().create(&mut fresh).await?;
    }
    Ok(outcome)
}

/// Stable id of a seed: a digest of its serialized content.
fn content_id<M: Model>(seed: &M) -> Result<String, Error> {
    let bytes = serde_json::to_vec(seed)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Base, Field};
    use once_cell::sync::Lazy;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Tag {
        #[serde(flatten)]
        base: Base,
        label: String,
    }

    static TAG_SCHEMA: Lazy<Schema> =
        Lazy::new(|| Schema::new().field(Field::string("label").filterable()));

    impl Model for Tag {
        fn base(&self) -> &Base {
            &self.base
        }

        fn base_mut(&mut self) -> &mut Base {
            &mut self.base
        }

        fn schema() -> &'static Schema {
            &TAG_SCHEMA
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct TagRequest {
        #[serde(flatten)]
        base: Base,
        label: String,
    }

    impl Model for TagRequest {
        fn base(&self) -> &Base {
            &self.base
        }

        fn base_mut(&mut self) -> &mut Base {
            &mut self.base
        }

        fn schema() -> &'static Schema {
            &TAG_SCHEMA
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Bare {
        #[serde(flatten)]
        base: Base,
    }

    static BARE_SCHEMA: Lazy<Schema> = Lazy::new(Schema::new);

    impl Model for Bare {
        fn base(&self) -> &Base {
            &self.base
        }

        fn base_mut(&mut self) -> &mut Base {
            &mut self.base
        }

        fn schema() -> &'static Schema {
            &BARE_SCHEMA
        }
    }

    #[test]
    fn tables_are_derived_from_type_names() {
        let registry = ModelRegistry::builder()
            .register::<Tag>()
            .build()
            .expect("registry");
        let entry = registry.entry_for_table("tags").expect("tags entry");
        assert_eq!(short_type_name(entry.type_name), "Tag");
        assert!(registry.entry_for::<Tag>().is_some());
        assert!(registry.store_for::<Tag>().is_none());
    }

    #[test]
    fn rejects_request_shapes_bare_models_and_duplicates() {
        assert!(ModelRegistry::builder().register::<TagRequest>().build().is_err());
        assert!(ModelRegistry::builder().register::<Bare>().build().is_err());
        let duplicate = ModelRegistry::builder()
            .register::<Tag>()
            .register_on::<Tag>("archive")
            .build();
        assert!(duplicate.is_err());
    }

    #[test]
    fn content_ids_are_stable_and_content_sensitive() {
        let a = Tag {
            label: "alpha".into(),
            ..Tag::default()
        };
        let b = Tag {
            label: "beta".into(),
            ..Tag::default()
        };
        let first = content_id(&a).expect("id");
        assert_eq!(first.len(), 32);
        assert_eq!(first, content_id(&a.clone()).expect("id"));
        assert_ne!(first, content_id(&b).expect("id"));
    }

    #[test]
    fn unknown_models_fall_back_to_the_noop_service() {
        let registry = ModelRegistry::empty();
        let _service: Arc<dyn Service<Tag>> = registry.service::<Tag>();
    }
}
