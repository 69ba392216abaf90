use std::sync::Arc;

use futures::future::BoxFuture;
use metrics::counter;
use tracing::warn;

use crate::cache::{Cache, CacheRegistry, record_key};
use crate::domain::Model;

use super::ListPage;

type InvalidateFn = fn(Arc<CacheRegistry>, String, Vec<String>) -> BoxFuture<'static, ()>;

/// Cache entries to drop once a write is durable.
///
/// Record keys of the touched ids are removed from the model's cache and
/// every tracked list key of the table is removed from the list-page cache.
pub(crate) struct Invalidation {
    caches: Arc<CacheRegistry>,
    table: String,
    ids: Vec<String>,
    apply: InvalidateFn,
}

impl Invalidation {
    pub(crate) fn for_model<M: Model>(
        caches: Arc<CacheRegistry>,
        table: String,
        ids: Vec<String>,
    ) -> Self {
        Self {
            caches,
            table,
            ids,
            apply: invalidate_model::<M>,
        }
    }

    /// Type-erased form used where only the table is known.
    pub(crate) fn from_fn(
        caches: Arc<CacheRegistry>,
        table: String,
        ids: Vec<String>,
        apply: InvalidateFn,
    ) -> Self {
        Self {
            caches,
            table,
            ids,
            apply,
        }
    }

    pub(crate) async fn run(self) {
        (self.apply)(self.caches, self.table, self.ids).await
    }
}

pub(crate) fn invalidate_model<M: Model>(
    caches: Arc<CacheRegistry>,
    table: String,
    ids: Vec<String>,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if !caches.is_enabled() {
            return;
        }
        // Advanced before any delete so in-flight fills see the write.
        let generation = caches.generations().advance(&table);

        let records = caches.cache::<M>();
        for id in &ids {
            if let Err(err) = records.delete(&record_key(&table, id)).await {
                warn!(
                    target = "trellis::cache",
                    table = %table,
                    id = %id,
                    error = %err,
                    "failed to invalidate record"
                );
            }
        }

        let lists = caches.cache::<ListPage<M>>();
        let keys = caches.list_keys().take(&table);
        for key in &keys {
            if let Err(err) = lists.delete(key).await {
                warn!(
                    target = "trellis::cache",
                    table = %table,
                    key = %key,
                    error = %err,
                    "failed to invalidate list page"
                );
            }
        }

        counter!("trellis_cache_invalidations_total", "table" => table.clone()).increment(1);
        tracing::debug!(
            target = "trellis::cache",
            table = %table,
            generation,
            records = ids.len(),
            lists = keys.len(),
            "cache invalidated"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, list_key};
    use crate::domain::{Base, Field, Schema};
    use once_cell::sync::Lazy;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(flatten)]
        base: Base,
        title: String,
    }

    static NOTE_SCHEMA: Lazy<Schema> =
        Lazy::new(|| Schema::new().table("notes").field(Field::string("title")));

    impl Model for Note {
        fn base(&self) -> &Base {
            &self.base
        }

        fn base_mut(&mut self) -> &mut Base {
            &mut self.base
        }

        fn schema() -> &'static Schema {
            &NOTE_SCHEMA
        }
    }

    #[tokio::test]
    async fn drops_records_and_tracked_list_pages() {
        let caches = Arc::new(CacheRegistry::new(CacheConfig::default()).expect("registry"));
        let note = Note {
            base: Base::with_id("n1"),
            title: "hello".into(),
        };
        caches
            .cache::<Note>()
            .set(&record_key("notes", "n1"), note.clone(), None)
            .await
            .expect("set record");
        let key = list_key("notes", 0, &"all").expect("key");
        let page = ListPage {
            items: vec![note],
            total: Some(1),
            next_cursor: None,
            prev_cursor: None,
        };
        caches
            .cache::<ListPage<Note>>()
            .set(&key, page, None)
            .await
            .expect("set page");
        caches.list_keys().track("notes", &key);

        Invalidation::for_model::<Note>(Arc::clone(&caches), "notes".into(), vec!["n1".into()])
            .run()
            .await;

        assert!(!caches.cache::<Note>().exists(&record_key("notes", "n1")).await);
        assert!(!caches.cache::<ListPage<Note>>().exists(&key).await);
        assert_eq!(caches.list_keys().tracked("notes"), 0);
        assert_eq!(caches.generations().current("notes"), 1);
    }
}
