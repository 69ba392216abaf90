use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use tracing::{Instrument, Span, debug_span, field::Empty, warn};

use super::{Cache, CacheClass, CacheError};

const MAX_KEY_CHARS: usize = 64;

/// Tracing decorator around any backend.
///
/// Every operation runs inside a `cache` span carrying the operation, cache
/// class, backend, owning type, truncated key, elapsed time, hit flag and
/// error. Semantics of the wrapped backend are unchanged.
pub struct Traced<T> {
    inner: Arc<dyn Cache<T>>,
    label: &'static str,
    parent: Option<Span>,
}

impl<T> Clone for Traced<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            label: self.label,
            parent: self.parent.clone(),
        }
    }
}

impl<T> Traced<T>
where
    T: Send + 'static,
{
    pub fn new(inner: Arc<dyn Cache<T>>, label: &'static str) -> Self {
        Self {
            inner,
            label,
            parent: None,
        }
    }

    /// A handle over the same store whose spans are children of `span`.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            parent: Some(span),
            ..self.clone()
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn span(&self, op: &'static str, key: &str) -> Span {
        let class = self.inner.class().as_str();
        let backend = self.inner.backend();
        let key = truncate_key(key);
        match &self.parent {
            Some(parent) => debug_span!(
                parent: parent,
                "cache",
                op,
                class,
                backend,
                cache = self.label,
                key = %key,
                elapsed_ms = Empty,
                hit = Empty,
                error = Empty
            ),
            None => debug_span!(
                "cache",
                op,
                class,
                backend,
                cache = self.label,
                key = %key,
                elapsed_ms = Empty,
                hit = Empty,
                error = Empty
            ),
        }
    }

    fn finish<R>(
        &self,
        span: &Span,
        op: &'static str,
        started: Instant,
        result: &Result<R, CacheError>,
    ) {
        span.record("elapsed_ms", elapsed_ms(started.elapsed()));
        if let Err(err) = result
            && !err.is_not_found()
        {
            span.record("error", tracing::field::display(err));
            counter!(
                "trellis_cache_error_total",
                "backend" => self.inner.backend(),
                "op" => op,
                "kind" => err.label()
            )
            .increment(1);
            warn!(
                parent: span,
                target = "trellis::cache",
                op,
                cache = self.label,
                error = %err,
                "cache operation failed"
            );
        }
    }

    fn record_lookup(&self, span: &Span, hit: bool) {
        span.record("hit", hit);
        let backend = self.inner.backend();
        let class = self.inner.class().as_str();
        if hit {
            counter!("trellis_cache_hit_total", "backend" => backend, "class" => class)
                .increment(1);
        } else {
            counter!("trellis_cache_miss_total", "backend" => backend, "class" => class)
                .increment(1);
        }
    }
}

fn truncate_key(key: &str) -> &str {
    match key.char_indices().nth(MAX_KEY_CHARS) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

fn elapsed_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

#[async_trait]
impl<T> Cache<T> for Traced<T>
where
    T: Send + 'static,
{
    fn class(&self) -> CacheClass {
        self.inner.class()
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let span = self.span("set", key);
        let started = Instant::now();
        let result = self
            .inner
            .set(key, value, ttl)
            .instrument(span.clone())
            .await;
        if result.is_ok() {
            counter!("trellis_cache_set_total", "backend" => self.inner.backend()).increment(1);
        }
        self.finish(&span, "set", started, &result);
        result
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        let span = self.span("get", key);
        let started = Instant::now();
        let result = self.inner.get(key).instrument(span.clone()).await;
        self.record_lookup(&span, result.is_ok());
        self.finish(&span, "get", started, &result);
        result
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        let span = self.span("peek", key);
        let started = Instant::now();
        let result = self.inner.peek(key).instrument(span.clone()).await;
        span.record("hit", result.is_ok());
        self.finish(&span, "peek", started, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let span = self.span("delete", key);
        let started = Instant::now();
        let result = self.inner.delete(key).instrument(span.clone()).await;
        self.finish(&span, "delete", started, &result);
        result
    }

    async fn exists(&self, key: &str) -> bool {
        let span = self.span("exists", key);
        let started = Instant::now();
        let found = self.inner.exists(key).instrument(span.clone()).await;
        span.record("hit", found);
        span.record("elapsed_ms", elapsed_ms(started.elapsed()));
        found
    }

    async fn len(&self) -> i64 {
        let span = self.span("len", "");
        self.inner.len().instrument(span).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let span = self.span("clear", "");
        let started = Instant::now();
        let result = self.inner.clear().instrument(span.clone()).await;
        self.finish(&span, "clear", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LruCache, ShardedMapCache};
    use std::num::NonZeroUsize;

    #[test]
    fn long_keys_are_truncated_on_char_boundaries() {
        let key = "é".repeat(100);
        let truncated = truncate_key(&key);
        assert_eq!(truncated.chars().count(), MAX_KEY_CHARS);
        assert_eq!(truncate_key("short"), "short");
    }

    #[tokio::test]
    async fn decorator_preserves_backend_semantics() {
        let inner: Arc<dyn Cache<u32>> = Arc::new(ShardedMapCache::new());
        let cache = Traced::new(inner, "u32");

        cache.set("k", 5, None).await.expect("set");
        assert_eq!(cache.get("k").await.expect("get"), 5);
        assert_eq!(cache.peek("k").await.expect("peek"), 5);
        assert!(cache.exists("k").await);
        assert_eq!(cache.len().await, 1);

        cache.delete("k").await.expect("delete");
        assert!(!cache.exists("k").await);
        assert!(cache.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn span_bound_handles_share_the_store() {
        let inner: Arc<dyn Cache<u32>> =
            Arc::new(LruCache::new(NonZeroUsize::new(4).expect("non-zero")));
        let cache = Traced::new(inner, "u32");
        let scoped = cache.with_span(tracing::info_span!("request"));

        scoped.set("k", 9, None).await.expect("set via scoped handle");
        assert_eq!(cache.get("k").await.expect("visible to root handle"), 9);
        assert_eq!(scoped.class(), CacheClass::NoExpiration);
    }
}
