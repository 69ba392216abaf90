use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::{Value, json};
use tower::ServiceExt;
use trellis::application::Db;
use trellis::cache::{Cache, CacheConfig, CacheRegistry, LruCache};
use trellis::demo;
use trellis::infra::http::HttpState;
use trellis::infra::store::MemoryStore;

async fn call(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn crud_and_cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Evictions straight from a full LRU.
    let lru = LruCache::new(NonZeroUsize::new(1).expect("non-zero"));
    lru.set("a", 1_u8, None).await.expect("set a");
    lru.set("b", 2_u8, None).await.expect("set b");

    let models = demo::registry().expect("registry");
    let caches = Arc::new(CacheRegistry::new(CacheConfig::default()).expect("caches"));
    let db = Db::builder(Arc::new(MemoryStore::default()))
        .models(models.clone())
        .caches(caches)
        .build()
        .expect("db");
    models.bootstrap(&db).await.expect("bootstrap");
    let app = demo::router(HttpState::new(db));

    let (status, created) = call(
        &app,
        Method::POST,
        "/user",
        Some(json!({"name": "ada", "email": "ada@example.com", "age": 36, "group_id": "root"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["data"]["id"].as_str().expect("id").to_string();

    for _ in 0..2 {
        let (status, _) = call(&app, Method::GET, &format!("/user/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = call(&app, Method::GET, "/user?name=ada", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        Method::PATCH,
        &format!("/user/{id}"),
        Some(json!({"age": 37})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "trellis_cache_hit_total",
        "trellis_cache_miss_total",
        "trellis_cache_set_total",
        "trellis_cache_evict_total",
        "trellis_cache_invalidations_total",
        "trellis_crud_reads_total",
        "trellis_crud_writes_total",
        "trellis_http_request_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
