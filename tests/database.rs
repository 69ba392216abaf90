use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::datetime;
use trellis::application::cursor::CursorQuery;
use trellis::application::store::OrderBy;
use trellis::application::{Context, Db, Error, ErrorKind, ListQuery, ModelRegistry};
use trellis::cache::{CacheBackend, CacheConfig, CacheRegistry};
use trellis::config::CrudSettings;
use trellis::domain::{Base, DomainError, Field, Model, Schema};
use trellis::infra::store::MemoryStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Note {
    #[serde(flatten)]
    base: Base,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    pinned: Option<bool>,
    #[serde(default)]
    slug: Option<String>,
    /// Set by the create hook.
    #[serde(default)]
    checked: bool,
}

#[async_trait]
impl Model for Note {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn schema() -> &'static Schema {
        static SCHEMA: Lazy<Schema> = Lazy::new(|| {
            Schema::new()
                .field(Field::string("title").filterable())
                .field(Field::string("body"))
                .field(Field::int("score").filterable())
                .field(Field::bool("pinned").optional().filterable())
                .field(Field::string("slug").optional().unique())
                .field(Field::bool("checked"))
        });
        &SCHEMA
    }

    async fn create_before(&mut self, _ctx: &Context) -> Result<(), DomainError> {
        if self.title == "forbidden" {
            return Err(DomainError::validation("forbidden title"));
        }
        self.checked = true;
        Ok(())
    }
}

fn note(title: &str, score: i64) -> Note {
    Note {
        title: title.to_string(),
        score,
        ..Note::default()
    }
}

async fn db() -> Db {
    let models = ModelRegistry::builder()
        .register::<Note>()
        .build()
        .expect("registry");
    let db = Db::builder(Arc::new(MemoryStore::default()))
        .models(models.clone())
        .build()
        .expect("db");
    models.bootstrap(&db).await.expect("bootstrap");
    db
}

async fn insert(db: &Db, notes: Vec<Note>) -> Vec<Note> {
    let mut notes = notes;
    db.table::<Note>().create(&mut notes).await.expect("create");
    notes
}

#[tokio::test]
async fn created_records_read_back_equal() {
    let db = db().await;
    let mut created = insert(&db, vec![note("first", 3)]).await;
    let created = created.remove(0);
    assert!(!created.base.id.is_empty());
    assert!(created.base.created_at.is_some());

    let fetched = db.table::<Note>().get(&created.base.id).await.expect("get");
    assert_eq!(fetched.title, created.title);
    assert_eq!(fetched.score, 3);
    assert!(fetched.checked);
    assert_eq!(fetched.base.id, created.base.id);
    assert_eq!(fetched.base.created_at, created.base.created_at);

    let err = db.table::<Note>().get("missing").await.expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = db.table::<Note>().get("").await.expect_err("empty id");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn partial_updates_follow_the_optional_rule() {
    let db = db().await;
    let mut stored = insert(
        &db,
        vec![Note {
            body: "keep me".into(),
            pinned: Some(true),
            ..note("title", 5)
        }],
    )
    .await;
    let id = stored.remove(0).base.id;

    let mut patch = vec![Note {
        base: Base::with_id(id.clone()),
        pinned: Some(false),
        ..Note::default()
    }];
    db.table::<Note>()
        .update_partial(&mut patch)
        .await
        .expect("partial update");

    let fetched = db.table::<Note>().get(&id).await.expect("get");
    assert_eq!(fetched.pinned, Some(false), "present optional zero applies");
    assert_eq!(fetched.score, 5, "plain zero leaves the column alone");
    assert_eq!(fetched.body, "keep me");
    assert_eq!(fetched.title, "title");
    assert_eq!(patch[0].title, "title", "caller sees the merged record");

    let mut nameless = vec![Note::default()];
    let err = db
        .table::<Note>()
        .update_partial(&mut nameless)
        .await
        .expect_err("id required");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn delete_is_soft_unless_purged() {
    let db = db().await;
    let mut notes = insert(&db, vec![note("a", 1), note("b", 2)]).await;
    let (a, b) = (notes[0].base.id.clone(), notes[1].base.id.clone());

    db.table::<Note>()
        .delete(&mut notes[..1])
        .await
        .expect("soft delete");
    assert!(notes[0].base.deleted_at.is_some());
    let err = db.table::<Note>().get(&a).await.expect_err("hidden");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let shown = db
        .table::<Note>()
        .with_show_deleted()
        .get(&a)
        .await
        .expect("still stored");
    assert!(shown.base.deleted_at.is_some());

    db.table::<Note>()
        .with_purge()
        .delete(&mut notes[1..])
        .await
        .expect("purge");
    let err = db
        .table::<Note>()
        .with_show_deleted()
        .get(&b)
        .await
        .expect_err("purged");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(db.table::<Note>().cleanup().await.expect("cleanup"), 1);
    let err = db
        .table::<Note>()
        .with_show_deleted()
        .get(&a)
        .await
        .expect_err("cleaned");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn query_filters_match_set_fields_only() {
    let db = db().await;
    insert(
        &db,
        vec![note("alpha", 1), note("beta", 1), note("alpha", 2), note("gamma", 0)],
    )
    .await;

    let page = db
        .table::<Note>()
        .with_query(&note("alpha", 0), false)
        .list()
        .await
        .expect("list");
    assert_eq!(page.items.len(), 2);
    assert!(page.items.iter().all(|item| item.title == "alpha"));

    let page = db
        .table::<Note>()
        .with_query(&note("alpha", 2), false)
        .list()
        .await
        .expect("list");
    assert_eq!(page.items.len(), 1);

    let page = db
        .table::<Note>()
        .with_query(&note("mm", 0), true)
        .list()
        .await
        .expect("fuzzy list");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].title, "gamma");

    let page = db
        .table::<Note>()
        .with_query(&note("beta", 2), false)
        .with_or()
        .list()
        .await
        .expect("or list");
    assert_eq!(page.items.len(), 2);

    assert_eq!(db.table::<Note>().count().await.expect("count"), 4);
}

#[tokio::test]
async fn atomic_units_leave_the_store_untouched_on_failure() {
    let db = db().await;
    insert(
        &db,
        vec![Note {
            slug: Some("taken".into()),
            ..note("existing", 1)
        }],
    )
    .await;
    let before = db.table::<Note>().list().await.expect("before");

    let mut tx = db.begin(None).await.expect("begin");
    let mut first = vec![note("fresh", 2)];
    db.table::<Note>()
        .with_transaction(&mut tx)
        .create(&mut first)
        .await
        .expect("first write");
    let mut clash = vec![Note {
        slug: Some("taken".into()),
        ..note("clash", 3)
    }];
    let err = db
        .table::<Note>()
        .with_transaction(&mut tx)
        .create(&mut clash)
        .await
        .expect_err("unique violation");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    tx.rollback().await.expect("rollback");

    let after = db.table::<Note>().list().await.expect("after");
    assert_eq!(before, after);

    let mut tx = db.begin(None).await.expect("begin");
    let mut trial = vec![note("trial", 1)];
    db.table::<Note>()
        .with_transaction(&mut tx)
        .create(&mut trial)
        .await
        .expect("write");
    tx.commit().await.expect("commit");
    assert_eq!(db.table::<Note>().count().await.expect("count"), 2);
}

#[tokio::test]
async fn try_run_validates_without_persisting() {
    let db = db().await;
    let mut notes = vec![note("dry", 1)];
    db.table::<Note>()
        .with_try_run()
        .create(&mut notes)
        .await
        .expect("dry run");
    assert_eq!(db.table::<Note>().count().await.expect("count"), 0);

    let mut rejected = vec![note("forbidden", 1)];
    let err = db
        .table::<Note>()
        .create(&mut rejected)
        .await
        .expect_err("hook rejects");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn cursor_pages_concatenate_to_the_full_list() {
    let db = db().await;
    let scores = [5, 1, 3, 3, 2, 5, 4, 1];
    insert(
        &db,
        scores
            .iter()
            .enumerate()
            .map(|(n, score)| note(&format!("n{n}"), *score))
            .collect(),
    )
    .await;

    let full = db
        .table::<Note>()
        .with_order(vec![OrderBy::asc("score")])
        .list()
        .await
        .expect("full list");
    let expected: Vec<String> = full.items.iter().map(|item| item.base.id.clone()).collect();
    assert_eq!(expected.len(), scores.len());

    let fields = vec!["score".to_string()];
    let mut seen = Vec::new();
    let mut cursor = None;
    let mut pages = Vec::new();
    loop {
        let page = db
            .table::<Note>()
            .with_cursor(
                CursorQuery {
                    value: cursor.clone(),
                    fields: fields.clone(),
                    next: true,
                },
                3,
            )
            .list()
            .await
            .expect("cursor page");
        seen.extend(page.items.iter().map(|item| item.base.id.clone()));
        pages.push(page.clone());
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, expected);
    assert_eq!(pages.len(), 3);
    assert!(pages[0].prev_cursor.is_none());

    let back = db
        .table::<Note>()
        .with_cursor(
            CursorQuery {
                value: pages[2].prev_cursor.clone(),
                fields: fields.clone(),
                next: false,
            },
            3,
        )
        .list()
        .await
        .expect("previous page");
    assert_eq!(back.items, pages[1].items);
}

struct CursorWalk {
    ids: Vec<String>,
    pages: Vec<Vec<String>>,
    prev: Vec<Option<String>>,
}

async fn walk_cursor(db: &Db, order: &[OrderBy], fields: &[&str], size: u32) -> CursorWalk {
    let fields: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
    let mut walk = CursorWalk {
        ids: Vec::new(),
        pages: Vec::new(),
        prev: Vec::new(),
    };
    let mut cursor = None;
    loop {
        let page = db
            .table::<Note>()
            .with_order(order.to_vec())
            .with_cursor(
                CursorQuery {
                    value: cursor.clone(),
                    fields: fields.clone(),
                    next: true,
                },
                size,
            )
            .list()
            .await
            .expect("cursor page");
        let ids: Vec<String> = page.items.iter().map(|item| item.base.id.clone()).collect();
        walk.ids.extend(ids.iter().cloned());
        walk.pages.push(ids);
        walk.prev.push(page.prev_cursor.clone());
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    walk
}

async fn listed_ids(db: &Db, order: &[OrderBy]) -> Vec<String> {
    db.table::<Note>()
        .with_order(order.to_vec())
        .list()
        .await
        .expect("full list")
        .items
        .iter()
        .map(|item| item.base.id.clone())
        .collect()
}

#[tokio::test]
async fn mixed_direction_cursor_pages_concatenate_to_the_full_list() {
    let db = db().await;
    insert(
        &db,
        vec![
            note("a", 5),
            note("b", 5),
            note("c", 3),
            note("d", 3),
            note("e", 5),
        ],
    )
    .await;

    let order = [OrderBy::desc("score"), OrderBy::asc("title")];
    let full = listed_ids(&db, &order).await;
    let walk = walk_cursor(&db, &order, &["score", "title"], 2).await;
    assert_eq!(walk.ids, full);
    assert_eq!(walk.pages.len(), 3);

    let titles: Vec<String> = db
        .table::<Note>()
        .with_order(order.to_vec())
        .list()
        .await
        .expect("list")
        .items
        .into_iter()
        .map(|item| item.title)
        .collect();
    assert_eq!(titles, vec!["a", "b", "e", "c", "d"]);

    let back = db
        .table::<Note>()
        .with_order(order.to_vec())
        .with_cursor(
            CursorQuery {
                value: walk.prev[2].clone(),
                fields: vec!["score".into(), "title".into()],
                next: false,
            },
            2,
        )
        .list()
        .await
        .expect("previous page");
    let back: Vec<String> = back.items.iter().map(|item| item.base.id.clone()).collect();
    assert_eq!(back, walk.pages[1]);
}

#[tokio::test]
async fn cursors_walk_past_null_values() {
    let db = db().await;
    let slugs = [Some("b"), None, Some("a"), None, Some("c")];
    insert(
        &db,
        slugs
            .iter()
            .enumerate()
            .map(|(n, slug)| Note {
                slug: slug.map(str::to_string),
                ..note(&format!("s{n}"), 1)
            })
            .collect(),
    )
    .await;

    for order in [[OrderBy::desc("slug")], [OrderBy::asc("slug")]] {
        let full = listed_ids(&db, &order).await;
        assert_eq!(full.len(), slugs.len());
        let walk = walk_cursor(&db, &order, &["slug"], 2).await;
        assert_eq!(walk.ids, full, "{order:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_fills_racing_writes_never_outlive_them() {
    let models = ModelRegistry::builder()
        .register::<Note>()
        .build()
        .expect("registry");
    let caches = CacheRegistry::new(CacheConfig {
        backend: CacheBackend::ShardedMap,
        ..CacheConfig::default()
    })
    .expect("caches");
    let db = Db::builder(Arc::new(MemoryStore::default()))
        .models(models.clone())
        .caches(Arc::new(caches))
        .build()
        .expect("db");
    models.bootstrap(&db).await.expect("bootstrap");
    let mut tracked = insert(&db, vec![note("tracked", 0)]).await.remove(0);

    for round in 1..=200_i64 {
        let mut readers = Vec::new();
        for _ in 0..4 {
            let db = db.clone();
            let id = tracked.base.id.clone();
            readers.push(tokio::spawn(async move {
                db.table::<Note>().with_cache().list().await.expect("cached list");
                db.table::<Note>().with_cache().get(&id).await.expect("cached get");
            }));
        }
        let writer = {
            let db = db.clone();
            let mut updated = tracked.clone();
            updated.score = round;
            tokio::spawn(async move {
                let mut fresh = vec![note(&format!("r{round}"), round)];
                db.table::<Note>().create(&mut fresh).await.expect("create");
                let mut batch = vec![updated];
                db.table::<Note>().update(&mut batch).await.expect("update");
                batch.remove(0)
            })
        };
        for reader in readers {
            reader.await.expect("reader");
        }
        tracked = writer.await.expect("writer");

        let cached = db.table::<Note>().with_cache().list().await.expect("cached");
        let stored = db.table::<Note>().list().await.expect("stored");
        assert_eq!(cached.items, stored.items, "round {round}");
        let record = db
            .table::<Note>()
            .with_cache()
            .get(&tracked.base.id)
            .await
            .expect("cached record");
        assert_eq!(record.score, round, "round {round}");
    }
}

#[tokio::test]
async fn time_windows_are_inclusive_and_order_free() {
    let db = db().await;
    let stamps = [
        datetime!(2024-01-01 00:00:00 UTC),
        datetime!(2024-01-02 00:00:00 UTC),
        datetime!(2024-01-03 00:00:00 UTC),
    ];
    insert(
        &db,
        stamps
            .iter()
            .map(|at| {
                let mut item = note("stamped", 1);
                item.base.created_at = Some(*at);
                item
            })
            .collect(),
    )
    .await;

    let page = db
        .table::<Note>()
        .with_time_range("created_at", Some(stamps[2]), Some(stamps[0]))
        .list()
        .await
        .expect("swapped window");
    assert_eq!(page.items.len(), 3);

    let page = db
        .table::<Note>()
        .with_time_range("created_at", Some(stamps[1]), Some(stamps[1]))
        .list()
        .await
        .expect("point window");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].base.created_at, Some(stamps[1]));

    let pairs = vec![
        ("_column_name".to_string(), "created_at".to_string()),
        ("_start_time".to_string(), "2024-01-02 00:00:00".to_string()),
        ("_end_time".to_string(), "2024-01-03 00:00:00".to_string()),
    ];
    let query =
        ListQuery::decode(&pairs, Note::schema(), &CrudSettings::default()).expect("decode");
    let page = db
        .table::<Note>()
        .with_descriptor(&query)
        .list()
        .await
        .expect("decoded window");
    assert_eq!(page.items.len(), 2);
}

#[tokio::test]
async fn without_hook_skips_model_hooks_only() {
    let db = db().await;
    let mut hooked = vec![note("hooked", 1)];
    db.table::<Note>().create(&mut hooked).await.expect("create");
    assert!(hooked[0].checked);

    let mut raw = vec![note("forbidden", 1)];
    db.table::<Note>()
        .without_hook()
        .create(&mut raw)
        .await
        .expect("hooks skipped");
    assert!(!raw[0].checked);
}

#[tokio::test]
async fn single_column_updates_and_paging() {
    let db = db().await;
    let notes = insert(&db, (0..5).map(|n| note(&format!("p{n}"), n)).collect()).await;
    let id = notes[0].base.id.clone();

    db.table::<Note>()
        .update_by_id(&id, "body", "patched")
        .await
        .expect("update by id");
    let fetched = db.table::<Note>().get(&id).await.expect("get");
    assert_eq!(fetched.body, "patched");

    let err = db
        .table::<Note>()
        .update_by_id(&id, "nope", 1)
        .await
        .expect_err("unknown column");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    let err = db
        .table::<Note>()
        .update_by_id("missing", "body", "x")
        .await
        .expect_err("unknown id");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let page = db
        .table::<Note>()
        .with_order(vec![OrderBy::desc("score")])
        .with_page(2, 2)
        .list()
        .await
        .expect("page two");
    let scores: Vec<i64> = page.items.iter().map(|item| item.score).collect();
    assert_eq!(scores, vec![2, 1]);
    assert_eq!(page.total, Some(5));

    let page = db
        .table::<Note>()
        .with_select(["title"])
        .without_total()
        .list()
        .await
        .expect("projection");
    assert!(page.total.is_none());
    assert!(page.items.iter().all(|item| item.score == 0 && !item.title.is_empty()));
}

#[tokio::test]
async fn expired_deadlines_cancel_before_any_write() {
    let db = db().await;
    let ctx = Context::background().with_timeout(Duration::ZERO);
    let mut notes = vec![note("late", 1)];
    let err = db
        .table::<Note>()
        .with_context(&ctx)
        .create(&mut notes)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled { committed: false }));
    assert_eq!(db.table::<Note>().count().await.expect("count"), 0);
}

#[tokio::test]
async fn actors_are_stamped_on_writes() {
    let db = db().await;
    let ctx = Context::background().with_actor("ada");
    let mut notes = vec![note("audited", 1)];
    db.table::<Note>()
        .with_context(&ctx)
        .create(&mut notes)
        .await
        .expect("create");
    let fetched = db
        .table::<Note>()
        .get(&notes[0].base.id)
        .await
        .expect("get");
    assert_eq!(fetched.base.created_by, "ada");
    assert_eq!(fetched.base.updated_by, "ada");
    assert!(fetched.base.updated_at.is_some_and(|at| at <= OffsetDateTime::now_utc()));
}
