use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use trellis::application::{Context, Db, Error, ListQuery, ModelRegistry, Service};
use trellis::demo::{self, Group, ROOT_GROUP_ID, User};
use trellis::infra::store::MemoryStore;

fn demo_db(models: Arc<ModelRegistry>, archive: Option<Arc<MemoryStore>>) -> Db {
    let mut builder = Db::builder(Arc::new(MemoryStore::default())).models(models);
    if let Some(archive) = archive {
        builder = builder.store("archive", archive);
    }
    builder.build().expect("db")
}

#[tokio::test]
async fn bootstrap_twice_keeps_a_single_seed_row() {
    let models = demo::registry().expect("registry");
    let db = demo_db(models.clone(), None);

    models.bootstrap(&db).await.expect("first bootstrap");
    let first = db
        .table::<Group>()
        .get(ROOT_GROUP_ID)
        .await
        .expect("root group");

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    models.bootstrap(&db).await.expect("second bootstrap");

    let all = db
        .table::<Group>()
        .list()
        .await
        .expect("list groups");
    assert!(
        all.items.iter().all(|group| group.base.id != ROOT_GROUP_ID),
        "root stays hidden from listings"
    );

    let again = db
        .table::<Group>()
        .get(ROOT_GROUP_ID)
        .await
        .expect("root group after second bootstrap");
    assert_eq!(again.name, first.name);
    assert_eq!(again.base.created_at, first.base.created_at);
    assert!(again.base.updated_at >= first.base.updated_at);
}

#[tokio::test]
async fn models_on_named_stores_use_their_engine() {
    let archive = Arc::new(MemoryStore::new("archive"));
    let models = ModelRegistry::builder()
        .register_seeded::<Group>(vec![demo::root_group()])
        .register_on::<User>("archive")
        .build()
        .expect("registry");
    let db = demo_db(models.clone(), Some(archive.clone()));
    models.bootstrap(&db).await.expect("bootstrap");

    assert_eq!(models.store_for::<User>(), Some("archive"));
    assert_eq!(models.store_for::<Group>(), None);

    let mut users = vec![User {
        name: "grace".into(),
        ..User::default()
    }];
    db.table::<User>().create(&mut users).await.expect("create");
    let stored = db
        .table::<User>()
        .get(&users[0].base.id)
        .await
        .expect("read back");
    assert_eq!(stored.name, "grace");

    let tx = db.begin(models.store_for::<User>()).await.expect("begin");
    assert_eq!(tx.store_name(), "archive");
    tx.rollback().await.expect("rollback");
}

#[tokio::test]
async fn unknown_named_store_is_rejected() {
    let models = ModelRegistry::builder()
        .register_on::<User>("missing")
        .build()
        .expect("registry");
    let db = demo_db(models.clone(), None);
    let err = models.bootstrap(&db).await.expect_err("missing store");
    assert!(matches!(err, Error::BadRequest(_) | Error::Internal(_)), "{err:?}");
}

struct CountingService {
    lists: Arc<AtomicUsize>,
}

#[async_trait]
impl Service<Group> for CountingService {
    async fn list_before(&self, _ctx: &Context, _query: &mut ListQuery) -> Result<(), Error> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn registered_services_replace_the_noop_fallback() {
    let lists = Arc::new(AtomicUsize::new(0));
    let models = ModelRegistry::builder()
        .register::<Group>()
        .register::<User>()
        .with_service::<Group>(CountingService {
            lists: lists.clone(),
        })
        .build()
        .expect("registry");

    let ctx = Context::background();
    let mut query = ListQuery::default();
    models
        .service::<Group>()
        .list_before(&ctx, &mut query)
        .await
        .expect("counting service");
    assert_eq!(lists.load(Ordering::SeqCst), 1);

    query.show_deleted = true;
    models
        .service::<User>()
        .list_before(&ctx, &mut query)
        .await
        .expect("users fall back to the no-op service");
    assert_eq!(lists.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn demo_user_service_gates_deleted_listings() {
    let models = demo::registry().expect("registry");
    let service = models.service::<User>();
    let mut query = ListQuery {
        show_deleted: true,
        ..ListQuery::default()
    };

    let err = service
        .list_before(&Context::background(), &mut query)
        .await
        .expect_err("anonymous");
    assert!(matches!(err, Error::BadRequest(_)));

    service
        .list_before(
            &Context::background().with_actor(demo::ADMIN_ACTOR),
            &mut query,
        )
        .await
        .expect("admin may list deleted users");
}
