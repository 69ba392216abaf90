use axum::{
    Router, middleware,
    routing::{MethodRouter, delete, get, patch, post, put},
};

use crate::domain::Model;

use super::controller::{self, Payload, Render};
use super::middleware::{log_responses, set_request_context};
use super::state::HttpState;

/// Endpoints mounted for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbs {
    pub create: bool,
    pub delete: bool,
    pub update: bool,
    pub patch: bool,
    pub list: bool,
    pub get: bool,
    pub batch_create: bool,
    pub batch_delete: bool,
    pub batch_update: bool,
    pub batch_patch: bool,
    pub import: bool,
    pub export: bool,
}

impl Verbs {
    pub const ALL: Verbs = Verbs {
        create: true,
        delete: true,
        update: true,
        patch: true,
        list: true,
        get: true,
        batch_create: true,
        batch_delete: true,
        batch_update: true,
        batch_patch: true,
        import: true,
        export: true,
    };

    pub const READ_ONLY: Verbs = Verbs {
        create: false,
        delete: false,
        update: false,
        patch: false,
        list: true,
        get: true,
        batch_create: false,
        batch_delete: false,
        batch_update: false,
        batch_patch: false,
        import: false,
        export: true,
    };
}

impl Default for Verbs {
    fn default() -> Self {
        Self::ALL
    }
}

/// Collects resources and builds the CRUD router.
///
/// ```ignore
/// let app = CrudRouter::new()
///     .resource::<User>("/user")
///     .resource_with::<Group, Group, Group>("/group", Verbs::READ_ONLY)
///     .build(HttpState::new(db));
/// ```
#[derive(Default)]
pub struct CrudRouter {
    router: Router<HttpState>,
}

fn merge(
    route: Option<MethodRouter<HttpState>>,
    next: MethodRouter<HttpState>,
) -> MethodRouter<HttpState> {
    match route {
        Some(route) => route.merge(next),
        None => next,
    }
}

impl CrudRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount every endpoint of `M` under `path`, with `M` as body and response.
    pub fn resource<M: Model>(self, path: &str) -> Self {
        self.resource_with::<M, M, M>(path, Verbs::ALL)
    }

    pub fn resource_with<M, Req, Rsp>(mut self, path: &str, verbs: Verbs) -> Self
    where
        M: Model,
        Req: Payload<M>,
        Rsp: Render<M>,
    {
        let path = path.trim_end_matches('/');
        let mut collection: Option<MethodRouter<HttpState>> = None;
        let mut member: Option<MethodRouter<HttpState>> = None;
        let mut batch: Option<MethodRouter<HttpState>> = None;

        if verbs.create {
            collection = Some(merge(collection, post(controller::create::<M, Req, Rsp>)));
        }
        if verbs.list {
            collection = Some(merge(collection, get(controller::list::<M, Rsp>)));
        }
        if verbs.delete {
            collection = Some(merge(collection, delete(controller::delete::<M, Req, Rsp>)));
            member = Some(merge(member, delete(controller::delete_by_id::<M, Rsp>)));
        }
        if verbs.update {
            collection = Some(merge(collection, put(controller::update::<M, Req, Rsp>)));
            member = Some(merge(member, put(controller::update_by_id::<M, Req, Rsp>)));
        }
        if verbs.patch {
            collection = Some(merge(collection, patch(controller::patch::<M, Req, Rsp>)));
            member = Some(merge(member, patch(controller::patch_by_id::<M, Req, Rsp>)));
        }
        if verbs.get {
            member = Some(merge(member, get(controller::get::<M, Rsp>)));
        }
        if verbs.batch_create {
            batch = Some(merge(batch, post(controller::batch_create::<M, Req, Rsp>)));
        }
        if verbs.batch_delete {
            batch = Some(merge(batch, delete(controller::batch_delete::<M, Req>)));
        }
        if verbs.batch_update {
            batch = Some(merge(batch, put(controller::batch_update::<M, Req, Rsp>)));
        }
        if verbs.batch_patch {
            batch = Some(merge(
                batch,
                patch(controller::batch_update_partial::<M, Req, Rsp>),
            ));
        }

        let mut router = self.router;
        if let Some(route) = collection {
            router = router.route(path, route);
        }
        if let Some(route) = batch {
            router = router.route(&format!("{path}/batch"), route);
        }
        if verbs.import {
            router = router.route(
                &format!("{path}/import"),
                post(controller::import::<M, Req>),
            );
        }
        if verbs.export {
            router = router.route(
                &format!("{path}/export"),
                get(controller::export::<M, Rsp>),
            );
        }
        if let Some(route) = member {
            router = router.route(&format!("{path}/{{id}}"), route);
        }
        self.router = router;
        self
    }

    pub fn build(self, state: HttpState) -> Router {
        self.router
            .route("/healthz", get(controller::healthz))
            .layer(middleware::from_fn(log_responses))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                set_request_context,
            ))
            .with_state(state)
    }
}
