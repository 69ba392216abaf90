//! Generic CRUD handlers.
//!
//! Every handler is monomorphized per resource as `handler::<M, Req, Rsp>`:
//! `M` is the stored model, `Req` the accepted body and `Rsp` the rendered
//! item. Each one runs the service before-hook, the database operation and
//! the service after-hook, in that order. After-hook failures of mutating
//! endpoints are reported as [`Error::AfterHook`]; the mutation stays.

use std::slice;
use std::sync::Arc;

use axum::{
    Extension,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use trellis_api_types::{BatchDeleteSummary, BatchRequest, ImportSummary};

use crate::application::error::ErrorReport;
use crate::application::{Context, Database, Error, ListQuery, Phase, Service, Tx};
use crate::domain::Model;

use super::envelope;
use super::error::ApiError;
use super::state::HttpState;

const SOURCE: &str = "infra::http::controller";

type ApiResult = Result<Response, ApiError>;

/// Request body accepted in place of `M`.
pub trait Payload<M>: DeserializeOwned + Send + 'static {
    fn into_model(self) -> M;
}

impl<M: Model> Payload<M> for M {
    fn into_model(self) -> M {
        self
    }
}

/// Bound shared by every rendered item type.
pub trait Render<M>: From<M> + Serialize + Send + 'static {}

impl<M, T> Render<M> for T where T: From<M> + Serialize + Send + 'static {}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request(SOURCE, "request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(SOURCE, format!("invalid request body: {err}")))
}

fn query_pairs(raw: Option<String>) -> Vec<(String, String)> {
    raw.map(|raw| {
        url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect()
    })
    .unwrap_or_default()
}

fn service<M: Model>(state: &HttpState) -> Arc<dyn Service<M>> {
    state.db.models().service::<M>()
}

/// Wraps after-hook failures so callers can tell the mutation persisted.
fn after_hook(phase: Phase, result: Result<(), Error>) -> Result<(), Error> {
    result.map_err(|err| match err {
        Error::Cancelled { .. } => Error::Cancelled { committed: true },
        err => Error::after_hook(phase.as_str(), err),
    })
}

fn render<M, Rsp: Render<M>>(item: M) -> Response {
    envelope::success(Rsp::from(item))
}

fn render_all<M, Rsp: Render<M>>(items: Vec<M>) -> Response {
    envelope::success(items.into_iter().map(Rsp::from).collect::<Vec<_>>())
}

/// Decoded body item passed through the service filter.
fn incoming<M, Req>(ctx: &Context, svc: &dyn Service<M>, req: Req) -> M
where
    M: Model,
    Req: Payload<M>,
{
    svc.filter(ctx, req.into_model())
}

fn require_ids<M: Model>(items: &[M]) -> Result<(), ApiError> {
    match items.iter().position(|item| item.id().is_empty()) {
        Some(position) => Err(ApiError::bad_request(
            SOURCE,
            format!("item {position} has no id"),
        )),
        None => Ok(()),
    }
}

fn bind_path_id<M: Model>(item: &mut M, id: String) -> Result<(), ApiError> {
    let current = item.id();
    if !current.is_empty() && current != id {
        return Err(ApiError::bad_request(
            SOURCE,
            format!("body id {current} does not match path id {id}"),
        ));
    }
    item.base_mut().id = id;
    Ok(())
}

/// List builder carrying the service scope and the decoded descriptor.
fn scoped_list<'a, M: Model>(
    state: &'a HttpState,
    ctx: &Context,
    svc: &dyn Service<M>,
    query: &ListQuery,
    paged: bool,
) -> Database<'a, M> {
    let probe = svc.filter(ctx, M::default());
    let raw = svc.filter_raw(ctx);
    let mut table = state.db.table::<M>().with_context(ctx);
    if paged {
        table = table.with_page(1, state.db.settings().default_page_size);
    }
    // The service scope is applied last so request filters cannot replace it.
    let mut table = table.with_descriptor(query).with_query(&probe, false);
    if !raw.trim().is_empty() {
        table = table.with_query_raw(raw, Vec::new());
    }
    table
}

fn decode_query<M: Model>(state: &HttpState, raw: Option<String>) -> Result<ListQuery, Error> {
    ListQuery::decode(&query_pairs(raw), M::schema(), state.db.settings())
}

pub async fn create<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let mut item = incoming(&ctx, svc.as_ref(), parse_body::<Req>(&body)?);
    svc.create_before(&ctx, &mut item).await?;
    state
        .db
        .table::<M>()
        .with_context(&ctx)
        .create(slice::from_mut(&mut item))
        .await?;
    after_hook(Phase::CreateAfter, svc.create_after(&ctx, &mut item).await)?;
    Ok(render::<M, Rsp>(item))
}

async fn delete_one<M: Model>(state: &HttpState, ctx: &Context, mut item: M) -> Result<M, Error> {
    let svc = service::<M>(state);
    svc.delete_before(ctx, &mut item).await?;
    state
        .db
        .table::<M>()
        .with_context(ctx)
        .delete(slice::from_mut(&mut item))
        .await?;
    after_hook(Phase::DeleteAfter, svc.delete_after(ctx, &mut item).await)?;
    Ok(item)
}

pub async fn delete_by_id<M, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    Path(id): Path<String>,
) -> ApiResult
where
    M: Model,
    Rsp: Render<M>,
{
    let mut item = M::default();
    item.base_mut().id = id;
    let item = delete_one(&state, &ctx, item).await?;
    Ok(render::<M, Rsp>(item))
}

pub async fn delete<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let item = parse_body::<Req>(&body)?.into_model();
    require_ids(slice::from_ref(&item))?;
    let item = delete_one(&state, &ctx, item).await?;
    Ok(render::<M, Rsp>(item))
}

async fn update_one<M: Model>(
    state: &HttpState,
    ctx: &Context,
    mut item: M,
    partial: bool,
) -> Result<M, Error> {
    let svc = service::<M>(state);
    let table = state.db.table::<M>().with_context(ctx);
    if partial {
        svc.update_partial_before(ctx, &mut item).await?;
        table.update_partial(slice::from_mut(&mut item)).await?;
        after_hook(
            Phase::UpdatePartialAfter,
            svc.update_partial_after(ctx, &mut item).await,
        )?;
    } else {
        svc.update_before(ctx, &mut item).await?;
        table.update(slice::from_mut(&mut item)).await?;
        after_hook(Phase::UpdateAfter, svc.update_after(ctx, &mut item).await)?;
    }
    Ok(item)
}

pub async fn update_by_id<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let mut item = incoming(&ctx, svc.as_ref(), parse_body::<Req>(&body)?);
    bind_path_id(&mut item, id)?;
    let item = update_one(&state, &ctx, item, false).await?;
    Ok(render::<M, Rsp>(item))
}

pub async fn update<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let item = incoming(&ctx, svc.as_ref(), parse_body::<Req>(&body)?);
    require_ids(slice::from_ref(&item))?;
    let item = update_one(&state, &ctx, item, false).await?;
    Ok(render::<M, Rsp>(item))
}

pub async fn patch_by_id<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let mut item = incoming(&ctx, svc.as_ref(), parse_body::<Req>(&body)?);
    bind_path_id(&mut item, id)?;
    let item = update_one(&state, &ctx, item, true).await?;
    Ok(render::<M, Rsp>(item))
}

pub async fn patch<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let item = incoming(&ctx, svc.as_ref(), parse_body::<Req>(&body)?);
    require_ids(slice::from_ref(&item))?;
    let item = update_one(&state, &ctx, item, true).await?;
    Ok(render::<M, Rsp>(item))
}

pub async fn list<M, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    RawQuery(raw): RawQuery,
) -> ApiResult
where
    M: Model,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let mut query = decode_query::<M>(&state, raw)?;
    svc.list_before(&ctx, &mut query).await?;
    let mut page = scoped_list(&state, &ctx, svc.as_ref(), &query, true)
        .with_cache()
        .list()
        .await?;
    svc.list_after(&ctx, &mut page).await?;
    Ok(envelope::success(page.map(Rsp::from).into_payload()))
}

pub async fn get<M, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult
where
    M: Model,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let query = decode_query::<M>(&state, raw)?;
    svc.get_before(&ctx, &id).await?;
    let mut item = state
        .db
        .table::<M>()
        .with_context(&ctx)
        .with_cache()
        .with_descriptor(&query)
        .get(&id)
        .await?;
    svc.get_after(&ctx, &mut item).await?;
    Ok(render::<M, Rsp>(item))
}

/// Batch items after the service filter, bounded by the batch limit.
fn batch_items<M, Req>(
    state: &HttpState,
    ctx: &Context,
    svc: &dyn Service<M>,
    request: BatchRequest<Req>,
) -> Result<(Vec<M>, bool), ApiError>
where
    M: Model,
    Req: Payload<M>,
{
    let atomic = request.options.atomic;
    let items: Vec<M> = if request.items.is_empty() {
        request
            .ids
            .into_iter()
            .map(|id| {
                let mut item = M::default();
                item.base_mut().id = id;
                item
            })
            .collect()
    } else {
        request
            .items
            .into_iter()
            .map(|req| incoming(ctx, svc, req))
            .collect()
    };
    if items.is_empty() {
        return Err(ApiError::bad_request(SOURCE, "batch is empty"));
    }
    let limit = state.db.settings().batch_limit;
    if items.len() > limit {
        return Err(ApiError::bad_request(
            SOURCE,
            format!("batch of {} exceeds the limit of {limit}", items.len()),
        ));
    }
    Ok((items, atomic))
}

#[derive(Clone, Copy)]
enum BatchOp {
    Create,
    Delete,
    Update,
    UpdatePartial,
}

impl BatchOp {
    fn as_str(&self) -> &'static str {
        match self {
            BatchOp::Create => "batch_create",
            BatchOp::Delete => "batch_delete",
            BatchOp::Update => "batch_update",
            BatchOp::UpdatePartial => "batch_update_partial",
        }
    }

    async fn apply<M: Model>(&self, table: Database<'_, M>, items: &mut [M]) -> Result<(), Error> {
        match self {
            BatchOp::Create => table.create(items).await,
            BatchOp::Delete => table.delete(items).await,
            BatchOp::Update => table.update(items).await,
            BatchOp::UpdatePartial => table.update_partial(items).await,
        }
    }
}

/// Persist a batch: one transaction when `atomic`, otherwise item by item.
async fn persist_batch<M: Model>(
    state: &HttpState,
    ctx: &Context,
    op: BatchOp,
    items: &mut [M],
    atomic: bool,
) -> Result<(), Error> {
    let table = state.db.table::<M>().with_context(ctx);
    if !atomic {
        return op.apply(table.with_limit(1), items).await;
    }

    let mut tx: Tx = state.db.begin(state.db.models().store_for::<M>()).await?;
    let result = op.apply(table.with_transaction(&mut tx), items).await;
    match result {
        Ok(()) => {
            tx.commit().await?;
            debug!(
                target = "trellis::http::batch",
                op = op.as_str(),
                items = items.len(),
                "atomic batch committed"
            );
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                debug!(
                    target = "trellis::http::batch",
                    op = op.as_str(),
                    error = %rollback,
                    "atomic batch rollback failed"
                );
            }
            Err(err)
        }
    }
}

pub async fn batch_create<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let request = parse_body::<BatchRequest<Req>>(&body)?;
    let (mut items, atomic) = batch_items(&state, &ctx, svc.as_ref(), request)?;
    svc.batch_create_before(&ctx, &mut items).await?;
    persist_batch(&state, &ctx, BatchOp::Create, &mut items, atomic).await?;
    after_hook(
        Phase::BatchCreateAfter,
        svc.batch_create_after(&ctx, &mut items).await,
    )?;
    Ok(render_all::<M, Rsp>(items))
}

pub async fn batch_delete<M, Req>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
{
    let svc = service::<M>(&state);
    let request = parse_body::<BatchRequest<Req>>(&body)?;
    let (mut items, atomic) = batch_items(&state, &ctx, svc.as_ref(), request)?;
    require_ids(&items)?;
    svc.batch_delete_before(&ctx, &mut items).await?;
    persist_batch(&state, &ctx, BatchOp::Delete, &mut items, atomic).await?;
    after_hook(
        Phase::BatchDeleteAfter,
        svc.batch_delete_after(&ctx, &mut items).await,
    )?;
    Ok(envelope::success(BatchDeleteSummary {
        deleted: items.len(),
    }))
}

pub async fn batch_update<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let request = parse_body::<BatchRequest<Req>>(&body)?;
    let (mut items, atomic) = batch_items(&state, &ctx, svc.as_ref(), request)?;
    require_ids(&items)?;
    svc.batch_update_before(&ctx, &mut items).await?;
    persist_batch(&state, &ctx, BatchOp::Update, &mut items, atomic).await?;
    after_hook(
        Phase::BatchUpdateAfter,
        svc.batch_update_after(&ctx, &mut items).await,
    )?;
    Ok(render_all::<M, Rsp>(items))
}

pub async fn batch_update_partial<M, Req, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let request = parse_body::<BatchRequest<Req>>(&body)?;
    let (mut items, atomic) = batch_items(&state, &ctx, svc.as_ref(), request)?;
    require_ids(&items)?;
    svc.batch_update_partial_before(&ctx, &mut items).await?;
    persist_batch(&state, &ctx, BatchOp::UpdatePartial, &mut items, atomic).await?;
    after_hook(
        Phase::BatchUpdatePartialAfter,
        svc.batch_update_partial_after(&ctx, &mut items).await,
    )?;
    Ok(render_all::<M, Rsp>(items))
}

/// Upserts a JSON array of payloads in one transaction.
pub async fn import<M, Req>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    body: Bytes,
) -> ApiResult
where
    M: Model,
    Req: Payload<M>,
{
    let svc = service::<M>(&state);
    let payloads = parse_body::<Vec<Req>>(&body)?;
    let mut items: Vec<M> = payloads
        .into_iter()
        .map(|req| incoming(&ctx, svc.as_ref(), req))
        .collect();
    if items.is_empty() {
        return Ok(envelope::success(ImportSummary { imported: 0 }));
    }
    svc.batch_create_before(&ctx, &mut items).await?;
    persist_batch(&state, &ctx, BatchOp::Update, &mut items, true).await?;
    after_hook(
        Phase::BatchCreateAfter,
        svc.batch_create_after(&ctx, &mut items).await,
    )?;
    info!(
        target = "trellis::http::import",
        table = %M::table_name(),
        imported = items.len(),
        "import finished"
    );
    Ok(envelope::success(ImportSummary {
        imported: items.len(),
    }))
}

/// Filtered list without paging, served as `<table>.json`.
pub async fn export<M, Rsp>(
    State(state): State<HttpState>,
    Extension(ctx): Extension<Context>,
    RawQuery(raw): RawQuery,
) -> ApiResult
where
    M: Model,
    Rsp: Render<M>,
{
    let svc = service::<M>(&state);
    let mut query = decode_query::<M>(&state, raw)?;
    query.page = None;
    query.size = None;
    query.cursor = None;
    query.nototal = true;
    svc.list_before(&ctx, &mut query).await?;
    let mut page = scoped_list(&state, &ctx, svc.as_ref(), &query, false)
        .list()
        .await?;
    svc.list_after(&ctx, &mut page).await?;

    let items: Vec<Rsp> = page.items.into_iter().map(Rsp::from).collect();
    Ok(envelope::attachment(
        &format!("{}.json", M::table_name()),
        items,
    ))
}

/// 204 when the default store answers, 503 otherwise.
pub async fn healthz(State(state): State<HttpState>) -> Response {
    let result = match state.db.store(None) {
        Ok(store) => store.health_check().await.map_err(Error::from),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::healthz",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
