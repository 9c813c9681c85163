//! Current id-keyed CRUD: `/v2/apps`, `/v2/fns`, `/v2/triggers`.
//!
//! Trigger responses carry their public invocation URL as an
//! annotation: the static `public-lb-url` base when configured,
//! otherwise a base derived from the inbound request.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use funcd_core::models::{App, AppPatch, Func, FuncPatch, Trigger};
use funcd_core::Error;

use super::{ApiError, PageQuery};
use crate::node::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v2/apps", get(list_apps).post(create_app))
        .route(
            "/v2/apps/{app_id}",
            get(get_app).put(update_app).delete(delete_app),
        )
        .route("/v2/fns", get(list_fns).post(create_fn))
        .route(
            "/v2/fns/{fn_id}",
            get(get_fn).put(update_fn).delete(delete_fn),
        )
        .route("/v2/triggers", get(list_triggers).post(create_trigger))
        .route(
            "/v2/triggers/{trigger_id}",
            get(get_trigger).delete(delete_trigger),
        )
        .with_state(state)
}

/// Base URL for trigger annotations: static wins, else derived from the
/// request's Host and forwarded scheme.
fn trigger_base(state: &ApiState, headers: &HeaderMap) -> Option<String> {
    if let Some(base) = &state.trigger_base {
        return Some(base.clone());
    }
    let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{scheme}://{host}"))
}

async fn annotate(
    state: &ApiState,
    headers: &HeaderMap,
    trigger: &mut Trigger,
) -> Result<(), Error> {
    if let Some(base) = trigger_base(state, headers) {
        let app = state.datastore.get_app_by_id(&trigger.app_id).await?;
        trigger.annotate_endpoint(&base, &app.name);
    }
    Ok(())
}

// ── Apps ───────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct AppBody {
    name: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, serde_json::Value>,
}

async fn list_apps(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .datastore
        .list_apps(page.cursor.as_deref(), page.limit())
        .await?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "next_cursor": result.next_cursor,
    })))
}

async fn create_app(
    State(state): State<ApiState>,
    Json(body): Json<AppBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut app = App::new(body.name);
    app.config = body.config;
    app.annotations = body.annotations;
    let app = state.datastore.insert_app(app).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn get_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.datastore.get_app_by_id(&app_id).await?))
}

async fn update_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Json(patch): Json<AppPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let mut app = state.datastore.get_app_by_id(&app_id).await?;
    app.merge(&patch);
    Ok(Json(state.datastore.update_app(app).await?))
}

async fn delete_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.datastore.delete_app(&app_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Functions ──────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct FnBody {
    app_id: String,
    name: String,
    image: String,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    cpus: u64,
    #[serde(default)]
    timeout: u64,
    #[serde(default)]
    idle_timeout: u64,
    #[serde(default)]
    format: funcd_core::models::Format,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

#[derive(serde::Deserialize)]
struct AppScope {
    app_id: String,
    cursor: Option<String>,
    #[serde(default)]
    per_page: usize,
}

async fn list_fns(
    State(state): State<ApiState>,
    Query(scope): Query<AppScope>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .datastore
        .list_fns(
            &scope.app_id,
            scope.cursor.as_deref(),
            funcd_data::clamp_per_page(scope.per_page),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "next_cursor": result.next_cursor,
    })))
}

async fn create_fn(
    State(state): State<ApiState>,
    Json(body): Json<FnBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut f = Func::new(body.app_id, body.name, body.image);
    if body.memory > 0 {
        f.memory = body.memory;
    }
    f.cpus = body.cpus;
    if body.timeout > 0 {
        f.timeout = body.timeout;
    }
    if body.idle_timeout > 0 {
        f.idle_timeout = body.idle_timeout;
    }
    f.format = body.format;
    f.config = body.config;
    let f = state.datastore.insert_fn(f).await?;
    Ok((StatusCode::CREATED, Json(f)))
}

async fn get_fn(
    State(state): State<ApiState>,
    Path(fn_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.datastore.get_fn(&fn_id).await?))
}

async fn update_fn(
    State(state): State<ApiState>,
    Path(fn_id): Path<String>,
    Json(patch): Json<FuncPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let mut f = state.datastore.get_fn(&fn_id).await?;
    f.merge(&patch);
    Ok(Json(state.datastore.update_fn(f).await?))
}

async fn delete_fn(
    State(state): State<ApiState>,
    Path(fn_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.datastore.delete_fn(&fn_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Triggers ───────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct TriggerBody {
    app_id: String,
    fn_id: String,
    name: String,
    source: String,
}

async fn list_triggers(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(scope): Query<AppScope>,
) -> Result<impl IntoResponse, ApiError> {
    let mut result = state
        .datastore
        .list_triggers(
            &scope.app_id,
            scope.cursor.as_deref(),
            funcd_data::clamp_per_page(scope.per_page),
        )
        .await?;
    for trigger in &mut result.items {
        annotate(&state, &headers, trigger).await?;
    }
    Ok(Json(serde_json::json!({
        "items": result.items,
        "next_cursor": result.next_cursor,
    })))
}

async fn create_trigger(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<TriggerBody>,
) -> Result<impl IntoResponse, ApiError> {
    let trigger = Trigger::new(body.app_id, body.fn_id, body.name, body.source);
    let mut trigger = state.datastore.insert_trigger(trigger).await?;
    annotate(&state, &headers, &mut trigger).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn get_trigger(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(trigger_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut trigger = state.datastore.get_trigger(&trigger_id).await?;
    annotate(&state, &headers, &mut trigger).await?;
    Ok(Json(trigger))
}

async fn delete_trigger(
    State(state): State<ApiState>,
    Path(trigger_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.datastore.delete_trigger(&trigger_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
