//! Legacy by-name CRUD: `/v1/apps`, nested routes, and call records.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use funcd_core::models::{App, AppPatch, Route, RoutePatch};
use funcd_core::Error;
use funcd_data::CallFilter;

use super::{ApiError, PageQuery};
use crate::node::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/apps", get(list_apps).post(create_app))
        .route(
            "/v1/apps/{app}",
            get(get_app).patch(update_app).delete(delete_app),
        )
        .route("/v1/apps/{app}/routes", get(list_routes).post(create_route))
        .route(
            "/v1/apps/{app}/routes/{*path}",
            get(get_route).patch(update_route).delete(delete_route),
        )
        .route("/v1/apps/{app}/calls", get(list_calls))
        .route("/v1/apps/{app}/calls/{call_id}", get(get_call))
        .route("/v1/apps/{app}/calls/{call_id}/log", get(get_call_log))
        .with_state(state)
}

// ── Apps ───────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct AppWrapper {
    app: AppBody,
}

#[derive(serde::Deserialize, Default)]
struct AppBody {
    name: Option<String>,
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
        "apps": result.items,
        "next_cursor": result.next_cursor,
    })))
}

async fn create_app(
    State(state): State<ApiState>,
    Json(body): Json<AppWrapper>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body
        .app
        .name
        .ok_or_else(|| Error::Validation("app name is required".into()))?;
    let mut app = App::new(name);
    app.config = body.app.config;
    app.annotations = body.app.annotations;
    let app = state.datastore.insert_app(app).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "app": app }))))
}

async fn get_app(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app = state.datastore.get_app_by_name(&app).await?;
    Ok(Json(serde_json::json!({ "app": app })))
}

async fn update_app(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let patch: AppPatch = serde_json::from_value(
        body.get("app")
            .cloned()
            .ok_or_else(|| Error::Validation("missing app body".into()))?,
    )
    .map_err(|e| Error::Validation(e.to_string()))?;
    let mut app = state.datastore.get_app_by_name(&app).await?;
    app.merge(&patch);
    let app = state.datastore.update_app(app).await?;
    Ok(Json(serde_json::json!({ "app": app })))
}

async fn delete_app(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app = state.datastore.get_app_by_name(&app).await?;
    state.datastore.delete_app(&app.id).await?;
    Ok(StatusCode::OK)
}

// ── Routes ─────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct RouteWrapper {
    route: RouteBody,
}

#[derive(serde::Deserialize, Default)]
struct RouteBody {
    path: Option<String>,
    image: Option<String>,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    cpus: u64,
    #[serde(default)]
    timeout: u64,
    #[serde(default)]
    idle_timeout: u64,
    #[serde(rename = "type", default)]
    route_type: funcd_core::models::RouteType,
    #[serde(default)]
    format: funcd_core::models::Format,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

async fn list_routes(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .datastore
        .list_routes(&app, page.cursor.as_deref(), page.limit())
        .await?;
    Ok(Json(serde_json::json!({
        "routes": result.items,
        "next_cursor": result.next_cursor,
    })))
}

async fn create_route(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(body): Json<RouteWrapper>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let mut route = Route {
        app_name: app,
        path: body
            .route
            .path
            .ok_or_else(|| Error::Validation("route path is required".into()))?,
        image: body
            .route
            .image
            .ok_or_else(|| Error::Validation("route image is required".into()))?,
        memory: body.route.memory,
        cpus: body.route.cpus,
        timeout: body.route.timeout,
        idle_timeout: body.route.idle_timeout,
        route_type: body.route.route_type,
        format: body.route.format,
        config: body.route.config,
        created_at: now,
        updated_at: now,
    };
    route.apply_defaults();
    let route = state.datastore.insert_route(route).await?;
    Ok(Json(serde_json::json!({ "route": route })))
}

fn rooted(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

async fn get_route(
    State(state): State<ApiState>,
    Path((app, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let route = state.datastore.get_route(&app, &rooted(path)).await?;
    Ok(Json(serde_json::json!({ "route": route })))
}

async fn update_route(
    State(state): State<ApiState>,
    Path((app, path)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let patch: RoutePatch = serde_json::from_value(
        body.get("route")
            .cloned()
            .ok_or_else(|| Error::Validation("missing route body".into()))?,
    )
    .map_err(|e| Error::Validation(e.to_string()))?;
    let mut route = state.datastore.get_route(&app, &rooted(path)).await?;
    route.merge(&patch);
    let route = state.datastore.update_route(route).await?;
    Ok(Json(serde_json::json!({ "route": route })))
}

async fn delete_route(
    State(state): State<ApiState>,
    Path((app, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.datastore.delete_route(&app, &rooted(path)).await?;
    Ok(StatusCode::OK)
}

// ── Calls ──────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct CallQuery {
    route: Option<String>,
    cursor: Option<String>,
    #[serde(default)]
    per_page: usize,
}

async fn list_calls(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Query(query): Query<CallQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let app = state.datastore.get_app_by_name(&app).await?;
    let filter = CallFilter {
        app_id: app.id,
        route: query.route,
        cursor: query.cursor,
        per_page: funcd_data::clamp_per_page(query.per_page),
    };
    let result = state.datastore.list_calls(&filter).await?;
    Ok(Json(serde_json::json!({
        "calls": result.items,
        "next_cursor": result.next_cursor,
    })))
}

async fn get_call(
    State(state): State<ApiState>,
    Path((app, call_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let app = state.datastore.get_app_by_name(&app).await?;
    let call = state.datastore.get_call(&app.id, &call_id).await?;
    Ok(Json(serde_json::json!({ "call": call })))
}

async fn get_call_log(
    State(state): State<ApiState>,
    Path((app, call_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let app = state.datastore.get_app_by_name(&app).await?;
    let log = state.logstore.get_log(&app.id, &call_id).await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        axum::body::Bytes::from(log),
    ))
}
