//! The hybrid control plane: internal endpoints an API node serves to
//! runner and LB nodes. The read side mirrors the data-access
//! capability set; the write side carries call starts, finishes and the
//! async queue.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;

use funcd_core::models::{Call, TriggerType};
use funcd_core::Error;
use funcd_data::hybrid::FinishBody;

use super::ApiError;
use crate::node::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Param name matches the invoke router's invalidation route so
        // full nodes can merge both surfaces.
        .route("/v1/runner/apps/{app_id}", get(get_app))
        .route("/v1/runner/apps/{app_id}/routes/{*path}", get(get_route))
        .route("/v1/runner/fns/{fn_id}", get(get_fn))
        .route("/v1/runner/triggers", get(get_trigger_by_source))
        .route("/v1/runner/start", post(start_call))
        .route("/v1/runner/finish", post(finish_call))
        .route("/v1/runner/async", put(enqueue).get(dequeue))
        .route("/v1/runner/async/{call_id}", delete(delete_from_queue))
        .with_state(state)
}

/// Resolve an app by id, falling back to name: v1 clients address apps
/// by name, v2 clients by id, and the segment carries either.
async fn resolve_app(state: &ApiState, app_ref: &str) -> Result<funcd_core::models::App, Error> {
    match state.datastore.get_app_by_id(app_ref).await {
        Ok(app) => Ok(app),
        Err(Error::NotFound(_)) => state.datastore.get_app_by_name(app_ref).await,
        Err(e) => Err(e),
    }
}

async fn get_app(
    State(state): State<ApiState>,
    Path(app_ref): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(resolve_app(&state, &app_ref).await?))
}

async fn get_route(
    State(state): State<ApiState>,
    Path((app_ref, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let app = resolve_app(&state, &app_ref).await?;
    let route = state.datastore.get_route(&app.name, &format!("/{path}")).await?;
    Ok(Json(route))
}

async fn get_fn(
    State(state): State<ApiState>,
    Path(fn_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.datastore.get_fn(&fn_id).await?))
}

#[derive(serde::Deserialize)]
struct TriggerQuery {
    app_id: String,
    #[serde(rename = "type")]
    trigger_type: Option<String>,
    source: String,
}

async fn get_trigger_by_source(
    State(state): State<ApiState>,
    Query(query): Query<TriggerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let trigger_type = match query.trigger_type.as_deref() {
        None | Some("http") => TriggerType::Http,
        Some(other) => {
            return Err(Error::Validation(format!("unknown trigger type {other:?}")).into())
        }
    };
    let trigger = state
        .datastore
        .get_trigger_by_source(&query.app_id, trigger_type, &query.source)
        .await?;
    Ok(Json(trigger))
}

async fn start_call(
    State(state): State<ApiState>,
    Json(call): Json<Call>,
) -> Result<impl IntoResponse, ApiError> {
    state.datastore.update_call(&call).await?;
    Ok(StatusCode::OK)
}

async fn finish_call(
    State(state): State<ApiState>,
    Json(body): Json<FinishBody>,
) -> Result<impl IntoResponse, ApiError> {
    // Log bytes land before the completion record.
    if !body.log.is_empty() {
        let log = base64::engine::general_purpose::STANDARD
            .decode(&body.log)
            .map_err(|e| Error::Validation(format!("bad log encoding: {e}")))?;
        state
            .logstore
            .insert_log(&body.call.app_id, &body.call.id, Bytes::from(log))
            .await?;
    }
    state.datastore.update_call(&body.call).await?;
    Ok(StatusCode::OK)
}

async fn enqueue(
    State(state): State<ApiState>,
    Json(call): Json<Call>,
) -> Result<impl IntoResponse, ApiError> {
    state.datastore.insert_call(&call).await?;
    state.queue.enqueue(&call).await?;
    Ok(StatusCode::OK)
}

async fn dequeue(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    match state.queue.dequeue().await? {
        Some(call) => Ok((StatusCode::OK, Json(call)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn delete_from_queue(
    State(state): State<ApiState>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.queue.delete(&call_id).await?;
    Ok(StatusCode::OK)
}
