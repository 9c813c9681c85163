//! The invocation surface: `/r/{app}[/{route}]` for v1 routes and
//! `/t/{app}/{source}` for v2 triggers. Any method; the request body is
//! the function input, the container's response frame becomes the HTTP
//! response.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete};
use axum::{Json, Router};

use funcd_agent::Invocation;
use funcd_core::models::{Call, Route, RouteType, TriggerType};
use funcd_core::Error;

use super::ApiError;
use crate::node::InvokeState;

pub fn router(state: InvokeState) -> Router {
    Router::new()
        .route("/r/{app_name}", any(invoke_root))
        .route("/r/{app_name}/{*route}", any(invoke_route))
        .route("/t/{app_name}/{*source}", any(invoke_trigger))
        // Cache invalidation for this node's data access (runner/LB).
        .route("/v1/runner/apps/{app_id}", delete(invalidate_app))
        .with_state(state)
}

async fn invoke_root(
    state: State<InvokeState>,
    Path(app_name): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    run_route(state, app_name, "/".to_string(), method, uri, headers, body).await
}

async fn invoke_route(
    state: State<InvokeState>,
    Path((app_name, route)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    run_route(state, app_name, format!("/{route}"), method, uri, headers, body).await
}

async fn run_route(
    State(state): State<InvokeState>,
    app_name: String,
    path: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let app = state.da.get_app_by_name(&app_name).await?;
    let route = state.da.get_route(&app.name, &path).await?;

    let mut call = Call::new(&app.id, &app.name);
    call.route = Some(route.path.clone());
    fill_from_route(&mut call, &app.config, &route);
    fill_request_context(&mut call, &method, &uri, &headers);

    dispatch(&state, call, body).await
}

async fn invoke_trigger(
    State(state): State<InvokeState>,
    Path((app_name, source)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let app = state.da.get_app_by_name(&app_name).await?;
    let trigger = state
        .da
        .get_trigger_by_source(&app.id, TriggerType::Http, &format!("/{source}"))
        .await?;
    let func = state.da.get_fn(&trigger.fn_id).await?;

    let mut call = Call::new(&app.id, &app.name);
    call.fn_id = Some(func.id.clone());
    call.trigger_id = Some(trigger.id.clone());
    call.image = func.image.clone();
    call.memory = func.memory;
    call.cpus = func.cpus;
    call.timeout = func.timeout;
    call.idle_timeout = func.idle_timeout;
    call.format = func.format;
    call.config = merged_config(&app.config, &func.config);
    fill_request_context(&mut call, &method, &uri, &headers);

    dispatch(&state, call, body).await
}

async fn invalidate_app(
    State(state): State<InvokeState>,
    Path(app_id): Path<String>,
) -> StatusCode {
    state.da.invalidate_app(&app_id).await;
    StatusCode::OK
}

fn merged_config(
    app: &std::collections::BTreeMap<String, String>,
    unit: &std::collections::BTreeMap<String, String>,
) -> std::collections::BTreeMap<String, String> {
    let mut merged = app.clone();
    merged.extend(unit.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn fill_from_route(
    call: &mut Call,
    app_config: &std::collections::BTreeMap<String, String>,
    route: &Route,
) {
    call.image = route.image.clone();
    call.memory = route.memory;
    call.cpus = route.cpus;
    call.timeout = route.timeout;
    call.idle_timeout = route.idle_timeout;
    call.call_type = route.route_type;
    call.format = route.format;
    call.config = merged_config(app_config, &route.config);
}

fn fill_request_context(call: &mut Call, method: &Method, uri: &Uri, headers: &HeaderMap) {
    call.method = method.to_string();
    call.request_url = uri.to_string();
    call.headers = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
}

async fn dispatch(state: &InvokeState, call: Call, body: Bytes) -> Result<Response, ApiError> {
    let mut inv = Invocation::new(call, body);
    if inv.call.call_type == RouteType::Async {
        state.agent.enqueue(&mut inv).await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "call_id": inv.call.id })),
        )
            .into_response());
    }

    let resp = state.agent.submit(&mut inv).await?;

    let status = StatusCode::from_u16(resp.status)
        .map_err(|_| Error::ContainerError(format!("bad response status {}", resp.status)))?;
    let mut headers = HeaderMap::new();
    for (name, value) in &resp.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if let Ok(id) = HeaderValue::from_str(&inv.call.id) {
        headers.insert(HeaderName::from_static("fn-call-id"), id);
    }
    Ok((status, headers, resp.body).into_response())
}
