//! Cross-cutting HTTP layers: request ids and CORS.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tracing::Instrument;

use funcd_core::id;

pub const DEFAULT_RID_HEADER: &str = "fn-request-id";

/// Honour the configured client request-id header when present, else
/// generate an id; either way the id is attached to the request span
/// and echoed on the response.
pub async fn request_id(
    axum::extract::State(rid_header): axum::extract::State<HeaderName>,
    req: Request,
    next: Next,
) -> Response {
    let rid = req
        .headers()
        .get(&rid_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(id::new_id);

    let span = tracing::info_span!("request", rid = %rid, method = %req.method(), path = %req.uri().path());
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(rid_header, value);
    }
    resp
}

/// CORS layer from the `cors-origins` / `cors-headers` options; `None`
/// origins means the layer is omitted entirely.
pub fn cors_layer(origins: Option<&str>, headers: Option<&str>) -> Option<CorsLayer> {
    let origins = origins?;
    let allow_origin = if origins.trim() == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .split(',')
                .map(str::trim)
                .filter_map(|o| o.parse::<HeaderValue>().ok()),
        )
    };
    let allow_headers = match headers {
        Some(list) => AllowHeaders::list(
            list.split(',')
                .map(str::trim)
                .filter_map(|h| h.parse::<HeaderName>().ok()),
        ),
        None => AllowHeaders::any(),
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_headers(allow_headers)
            .allow_methods(Any),
    )
}
