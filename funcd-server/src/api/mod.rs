//! HTTP surfaces. One error-to-response mapping covers every handler;
//! routers are assembled per node role.

pub mod admin;
pub mod hybrid;
pub mod invoke;
pub mod middleware;
pub mod v1;
pub mod v2;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;

use funcd_core::Error;

use crate::node::{ApiState, InvokeState};

/// The single domain-error to HTTP translation.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ResourceUnavailable | Error::SlotTimeout | Error::NodeDraining => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::PlacementDeadlineExceeded | Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::ContainerError(_) | Error::FunctionError { .. } | Error::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Pagination query accepted by every list endpoint.
#[derive(Debug, Default, serde::Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    #[serde(default)]
    pub per_page: usize,
}

impl PageQuery {
    pub fn limit(&self) -> usize {
        funcd_data::clamp_per_page(self.per_page)
    }
}

/// The catalog + control-plane surface served by API and full nodes.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .merge(v1::router(state.clone()))
        .merge(v2::router(state.clone()))
        .merge(hybrid::router(state))
}

/// The `/r` and `/t` invocation surface served by full, LB and runner
/// nodes.
pub fn invoke_router(state: InvokeState) -> Router {
    invoke::router(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::ResourceUnavailable, StatusCode::SERVICE_UNAVAILABLE),
            (Error::SlotTimeout, StatusCode::SERVICE_UNAVAILABLE),
            (Error::PlacementDeadlineExceeded, StatusCode::GATEWAY_TIMEOUT),
            (Error::DeadlineExceeded, StatusCode::GATEWAY_TIMEOUT),
            (Error::ContainerError("x".into()), StatusCode::BAD_GATEWAY),
            (
                Error::FunctionError {
                    exit_code: 1,
                    details: "x".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (Error::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (Error::NodeDraining, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }
}
