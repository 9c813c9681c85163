//! The pure-runner wire protocol: a bidirectional gRPC stream per
//! invocation, plus the LB-side client and the mutual-TLS material both
//! ends load from the node certificate options.

pub mod client;
pub mod service;
pub mod tls;

pub mod pb {
    tonic::include_proto!("funcd.runner");
}

pub use client::RunnerClient;
pub use service::PureRunner;
pub use tls::TlsMaterial;

use funcd_core::Error;

/// Map a wire error code back into the domain taxonomy. The placer keys
/// retry decisions off this.
pub fn error_from_code(code: &str, details: &str) -> Error {
    match code {
        "resource-unavailable" => Error::ResourceUnavailable,
        "slot-timeout" => Error::SlotTimeout,
        "deadline-exceeded" => Error::DeadlineExceeded,
        "node-draining" => Error::NodeDraining,
        "function-error" => Error::FunctionError {
            exit_code: -1,
            details: details.to_string(),
        },
        _ => Error::ContainerError(details.to_string()),
    }
}
