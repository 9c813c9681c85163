//! The catalog entities served by the API tier and the call record shared
//! with the execution tier.

mod app;
mod call;
mod func;
mod route;
mod trigger;

pub use app::{App, AppPatch};
pub use call::{Call, CallStatus, CallUsage};
pub use func::{Func, FuncPatch};
pub use route::{Route, RoutePatch, RouteType};
pub use trigger::{Trigger, TriggerType, ENDPOINT_ANNOTATION};

use crate::error::{Error, Result};

/// Upper bound on memory a single function may request, in MB.
pub const MAX_MEMORY_MB: u64 = 8192;
/// Default memory limit applied on create, in MB.
pub const DEFAULT_MEMORY_MB: u64 = 128;
/// Default execution timeout, seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Maximum execution timeout, seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;
/// Default hot-container idle timeout, seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
/// Maximum hot-container idle timeout, seconds.
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 3600;

/// The stdio framing a container speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Default,
    Http,
    Json,
    CloudEvent,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Default => "default",
            Format::Http => "http",
            Format::Json => "json",
            Format::CloudEvent => "cloudevent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(Format::Default),
            "http" => Ok(Format::Http),
            "json" => Ok(Format::Json),
            "cloudevent" => Ok(Format::CloudEvent),
            other => Err(Error::Validation(format!("unknown format {other:?}"))),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a resource name: `[a-zA-Z0-9_-]`, 1..=255 bytes.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::Validation(format!(
            "{kind} name must be 1..=255 characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Validation(format!(
            "{kind} name may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

/// Validate shared resource-limit fields.
pub(crate) fn validate_limits(memory_mb: u64, timeout_secs: u64, idle_timeout_secs: u64) -> Result<()> {
    if memory_mb == 0 || memory_mb > MAX_MEMORY_MB {
        return Err(Error::Validation(format!(
            "memory must be 1..={MAX_MEMORY_MB} MB"
        )));
    }
    if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
        return Err(Error::Validation(format!(
            "timeout must be 1..={MAX_TIMEOUT_SECS} seconds"
        )));
    }
    if idle_timeout_secs == 0 || idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
        return Err(Error::Validation(format!(
            "idle_timeout must be 1..={MAX_IDLE_TIMEOUT_SECS} seconds"
        )));
    }
    Ok(())
}
