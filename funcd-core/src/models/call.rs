use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Format, RouteType};
use crate::id;
use crate::slot_key::SlotKey;

/// Lifecycle state of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Queued,
    Running,
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Running => "running",
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::Timeout => "timeout",
            CallStatus::Cancelled => "cancelled",
        }
    }

    /// Completed records are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Success | CallStatus::Error | CallStatus::Timeout | CallStatus::Cancelled
        )
    }
}

/// Resource usage observed for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUsage {
    pub memory_mb: u64,
    pub duration_ms: u64,
}

/// One invocation attempt: the resolved execution metadata plus the
/// persisted record fields. This is what travels on the queue and in the
/// pure-runner header frame, and what the call endpoints return
/// (immutable once completed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    /// v1 route path, when invoked through a route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// v2 function id, when invoked through a fn or trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,

    // Execution metadata, denormalized at resolve time.
    pub image: String,
    pub memory: u64,
    pub cpus: u64,
    pub timeout: u64,
    pub idle_timeout: u64,
    #[serde(rename = "type", default)]
    pub call_type: RouteType,
    #[serde(default)]
    pub format: Format,
    /// Merged app + route/fn config; becomes the container environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    // Request context.
    pub method: String,
    pub request_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    /// Base64 body carried on the queue for async calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    // Record fields.
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CallUsage>,
}

impl Call {
    /// Start a call record for the given app with fresh id and timestamps.
    /// Execution metadata is filled in by the resolver.
    pub fn new(app_id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Call {
            id: id::new_id(),
            app_id: app_id.into(),
            app_name: app_name.into(),
            route: None,
            fn_id: None,
            trigger_id: None,
            image: String::new(),
            memory: super::DEFAULT_MEMORY_MB,
            cpus: 0,
            timeout: super::DEFAULT_TIMEOUT_SECS,
            idle_timeout: super::DEFAULT_IDLE_TIMEOUT_SECS,
            call_type: RouteType::Sync,
            format: Format::Default,
            config: BTreeMap::new(),
            method: "POST".into(),
            request_url: String::new(),
            headers: Vec::new(),
            payload: None,
            status: CallStatus::Queued,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            usage: None,
        }
    }

    /// The slot key of this call's invocation-invariant configuration.
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::compute(
            &self.image,
            self.memory,
            self.cpus,
            self.timeout,
            self.idle_timeout,
            self.format,
            &self.config,
        )
    }

    /// Remaining execution budget measured from the record's creation.
    /// Returns zero when the deadline has already elapsed.
    pub fn remaining_budget(&self, now: DateTime<Utc>) -> Duration {
        let deadline = self.created_at + chrono::Duration::seconds(self.timeout as i64);
        (deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Label used on per-function metric families: the route path for v1
    /// calls, the fn id for v2 calls.
    pub fn metric_label(&self) -> &str {
        self.route
            .as_deref()
            .or(self.fn_id.as_deref())
            .unwrap_or("unknown")
    }

    /// The platform-provided portion of the container environment.
    pub fn platform_env(&self) -> Vec<(String, String)> {
        let deadline = self.created_at + chrono::Duration::seconds(self.timeout as i64);
        vec![
            ("FN_CALL_ID".into(), self.id.clone()),
            ("FN_APP_NAME".into(), self.app_name.clone()),
            (
                "FN_PATH".into(),
                self.route.clone().or(self.fn_id.clone()).unwrap_or_default(),
            ),
            ("FN_FORMAT".into(), self.format.as_str().into()),
            ("FN_MEMORY".into(), self.memory.to_string()),
            ("FN_DEADLINE".into(), deadline.to_rfc3339()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!CallStatus::Queued.is_terminal());
        assert!(!CallStatus::Running.is_terminal());
        assert!(CallStatus::Success.is_terminal());
        assert!(CallStatus::Timeout.is_terminal());
    }

    #[test]
    fn remaining_budget_clamps_at_zero() {
        let mut call = Call::new("a1", "app");
        call.timeout = 1;
        let later = call.created_at + chrono::Duration::seconds(5);
        assert_eq!(call.remaining_budget(later), Duration::ZERO);
        let earlier = call.created_at;
        assert!(call.remaining_budget(earlier) > Duration::ZERO);
    }

    #[test]
    fn slot_key_ignores_request_context() {
        let mut a = Call::new("a1", "app");
        a.image = "img:v1".into();
        let mut b = a.clone();
        b.id = id::new_id();
        b.method = "GET".into();
        b.request_url = "/other".into();
        assert_eq!(a.slot_key(), b.slot_key());
    }
}
