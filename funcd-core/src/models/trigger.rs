use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id;

/// Annotation key under which a trigger's public invocation URL is
/// exposed on API responses.
pub const ENDPOINT_ANNOTATION: &str = "funcd.io/trigger/httpEndpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Http,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Http => "http",
        }
    }
}

/// A routing rule exposing one function of one application at a public
/// URL derived from the trigger source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    pub app_id: String,
    pub fn_id: String,
    #[serde(rename = "type", default)]
    pub trigger_type: TriggerType,
    /// Type-specific source; for http triggers, a rooted path.
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(
        app_id: impl Into<String>,
        fn_id: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Trigger {
            id: id::new_id(),
            name: name.into(),
            app_id: app_id.into(),
            fn_id: fn_id.into(),
            trigger_type: TriggerType::Http,
            source: source.into(),
            annotations: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        super::validate_name("trigger", &self.name)?;
        if self.app_id.is_empty() || self.fn_id.is_empty() {
            return Err(Error::Validation(
                "trigger must reference an app and a fn".into(),
            ));
        }
        if !self.source.starts_with('/') {
            return Err(Error::Validation(
                "http trigger source must start with '/'".into(),
            ));
        }
        Ok(())
    }

    /// Annotate the public invocation URL onto this trigger.
    ///
    /// `base` is either the configured `public-lb-url` or the per-request
    /// `{scheme}://{host}` of the inbound request; the static base wins
    /// whenever it is configured.
    pub fn annotate_endpoint(&mut self, base: &str, app_name: &str) {
        let url = format!("{}/t/{}{}", base.trim_end_matches('/'), app_name, self.source);
        self.annotations
            .insert(ENDPOINT_ANNOTATION.to_string(), serde_json::Value::String(url));
    }
}
