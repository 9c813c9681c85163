use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Format;
use crate::error::{Error, Result};
use crate::id;

/// A v2 function: an invocable unit owned by an application by id and
/// addressable by its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub id: String,
    pub name: String,
    pub app_id: String,
    pub image: String,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub cpus: u64,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub format: Format,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Func {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut f = Func {
            id: id::new_id(),
            name: name.into(),
            app_id: app_id.into(),
            image: image.into(),
            memory: 0,
            cpus: 0,
            timeout: 0,
            idle_timeout: 0,
            format: Format::Default,
            config: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        f.apply_defaults();
        f
    }

    pub fn apply_defaults(&mut self) {
        if self.memory == 0 {
            self.memory = super::DEFAULT_MEMORY_MB;
        }
        if self.timeout == 0 {
            self.timeout = super::DEFAULT_TIMEOUT_SECS;
        }
        if self.idle_timeout == 0 {
            self.idle_timeout = super::DEFAULT_IDLE_TIMEOUT_SECS;
        }
    }

    pub fn validate(&self) -> Result<()> {
        super::validate_name("fn", &self.name)?;
        if self.app_id.is_empty() {
            return Err(Error::Validation("fn must belong to an app".into()));
        }
        if self.image.is_empty() {
            return Err(Error::Validation("fn image must not be empty".into()));
        }
        super::validate_limits(self.memory, self.timeout, self.idle_timeout)
    }

    /// Merge an update; absent fields leave the current value untouched,
    /// empty-string config values delete the key, JSON null annotations
    /// are tombstones.
    pub fn merge(&mut self, patch: &FuncPatch) {
        if let Some(image) = &patch.image {
            if !image.is_empty() {
                self.image = image.clone();
            }
        }
        if let Some(memory) = patch.memory {
            self.memory = memory;
        }
        if let Some(cpus) = patch.cpus {
            self.cpus = cpus;
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = timeout;
        }
        if let Some(idle) = patch.idle_timeout {
            self.idle_timeout = idle;
        }
        if let Some(format) = patch.format {
            self.format = format;
        }
        for (k, v) in &patch.config {
            if v.is_empty() {
                self.config.remove(k);
            } else {
                self.config.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &patch.annotations {
            if v.is_null() {
                self.annotations.remove(k);
            } else {
                self.annotations.insert(k.clone(), v.clone());
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Partial function update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FuncPatch {
    pub image: Option<String>,
    pub memory: Option<u64>,
    pub cpus: Option<u64>,
    pub timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub format: Option<Format>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_untouched_fields() {
        let mut f = Func::new("app1", "f1", "img:v1");
        f.config.insert("KEEP".into(), "1".into());
        f.config.insert("DROP".into(), "2".into());

        let patch = FuncPatch {
            memory: Some(256),
            config: BTreeMap::from([
                ("DROP".to_string(), String::new()),
                ("NEW".to_string(), "3".to_string()),
            ]),
            ..Default::default()
        };
        f.merge(&patch);

        assert_eq!(f.image, "img:v1");
        assert_eq!(f.memory, 256);
        assert_eq!(f.config.get("KEEP").map(String::as_str), Some("1"));
        assert_eq!(f.config.get("NEW").map(String::as_str), Some("3"));
        assert!(!f.config.contains_key("DROP"));
    }
}
