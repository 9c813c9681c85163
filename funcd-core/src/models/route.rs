use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Format;
use crate::error::{Error, Result};

/// Whether an invocation responds inline or is queued for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Sync,
    Async,
}

/// A v1 route: an invocable unit owned by an application by name,
/// uniquely keyed by its path within that app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub app_name: String,
    pub path: String,
    pub image: String,
    #[serde(default)]
    pub memory: u64,
    /// CPU shares in milli-CPUs; 0 means unconstrained.
    #[serde(default)]
    pub cpus: u64,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(rename = "type", default)]
    pub route_type: RouteType,
    #[serde(default)]
    pub format: Format,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Apply create-time defaults to zero-valued limit fields.
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
        super::validate_name("app", &self.app_name)?;
        if !self.path.starts_with('/') {
            return Err(Error::Validation("route path must start with '/'".into()));
        }
        if self.image.is_empty() {
            return Err(Error::Validation("route image must not be empty".into()));
        }
        super::validate_limits(self.memory, self.timeout, self.idle_timeout)
    }

    /// Merge an update; zero/empty fields in the patch leave the current
    /// value untouched, empty-string config values delete the key.
    pub fn merge(&mut self, patch: &RoutePatch) {
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
        if let Some(route_type) = patch.route_type {
            self.route_type = route_type;
        }
        for (k, v) in &patch.config {
            if v.is_empty() {
                self.config.remove(k);
            } else {
                self.config.insert(k.clone(), v.clone());
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Partial route update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutePatch {
    pub image: Option<String>,
    pub memory: Option<u64>,
    pub cpus: Option<u64>,
    pub timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub format: Option<Format>,
    #[serde(rename = "type")]
    pub route_type: Option<RouteType>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, image: &str) -> Route {
        let now = Utc::now();
        let mut r = Route {
            app_name: "a".into(),
            path: path.into(),
            image: image.into(),
            memory: 0,
            cpus: 0,
            timeout: 0,
            idle_timeout: 0,
            route_type: RouteType::Sync,
            format: Format::Default,
            config: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        r.apply_defaults();
        r
    }

    #[test]
    fn defaults_fill_zero_limits() {
        let r = route("/hello", "img");
        assert_eq!(r.memory, super::super::DEFAULT_MEMORY_MB);
        assert_eq!(r.timeout, super::super::DEFAULT_TIMEOUT_SECS);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn path_must_be_rooted() {
        assert!(route("hello", "img").validate().is_err());
        assert!(route("/hello", "").validate().is_err());
    }
}
