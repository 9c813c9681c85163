use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id;

/// An application: the root of ownership for routes, functions and
/// triggers. Deleting an application cascades to everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Build a new app with a fresh id and timestamps.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        App {
            id: id::new_id(),
            name: name.into(),
            config: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        super::validate_name("app", &self.name)
    }

    /// Merge an update: non-empty config values overwrite, empty-string
    /// values delete the key. Annotations merge the same way with JSON
    /// null as the tombstone.
    pub fn merge(&mut self, patch: &AppPatch) {
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

/// Partial app update, as accepted by the PATCH endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppPatch {
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_and_deletes() {
        let mut app = App::new("a");
        app.config.insert("KEEP".into(), "1".into());
        app.config.insert("DROP".into(), "2".into());

        let patch = AppPatch {
            config: BTreeMap::from([
                ("DROP".to_string(), String::new()),
                ("NEW".to_string(), "3".to_string()),
            ]),
            annotations: BTreeMap::new(),
        };
        app.merge(&patch);

        assert_eq!(app.config.get("KEEP").map(String::as_str), Some("1"));
        assert_eq!(app.config.get("NEW").map(String::as_str), Some("3"));
        assert!(!app.config.contains_key("DROP"));
    }
}
