use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a user's bridge worker is currently supervised.
///
/// Only the orchestrator writes this field; the admin layer treats it as read-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Stopped => write!(f, "stopped"),
            WorkerStatus::Running => write!(f, "running"),
        }
    }
}

/// A news feed the worker's feed capability reads at its own pace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDescriptor {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "News".to_string()
}

/// Durable per-user record. The worker scripts read the same file, so the
/// field names follow the camelCase layout of `users.json`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWorkerSpec {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub search_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_key: Option<String>,
    #[serde(default)]
    pub weather_enabled: bool,
    #[serde(default)]
    pub knowledge_enabled: bool,
    #[serde(default)]
    pub feeds: Vec<FeedDescriptor>,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserWorkerSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        UserWorkerSpec {
            display_name: id.clone(),
            id,
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// The outward endpoint, treating an empty or blank value as unset.
    pub fn usable_endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    /// The search key, only when search is enabled and a non-empty key is stored.
    pub fn active_search_key(&self) -> Option<&str> {
        if !self.search_enabled {
            return None;
        }
        self.search_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// Apply a settings change. Fields left as `None` keep their stored value.
    pub fn apply(&mut self, settings: &WorkerSettings) {
        if let Some(name) = &settings.display_name {
            self.display_name = name.clone();
        }
        if let Some(endpoint) = &settings.endpoint {
            self.endpoint = Some(endpoint.clone()).filter(|e| !e.trim().is_empty());
        }
        if let Some(enabled) = settings.search_enabled {
            self.search_enabled = enabled;
        }
        if let Some(key) = &settings.search_key {
            self.search_key = Some(key.clone()).filter(|k| !k.trim().is_empty());
        }
        if let Some(enabled) = settings.weather_enabled {
            self.weather_enabled = enabled;
        }
        if let Some(enabled) = settings.knowledge_enabled {
            self.knowledge_enabled = enabled;
        }
    }
}

/// Partial update of the capability-driving fields of a [`UserWorkerSpec`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub search_enabled: Option<bool>,
    #[serde(default)]
    pub search_key: Option<String>,
    #[serde(default)]
    pub weather_enabled: Option<bool>,
    #[serde(default)]
    pub knowledge_enabled: Option<bool>,
}

/// On-disk layout of the users file: `{ "users": [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersDocument {
    #[serde(default)]
    pub users: Vec<UserWorkerSpec>,
}
