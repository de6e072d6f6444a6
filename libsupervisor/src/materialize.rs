//! Capability selection and the per-user config artifacts the workers read.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use common::UserWorkerSpec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SupervisorError;

pub const SEARCH_CAPABILITY: &str = "brave-search";
pub const WEATHER_CAPABILITY: &str = "weather";
pub const FEED_CAPABILITY: &str = "rss-news";
pub const KNOWLEDGE_CAPABILITY: &str = "knowledge-base";

const USER_PLACEHOLDER: &str = "{user_id}";

/// One entry of a generated worker config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CapabilityDescriptor {
    /// A local command the worker launches and talks to over stdio.
    #[serde(rename = "stdio")]
    Command { command: String, args: Vec<String> },
    /// A remote server the worker connects to.
    #[serde(rename = "sse")]
    Remote { url: String },
}

/// Where a capability comes from, before the user id is filled in.
/// `{user_id}` in args or url is replaced at materialization time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilitySource {
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Remote {
        url: String,
    },
}

impl CapabilitySource {
    pub fn command<S: Into<String>>(command: S, args: &[&str]) -> Self {
        CapabilitySource::Command {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn descriptor_for(&self, user_id: &str) -> CapabilityDescriptor {
        match self {
            CapabilitySource::Command { command, args } => CapabilityDescriptor::Command {
                command: command.clone(),
                args: args
                    .iter()
                    .map(|a| a.replace(USER_PLACEHOLDER, user_id))
                    .collect(),
            },
            CapabilitySource::Remote { url } => CapabilityDescriptor::Remote {
                url: url.replace(USER_PLACEHOLDER, user_id),
            },
        }
    }
}

/// The capability servers available to workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityCatalog {
    pub search: CapabilitySource,
    pub weather: CapabilitySource,
    pub feeds: CapabilitySource,
    pub knowledge: CapabilitySource,
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        CapabilityCatalog {
            search: CapabilitySource::command("python3", &["brave-search.py"]),
            weather: CapabilitySource::command("python3", &["weather-server.py"]),
            feeds: CapabilitySource::command(
                "python3",
                &["rss-server.py", "--user", USER_PLACEHOLDER],
            ),
            knowledge: CapabilitySource::command(
                "python3",
                &["knowledge-server.py", "--user", USER_PLACEHOLDER],
            ),
        }
    }
}

/// Config handed to one worker launch, keyed by capability name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedWorkerConfig {
    #[serde(rename = "mcpServers")]
    pub capabilities: BTreeMap<String, CapabilityDescriptor>,
}

impl GeneratedWorkerConfig {
    pub fn contains(&self, capability: &str) -> bool {
        self.capabilities.contains_key(capability)
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Materializer {
    catalog: CapabilityCatalog,
}

impl Materializer {
    pub fn new(catalog: CapabilityCatalog) -> Self {
        Materializer { catalog }
    }

    /// Select the capabilities a user's worker gets.
    ///
    /// - search needs its flag and a non-empty key;
    /// - weather and knowledge follow their flags;
    /// - the feed capability is always present and only carries the user id,
    ///   the worker reads the feed list from the users file itself.
    pub fn materialize(&self, spec: &UserWorkerSpec) -> GeneratedWorkerConfig {
        let mut capabilities = BTreeMap::new();
        if spec.active_search_key().is_some() {
            capabilities.insert(
                SEARCH_CAPABILITY.to_string(),
                self.catalog.search.descriptor_for(&spec.id),
            );
        }
        if spec.weather_enabled {
            capabilities.insert(
                WEATHER_CAPABILITY.to_string(),
                self.catalog.weather.descriptor_for(&spec.id),
            );
        }
        if spec.knowledge_enabled {
            capabilities.insert(
                KNOWLEDGE_CAPABILITY.to_string(),
                self.catalog.knowledge.descriptor_for(&spec.id),
            );
        }
        capabilities.insert(
            FEED_CAPABILITY.to_string(),
            self.catalog.feeds.descriptor_for(&spec.id),
        );
        GeneratedWorkerConfig { capabilities }
    }
}

/// Per-user config files, one per user id under a private directory.
#[derive(Debug, Clone)]
pub struct ConfigArtifacts {
    dir: PathBuf,
}

impl ConfigArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ConfigArtifacts { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The artifact path for a user. Ids that could escape the directory are rejected.
    pub fn path_for(&self, user_id: &str) -> Result<PathBuf, SupervisorError> {
        let unsafe_id = user_id.is_empty()
            || user_id == "."
            || user_id == ".."
            || user_id.contains(['/', '\\', '\0']);
        if unsafe_id {
            return Err(SupervisorError::InvalidSpec(format!(
                "user id {user_id:?} cannot be used as a config artifact name"
            )));
        }
        Ok(self.dir.join(format!("{user_id}.json")))
    }

    /// Create or overwrite the user's artifact. The file is readable by the
    /// owner only since the worker runs as the same user as the daemon.
    pub fn write(
        &self,
        user_id: &str,
        config: &GeneratedWorkerConfig,
    ) -> Result<PathBuf, SupervisorError> {
        let path = self.path_for(user_id)?;
        let write_failure = |source| SupervisorError::ArtifactWriteFailure {
            path: path.clone(),
            source,
        };
        create_private_dir(&self.dir).map_err(write_failure)?;
        let content = serde_json::to_vec_pretty(config)
            .map_err(|e| write_failure(std::io::Error::other(e)))?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(write_failure)?;
        file.write_all(&content).map_err(write_failure)?;
        file.sync_all().map_err(write_failure)?;
        debug!(user_id, path = %path.display(), "config artifact written");
        Ok(path)
    }

    /// Remove the user's artifact. A missing file counts as removed.
    pub fn remove(&self, user_id: &str) -> std::io::Result<()> {
        let path = self
            .path_for(user_id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
