//! Registry configuration: deserialization, validation, and conversion into
//! the config-backed collection.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::collection::{Collection, TrustBehavior};
use crate::definition::{
    ConfigTarget, LaunchConfig, ServerDefinition, StorageScope, VariableReplacement,
};
use crate::error::RegistryError;
use crate::variables::placeholders;

/// Top-level registry configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Gates whether registered collections are visible.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Treat an unanswered trust prompt as cancelled after this many seconds.
    pub prompt_timeout_secs: Option<u64>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub collection: CollectionConfig,
    /// Servers keyed by definition id.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prompt_timeout_secs: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            collection: CollectionConfig::default(),
            servers: BTreeMap::new(),
        }
    }
}

/// The `[collection]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_id")]
    pub id: String,
    #[serde(default = "default_collection_label")]
    pub label: String,
    #[serde(default)]
    pub trust: TrustSetting,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            id: default_collection_id(),
            label: default_collection_label(),
            trust: TrustSetting::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustSetting {
    Trusted,
    #[default]
    TrustedOnNonce,
}

impl From<TrustSetting> for TrustBehavior {
    fn from(setting: TrustSetting) -> Self {
        match setting {
            TrustSetting::Trusted => TrustBehavior::Trusted,
            TrustSetting::TrustedOnNonce => TrustBehavior::TrustedOnNonce,
        }
    }
}

/// One `[servers.<id>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub label: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub transport: TransportKind,
    // stdio fields
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub env_file: Option<String>,
    pub cwd: Option<String>,
    // http fields
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

fn default_enabled() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_collection_id() -> String {
    "config".to_string()
}

fn default_collection_label() -> String {
    "Configuration".to_string()
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl ServerConfig {
    fn validate(&self, id: &str) -> crate::Result<()> {
        let invalid = |msg: &str| Err(RegistryError::InvalidConfig(id.to_string(), msg.to_string()));
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return invalid("stdio transport requires 'command' field");
                }
                if self.url.is_some() {
                    return invalid("stdio transport should not have 'url' field");
                }
                if !self.headers.is_empty() {
                    return invalid("stdio transport should not have 'headers' field");
                }
            }
            TransportKind::Http => {
                if self.url.as_deref().is_none_or(|u| u.trim().is_empty()) {
                    return invalid("http transport requires 'url' field");
                }
                if self.command.is_some() {
                    return invalid("http transport should not have 'command' field");
                }
                if !self.args.is_empty()
                    || !self.env.is_empty()
                    || self.env_file.is_some()
                    || self.cwd.is_some()
                {
                    return invalid("http transport only accepts 'url' and 'headers'");
                }
            }
        }
        Ok(())
    }

    /// Launch configuration as written, placeholders unresolved.
    pub fn launch(&self) -> LaunchConfig {
        match self.transport {
            TransportKind::Stdio => LaunchConfig::Stdio {
                command: self.command.clone().unwrap_or_default(),
                args: self.args.clone(),
                env: self.env.clone(),
                env_file: self.env_file.clone(),
                cwd: self.cwd.clone(),
            },
            TransportKind::Http => LaunchConfig::Http {
                url: self.url.clone().unwrap_or_default(),
                headers: self.headers.clone(),
            },
        }
    }
}

impl RegistryConfig {
    /// Read and parse a config file. Does not validate.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let load_error = |e: String| RegistryError::ConfigLoad(path.display().to_string(), e);
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_error(e.to_string()))?;
        toml::from_str(&content).map_err(|e| load_error(e.to_string()))
    }

    /// Fail fast on misconfigurations before anything is registered.
    pub fn validate(&self) -> crate::Result<()> {
        if !valid_id(&self.collection.id) {
            return Err(RegistryError::InvalidConfig(
                self.collection.id.clone(),
                "collection id must be non-empty alphanumeric with '-', '_' or '.'".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(RegistryError::InvalidConfig(
                self.collection.id.clone(),
                "handshake_timeout_secs must be > 0".to_string(),
            ));
        }

        for (id, server) in &self.servers {
            if !valid_id(id) {
                return Err(RegistryError::InvalidConfig(
                    id.clone(),
                    "server id must be non-empty alphanumeric with '-', '_' or '.'".to_string(),
                ));
            }
            // disabled servers may be incomplete
            if server.enabled {
                server.validate(id)?;
            }
        }
        Ok(())
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.prompt_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Definitions for every enabled server, in id order.
    ///
    /// Each nonce is the content hash of the unresolved launch config, so
    /// editing a server invalidates its cached trust. Servers with
    /// placeholders resolve them against `folder` at user scope.
    pub fn definitions(&self, folder: Option<&Path>) -> Vec<ServerDefinition> {
        self.servers
            .iter()
            .filter(|(_, server)| server.enabled)
            .map(|(id, server)| {
                let launch = server.launch();
                let needs_variables = !placeholders(&launch).is_empty();
                let label = server.label.clone().unwrap_or_else(|| id.clone());
                let definition = ServerDefinition::with_content_nonce(id.clone(), label, launch);
                if needs_variables {
                    definition.with_variable_replacement(VariableReplacement {
                        folder: folder.map(PathBuf::from),
                        target: StorageScope::User,
                    })
                } else {
                    definition
                }
            })
            .collect()
    }

    /// Validate and build the eager config collection.
    pub fn to_collection(&self, folder: Option<&Path>) -> crate::Result<Collection> {
        self.validate()?;
        Ok(
            Collection::new(self.collection.id.clone(), self.collection.label.clone())
                .with_trust(self.collection.trust.into())
                .with_scope(StorageScope::User, ConfigTarget::User)
                .with_definitions(self.definitions(folder)),
        )
    }
}
