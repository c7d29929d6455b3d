//! Server definitions and their launch configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where resolved placeholder values and other per-definition state persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageScope {
    Application,
    User,
    Workspace,
}

/// Configuration layer a collection was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigTarget {
    User,
    UserRemote,
    Workspace,
    WorkspaceFolder,
}

/// How to start (or reach) an MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum LaunchConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl LaunchConfig {
    /// Build a stdio launch with no env or working directory.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        LaunchConfig::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
            env_file: None,
            cwd: None,
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        LaunchConfig::Http {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    /// Apply `f` to every string a placeholder may appear in.
    pub fn map_strings<E>(
        &self,
        mut f: impl FnMut(&str) -> Result<String, E>,
    ) -> Result<LaunchConfig, E> {
        Ok(match self {
            LaunchConfig::Stdio {
                command,
                args,
                env,
                env_file,
                cwd,
            } => LaunchConfig::Stdio {
                command: f(command)?,
                args: args.iter().map(|a| f(a)).collect::<Result<_, E>>()?,
                env: env
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), f(v)?)))
                    .collect::<Result<_, E>>()?,
                env_file: env_file.as_deref().map(&mut f).transpose()?,
                cwd: cwd.as_deref().map(&mut f).transpose()?,
            },
            LaunchConfig::Http { url, headers } => LaunchConfig::Http {
                url: f(url)?,
                headers: headers
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), f(v)?)))
                    .collect::<Result<_, E>>()?,
            },
        })
    }

    /// Every string a placeholder may appear in, in a stable order.
    pub fn strings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            LaunchConfig::Stdio {
                command,
                args,
                env,
                env_file,
                cwd,
            } => {
                out.push(command.as_str());
                out.extend(args.iter().map(String::as_str));
                let mut keys: Vec<&String> = env.keys().collect();
                keys.sort();
                out.extend(keys.into_iter().map(|k| env[k].as_str()));
                out.extend(env_file.as_deref());
                out.extend(cwd.as_deref());
            }
            LaunchConfig::Http { url, headers } => {
                out.push(url.as_str());
                let mut keys: Vec<&String> = headers.keys().collect();
                keys.sort();
                out.extend(keys.into_iter().map(|k| headers[k].as_str()));
            }
        }
        out
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        match self {
            LaunchConfig::Stdio { cwd, .. } => cwd.as_ref().map(PathBuf::from),
            LaunchConfig::Http { .. } => None,
        }
    }
}

/// Where resolved placeholder values are scoped and saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableReplacement {
    /// Folder `${workspaceFolder}` resolves against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<PathBuf>,
    /// Persistence layer for values resolved for this definition.
    pub target: StorageScope,
}

/// One addressable server within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    pub label: String,
    /// Changes whenever the definition's meaningful content changes.
    pub cache_nonce: String,
    pub launch: LaunchConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_replacement: Option<VariableReplacement>,
}

impl ServerDefinition {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        cache_nonce: impl Into<String>,
        launch: LaunchConfig,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            cache_nonce: cache_nonce.into(),
            launch,
            variable_replacement: None,
        }
    }

    /// Build a definition whose nonce is derived from its launch content.
    pub fn with_content_nonce(
        id: impl Into<String>,
        label: impl Into<String>,
        launch: LaunchConfig,
    ) -> Self {
        let nonce = content_nonce(&launch);
        Self::new(id, label, nonce, launch)
    }

    #[must_use]
    pub fn with_variable_replacement(mut self, replacement: VariableReplacement) -> Self {
        self.variable_replacement = Some(replacement);
        self
    }

    /// True if both are the same version of a server.
    pub fn same_version(&self, other: &ServerDefinition) -> bool {
        self.cache_nonce == other.cache_nonce
    }
}

/// SHA-256 over the canonical launch content, hex encoded.
///
/// Every field is written under its own tag with a length prefix, so moving a
/// value from one field to another changes the nonce.
pub fn content_nonce(launch: &LaunchConfig) -> String {
    let mut hasher = Sha256::new();
    match launch {
        LaunchConfig::Stdio {
            command,
            args,
            env,
            env_file,
            cwd,
        } => {
            hash_field(&mut hasher, "transport", "stdio");
            hash_field(&mut hasher, "command", command);
            hash_count(&mut hasher, "args", args.len());
            for arg in args {
                hash_field(&mut hasher, "arg", arg);
            }
            hash_map(&mut hasher, "env", env);
            hash_optional(&mut hasher, "env_file", env_file.as_deref());
            hash_optional(&mut hasher, "cwd", cwd.as_deref());
        }
        LaunchConfig::Http { url, headers } => {
            hash_field(&mut hasher, "transport", "http");
            hash_field(&mut hasher, "url", url);
            hash_map(&mut hasher, "headers", headers);
        }
    }
    format!("{:x}", hasher.finalize())
}

fn hash_field(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn hash_count(hasher: &mut Sha256, tag: &str, count: usize) {
    hasher.update(tag.as_bytes());
    hasher.update([1u8]);
    hasher.update((count as u64).to_be_bytes());
}

fn hash_optional(hasher: &mut Sha256, tag: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            hash_count(hasher, tag, 1);
            hash_field(hasher, tag, value);
        }
        None => hash_count(hasher, tag, 0),
    }
}

fn hash_map(hasher: &mut Sha256, tag: &str, map: &HashMap<String, String>) {
    hash_count(hasher, tag, map.len());
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        hash_field(hasher, "key", key);
        hash_field(hasher, "value", &map[key]);
    }
}
