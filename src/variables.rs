//! Placeholder substitution for launch configurations.
//!
//! `${...}` placeholders in a launch config are resolved through an external
//! [`PlaceholderResolver`]. Resolved values are saved per
//! `(definition id, target scope)` so a definition that starts again does not
//! ask again until its scope is cleared.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;

use crate::definition::{LaunchConfig, ServerDefinition, StorageScope, VariableReplacement};
use crate::error::RegistryError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Resolves placeholder names (the text between `${` and `}`) to values.
#[async_trait]
pub trait PlaceholderResolver: Send + Sync {
    async fn resolve_variables(
        &self,
        folder: Option<&Path>,
        variables: &[String],
    ) -> crate::Result<HashMap<String, String>>;
}

/// Distinct placeholder names in `launch`, in first-seen order.
pub fn placeholders(launch: &LaunchConfig) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for value in launch.strings() {
        for caps in PLACEHOLDER.captures_iter(value) {
            let name = &caps[1];
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

fn substitute(
    definition: &ServerDefinition,
    launch: &LaunchConfig,
    values: &HashMap<String, String>,
) -> crate::Result<LaunchConfig> {
    launch.map_strings(|template| {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let value = values.get(&caps[1]).ok_or_else(|| {
                RegistryError::VariableResolution(
                    definition.id.clone(),
                    format!("unresolved placeholder '${{{}}}'", &caps[1]),
                )
            })?;
            out.push_str(&template[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    })
}

#[derive(Default)]
struct SavedInputs {
    values: HashMap<(String, StorageScope), HashMap<String, String>>,
    generations: HashMap<StorageScope, u64>,
}

impl SavedInputs {
    fn generation(&self, scope: StorageScope) -> u64 {
        self.generations.get(&scope).copied().unwrap_or(0)
    }
}

/// Memoizing adapter over a [`PlaceholderResolver`].
pub struct VariableResolver {
    resolver: Arc<dyn PlaceholderResolver>,
    saved: Mutex<SavedInputs>,
}

impl VariableResolver {
    pub fn new(resolver: Arc<dyn PlaceholderResolver>) -> Self {
        Self {
            resolver,
            saved: Mutex::new(SavedInputs::default()),
        }
    }

    fn saved(&self) -> MutexGuard<'_, SavedInputs> {
        self.saved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Substitute every placeholder in `launch`.
    ///
    /// Only names without a saved value reach the collaborator. Its failures
    /// propagate; a `VariableResolution` error is re-attributed to
    /// `definition`, the collaborator does not know which server asked.
    pub async fn resolve(
        &self,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
        replacement: &VariableReplacement,
    ) -> crate::Result<LaunchConfig> {
        let needed = placeholders(launch);
        if needed.is_empty() {
            return Ok(launch.clone());
        }

        let key = (definition.id.clone(), replacement.target);
        let (mut values, generation) = {
            let saved = self.saved();
            (
                saved.values.get(&key).cloned().unwrap_or_default(),
                saved.generation(replacement.target),
            )
        };

        let missing: Vec<String> = needed
            .into_iter()
            .filter(|name| !values.contains_key(name))
            .collect();

        if missing.is_empty() {
            tracing::debug!(server = %definition.id, "using saved placeholder values");
        } else {
            tracing::debug!(server = %definition.id, variables = ?missing, "resolving placeholders");
            let resolved = self
                .resolver
                .resolve_variables(replacement.folder.as_deref(), &missing)
                .await
                .map_err(|e| match e {
                    RegistryError::VariableResolution(_, msg) => {
                        RegistryError::VariableResolution(definition.id.clone(), msg)
                    }
                    other => other,
                })?;
            values.extend(resolved);

            let mut saved = self.saved();
            // a clear during the await wins: don't repopulate its scope
            if saved.generation(replacement.target) == generation {
                saved.values.insert(key, values.clone());
            }
        }

        substitute(definition, launch, &values)
    }

    /// Forget saved values for every definition targeting `scope`.
    pub fn clear_saved_inputs(&self, scope: StorageScope) {
        let mut saved = self.saved();
        saved.values.retain(|(_, target), _| *target != scope);
        *saved.generations.entry(scope).or_insert(0) += 1;
        tracing::debug!(?scope, "cleared saved inputs");
    }
}

/// Resolves placeholders from the process environment.
///
/// Supported names: `env:NAME`, a bare `NAME` (same as `env:NAME`),
/// `workspaceFolder`, `userHome`, `pathSeparator` and `input:ID` for values
/// supplied up front with [`EnvPlaceholderResolver::with_input`]. Unset
/// environment variables resolve to the empty string.
#[derive(Debug, Default, Clone)]
pub struct EnvPlaceholderResolver {
    overrides: HashMap<String, String>,
    inputs: HashMap<String, String>,
}

impl EnvPlaceholderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `value` for `NAME` instead of the process environment.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_input(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(id.into(), value.into());
        self
    }

    fn env(&self, name: &str) -> String {
        self.overrides
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default()
    }

    fn resolve_one(&self, folder: Option<&Path>, variable: &str) -> crate::Result<String> {
        let fail = |msg: String| {
            RegistryError::VariableResolution(variable.to_string(), format!("${{{variable}}}: {msg}"))
        };

        if let Some(name) = variable.strip_prefix("env:") {
            return Ok(self.env(name));
        }
        if let Some(id) = variable.strip_prefix("input:") {
            return self
                .inputs
                .get(id)
                .cloned()
                .ok_or_else(|| fail(format!("no value supplied for input '{id}'")));
        }
        match variable {
            "workspaceFolder" => folder
                .map(|f| f.display().to_string())
                .ok_or_else(|| fail("no workspace folder for ${workspaceFolder}".to_string())),
            "userHome" => {
                let home = self.env("HOME");
                if home.is_empty() {
                    Ok(self.env("USERPROFILE"))
                } else {
                    Ok(home)
                }
            }
            "pathSeparator" => Ok(std::path::MAIN_SEPARATOR.to_string()),
            name if is_env_var_name(name) => Ok(self.env(name)),
            other => Err(fail(format!("unsupported placeholder '{other}'"))),
        }
    }
}

fn is_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[async_trait]
impl PlaceholderResolver for EnvPlaceholderResolver {
    async fn resolve_variables(
        &self,
        folder: Option<&Path>,
        variables: &[String],
    ) -> crate::Result<HashMap<String, String>> {
        variables
            .iter()
            .map(|v| Ok((v.clone(), self.resolve_one(folder, v)?)))
            .collect()
    }
}
