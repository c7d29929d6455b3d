//! Terminal trust prompt and the on-disk trust store.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use porter_registry::{PromptOutcome, TrustNonceBearer, TrustPromptRequest, TrustPrompter};

/// An empty answer cancels, leaving trust state as it was.
const ANSWER_HINT: &str = "[y/n/ids, empty cancels]";

/// Asks on stderr and reads the answer from stdin.
///
/// `y` approves every listed server, `n` refuses them all, a comma-separated
/// list of ids approves just those. An empty answer or EOF cancels.
pub struct TerminalPrompter;

#[async_trait]
impl TrustPrompter for TerminalPrompter {
    async fn prompt(&self, request: TrustPromptRequest) -> PromptOutcome {
        let answer = tokio::task::spawn_blocking(move || ask(&request)).await;
        match answer {
            Ok(Some(outcome)) => outcome,
            Ok(None) => PromptOutcome::Cancelled,
            Err(e) => {
                tracing::warn!(error = %e, "trust prompt task failed");
                PromptOutcome::Cancelled
            }
        }
    }
}

fn ask(request: &TrustPromptRequest) -> Option<PromptOutcome> {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "The following MCP servers are not trusted yet:");
    for server in &request.servers {
        let _ = writeln!(
            stderr,
            "  {} ({}) from {}",
            server.definition_id, server.label, server.collection_label
        );
    }
    let _ = write!(stderr, "Trust and start them? {ANSWER_HINT} ");
    let _ = stderr.flush();

    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => return None,
        Ok(_) => {}
    }
    parse_answer(&line, request)
}

pub fn parse_answer(line: &str, request: &TrustPromptRequest) -> Option<PromptOutcome> {
    let ids = || request.servers.iter().map(|s| s.definition_id.clone());
    match line.trim() {
        "" => None,
        "y" | "Y" | "yes" => Some(PromptOutcome::Approved(ids().collect())),
        "n" | "N" | "no" => Some(PromptOutcome::Approved(Vec::new())),
        list => {
            let picked: Vec<&str> = list.split(',').map(str::trim).collect();
            Some(PromptOutcome::Approved(
                ids().filter(|id| picked.contains(&id.as_str())).collect(),
            ))
        }
    }
}

/// Bearers persisted between runs, keyed by `collection/server`.
pub struct TrustStore {
    path: PathBuf,
    bearers: HashMap<String, TrustNonceBearer>,
}

impl TrustStore {
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("porter").join("trust.json"))
    }

    /// Load the store, starting empty if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let bearers = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse trust store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read trust store {}", path.display()));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            bearers,
        })
    }

    pub fn bearer(&self, collection: &str, server: &str) -> TrustNonceBearer {
        self.bearers
            .get(&key(collection, server))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&mut self, collection: &str, server: &str, bearer: TrustNonceBearer) {
        self.bearers.insert(key(collection, server), bearer);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.bearers)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write trust store {}", self.path.display()))
    }
}

fn key(collection: &str, server: &str) -> String {
    format!("{collection}/{server}")
}
