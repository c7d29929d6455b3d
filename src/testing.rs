//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, Tool};
use tokio::sync::Notify;

use crate::collection::Collection;
use crate::definition::{LaunchConfig, ServerDefinition};
use crate::delegate::{Delegate, Transport};
use crate::error::RegistryError;
use crate::trust::{PromptOutcome, TrustPromptRequest, TrustPrompter};
use crate::variables::PlaceholderResolver;

/// Prompter that answers every prompt the same way and records what it was asked.
pub struct ScriptedPrompter {
    outcome: Option<PromptOutcome>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedPrompter {
    fn with_outcome(outcome: Option<PromptOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn cancelling() -> Arc<Self> {
        Self::with_outcome(Some(PromptOutcome::Cancelled))
    }

    pub fn approving(ids: &[&str]) -> Arc<Self> {
        Self::with_outcome(Some(PromptOutcome::Approved(
            ids.iter().map(|s| s.to_string()).collect(),
        )))
    }

    /// Never answers.
    pub fn hanging() -> Arc<Self> {
        Self::with_outcome(None)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Definition ids shown in the `i`th prompt.
    pub fn prompted_ids(&self, i: usize) -> Vec<String> {
        self.calls.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl TrustPrompter for ScriptedPrompter {
    async fn prompt(&self, request: TrustPromptRequest) -> PromptOutcome {
        self.calls.lock().unwrap().push(
            request
                .servers
                .iter()
                .map(|s| s.definition_id.clone())
                .collect(),
        );
        match &self.outcome {
            Some(outcome) => outcome.clone(),
            None => futures::future::pending().await,
        }
    }
}

/// Resolver answering `name#call` for every variable, optionally held on a gate.
#[derive(Default)]
pub struct CountingResolver {
    pub calls: AtomicUsize,
    gated: bool,
    started: Notify,
    gate: Notify,
}

impl CountingResolver {
    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Default::default()
        }
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl PlaceholderResolver for CountingResolver {
    async fn resolve_variables(
        &self,
        _folder: Option<&Path>,
        variables: &[String],
    ) -> crate::Result<HashMap<String, String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.gated {
            self.started.notify_one();
            self.gate.notified().await;
        }
        Ok(variables
            .iter()
            .map(|var| (var.clone(), format!("{var}#{call}")))
            .collect())
    }
}

/// Delegate that hands out [`FakeTransport`]s and records every start.
pub struct FakeDelegate {
    name: String,
    priority: i32,
    accepts: bool,
    http_only: bool,
    fail_with: Option<String>,
    pub started: Mutex<Vec<LaunchConfig>>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl FakeDelegate {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            priority,
            accepts: true,
            http_only: false,
            fail_with: None,
            started: Mutex::new(Vec::new()),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `can_start` always answers false.
    pub fn refusing(mut self) -> Self {
        self.accepts = false;
        self
    }

    /// `can_start` accepts only HTTP launches.
    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// `start` fails with a transport error.
    pub fn failing(mut self, reason: &str) -> Self {
        self.fail_with = Some(reason.to_string());
        self
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn last_launch(&self) -> Option<LaunchConfig> {
        self.started.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Delegate for FakeDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_start(
        &self,
        _collection: &Collection,
        _definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> bool {
        self.accepts && (!self.http_only || matches!(launch, LaunchConfig::Http { .. }))
    }

    async fn start(
        &self,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> crate::Result<Box<dyn Transport>> {
        self.started.lock().unwrap().push(launch.clone());
        if let Some(reason) = &self.fail_with {
            return Err(RegistryError::TransportStart(
                definition.id.clone(),
                reason.clone(),
            ));
        }
        Ok(Box::new(FakeTransport {
            server: definition.id.clone(),
            closed: AtomicBool::new(false),
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

pub struct FakeTransport {
    server: String,
    closed: AtomicBool,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn list_tools(&self) -> crate::Result<Vec<Tool>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, params: CallToolRequestParams) -> crate::Result<CallToolResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Protocol(self.server.clone(), "closed".into()));
        }
        Ok(CallToolResult::success(vec![Content::text(
            params.name.to_string(),
        )]))
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}
