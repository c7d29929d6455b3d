//! Trust negotiation for server definitions.
//!
//! A connection to a `TrustedOnNonce` collection may start silently only if
//! the caller's bearer already carries consent for the definition's current
//! `cache_nonce`. Otherwise the user is asked. Concurrent requests that share
//! an [`Interaction`] are grouped behind one prompt: the first participant
//! creates a single shared prompt future and every other participant awaits
//! the same result.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

use crate::collection::{Collection, TrustBehavior};
use crate::definition::ServerDefinition;

/// Serialized form of [`TrustedAtNonce::ExplicitlyDenied`].
pub const EXPLICITLY_DENIED_NONCE: &str = "__explicitly-denied";

/// Last trust decision recorded for a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum TrustedAtNonce {
    /// Never evaluated.
    #[default]
    Unset,
    /// Trusted at this nonce.
    Nonce(String),
    /// The user refused the server.
    ExplicitlyDenied,
}

impl From<Option<String>> for TrustedAtNonce {
    fn from(value: Option<String>) -> Self {
        match value {
            None => TrustedAtNonce::Unset,
            Some(v) if v == EXPLICITLY_DENIED_NONCE => TrustedAtNonce::ExplicitlyDenied,
            Some(v) => TrustedAtNonce::Nonce(v),
        }
    }
}

impl From<TrustedAtNonce> for Option<String> {
    fn from(value: TrustedAtNonce) -> Self {
        match value {
            TrustedAtNonce::Unset => None,
            TrustedAtNonce::Nonce(v) => Some(v),
            TrustedAtNonce::ExplicitlyDenied => Some(EXPLICITLY_DENIED_NONCE.to_string()),
        }
    }
}

/// Caller-owned record of the nonce trust was last granted (or denied) at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustNonceBearer {
    #[serde(default)]
    pub trusted_at_nonce: TrustedAtNonce,
}

impl TrustNonceBearer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trusted_at(nonce: impl Into<String>) -> Self {
        Self {
            trusted_at_nonce: TrustedAtNonce::Nonce(nonce.into()),
        }
    }

    pub fn denied() -> Self {
        Self {
            trusted_at_nonce: TrustedAtNonce::ExplicitlyDenied,
        }
    }

    pub fn is_trusted_at(&self, nonce: &str) -> bool {
        matches!(&self.trusted_at_nonce, TrustedAtNonce::Nonce(n) if n == nonce)
    }

    pub fn is_explicitly_denied(&self) -> bool {
        self.trusted_at_nonce == TrustedAtNonce::ExplicitlyDenied
    }
}

/// When the user may be asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptType {
    /// Prompt for any definition not trusted at its current nonce.
    #[default]
    Default,
    /// Never prompt; untrusted definitions are denied.
    Never,
    /// Prompt, except for definitions the user already refused.
    OnlyNew,
    /// Prompt for every untrusted definition, including refused ones.
    AllUntrusted,
}

impl FromStr for PromptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PromptType::Default),
            "never" => Ok(PromptType::Never),
            "only-new" => Ok(PromptType::OnlyNew),
            "all-untrusted" => Ok(PromptType::AllUntrusted),
            other => Err(format!(
                "unknown prompt type '{other}' (expected default, never, only-new or all-untrusted)"
            )),
        }
    }
}

/// Result of a trust prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// Ids of the definitions the user approved, in prompt order.
    Approved(Vec<String>),
    /// The prompt was dismissed without a decision.
    Cancelled,
}

/// One server listed in a trust prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptedServer {
    pub definition_id: String,
    pub label: String,
    pub collection_id: String,
    pub collection_label: String,
}

/// Everything a prompter needs to render one grouped trust question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPromptRequest {
    pub servers: Vec<PromptedServer>,
}

/// Asks the user whether servers may start.
#[async_trait]
pub trait TrustPrompter: Send + Sync {
    async fn prompt(&self, request: TrustPromptRequest) -> PromptOutcome;
}

/// Decision state of one participant in an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantDecision {
    Unknown,
    Resolved(bool),
}

type SharedPrompt = Shared<BoxFuture<'static, PromptOutcome>>;

struct Participant {
    server: PromptedServer,
    decision: ParticipantDecision,
}

#[derive(Default)]
struct InteractionState {
    participants: Vec<Participant>,
    choice: Option<SharedPrompt>,
}

impl InteractionState {
    fn settle(&mut self, outcome: &PromptOutcome) {
        for participant in &mut self.participants {
            participant.decision = ParticipantDecision::Resolved(outcome_allows(
                outcome,
                &participant.server.definition_id,
            ));
        }
    }
}

fn outcome_allows(outcome: &PromptOutcome, definition_id: &str) -> bool {
    match outcome {
        PromptOutcome::Approved(ids) => ids.iter().any(|id| id == definition_id),
        PromptOutcome::Cancelled => false,
    }
}

fn lock(state: &Mutex<InteractionState>) -> MutexGuard<'_, InteractionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared context grouping concurrent trust decisions behind one prompt.
///
/// Cloning shares the same participants and prompt.
#[derive(Clone, Default)]
pub struct Interaction {
    state: Arc<Mutex<InteractionState>>,
}

impl Interaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Participants in registration order.
    pub fn participants(&self) -> Vec<(String, ParticipantDecision)> {
        lock(&self.state)
            .participants
            .iter()
            .map(|p| (p.server.definition_id.clone(), p.decision))
            .collect()
    }

    pub fn decision(&self, definition_id: &str) -> Option<ParticipantDecision> {
        lock(&self.state)
            .participants
            .iter()
            .find(|p| p.server.definition_id == definition_id)
            .map(|p| p.decision)
    }

    /// True once the interaction's single prompt has been created.
    pub fn has_prompted(&self) -> bool {
        lock(&self.state).choice.is_some()
    }
}

impl fmt::Debug for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interaction")
            .field("participants", &self.participants())
            .field("has_prompted", &self.has_prompted())
            .finish()
    }
}

/// Per-call trust options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustOptions<'a> {
    pub interaction: Option<&'a Interaction>,
    pub prompt_type: PromptType,
    /// Accept changed definitions without asking.
    pub auto_trust_changes: bool,
}

/// Decides whether a connection may start, prompting when needed.
pub struct TrustNegotiator {
    prompter: Arc<dyn TrustPrompter>,
    prompt_timeout: Option<Duration>,
}

impl TrustNegotiator {
    pub fn new(prompter: Arc<dyn TrustPrompter>) -> Self {
        Self {
            prompter,
            prompt_timeout: None,
        }
    }

    /// Treat a prompt that has not answered within `timeout` as cancelled.
    #[must_use]
    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    /// Decide trust for `definition`, updating `bearer` with the decision.
    pub async fn resolve_trust(
        &self,
        collection: &Collection,
        definition: &ServerDefinition,
        bearer: &mut TrustNonceBearer,
        options: TrustOptions<'_>,
    ) -> bool {
        if collection.trust_behavior == TrustBehavior::Trusted {
            return true;
        }

        if bearer.is_trusted_at(&definition.cache_nonce) {
            tracing::debug!(server = %definition.id, "trusted at current nonce");
            return true;
        }

        let previously_denied = bearer.is_explicitly_denied();

        match options.prompt_type {
            PromptType::Never => {
                tracing::debug!(server = %definition.id, "not trusted and prompting disabled");
                return false;
            }
            PromptType::OnlyNew if previously_denied => {
                tracing::debug!(server = %definition.id, "previously denied, not asking again");
                return false;
            }
            _ => {}
        }

        if options.auto_trust_changes {
            tracing::debug!(server = %definition.id, nonce = %definition.cache_nonce, "auto-trusting changed definition");
            bearer.trusted_at_nonce = TrustedAtNonce::Nonce(definition.cache_nonce.clone());
            return true;
        }

        let owned;
        let interaction = match options.interaction {
            Some(interaction) => interaction,
            None => {
                owned = Interaction::new();
                &owned
            }
        };

        // registration and prompt creation happen before the first await
        let choice = {
            let mut state = lock(&interaction.state);
            let registered = state
                .participants
                .iter_mut()
                .find(|p| p.server.definition_id == definition.id);
            match registered {
                Some(participant) => participant.decision = ParticipantDecision::Unknown,
                None => state.participants.push(Participant {
                    server: PromptedServer {
                        definition_id: definition.id.clone(),
                        label: definition.label.clone(),
                        collection_id: collection.id.clone(),
                        collection_label: collection.label.clone(),
                    },
                    decision: ParticipantDecision::Unknown,
                }),
            }
            state
                .choice
                .get_or_insert_with(|| self.prompt(Arc::downgrade(&interaction.state)))
                .clone()
        };

        let outcome = choice.await;
        let allowed = outcome_allows(&outcome, &definition.id);

        {
            let mut state = lock(&interaction.state);
            if let Some(participant) = state
                .participants
                .iter_mut()
                .find(|p| p.server.definition_id == definition.id)
            {
                participant.decision = ParticipantDecision::Resolved(allowed);
            }
        }

        match outcome {
            PromptOutcome::Cancelled => {
                tracing::info!(server = %definition.id, "trust prompt cancelled");
            }
            PromptOutcome::Approved(_) if allowed => {
                bearer.trusted_at_nonce = TrustedAtNonce::Nonce(definition.cache_nonce.clone());
            }
            PromptOutcome::Approved(_) => {
                tracing::warn!(server = %definition.id, "user denied trust for server");
                bearer.trusted_at_nonce = TrustedAtNonce::ExplicitlyDenied;
            }
        }
        allowed
    }

    /// Build the interaction's single shared prompt.
    fn prompt(&self, state: Weak<Mutex<InteractionState>>) -> SharedPrompt {
        let prompter = Arc::clone(&self.prompter);
        let timeout = self.prompt_timeout;
        async move {
            // participants started in the same tick register before we snapshot
            tokio::task::yield_now().await;

            let Some(request) = state.upgrade().map(|state| TrustPromptRequest {
                servers: lock(&state)
                    .participants
                    .iter()
                    .map(|p| p.server.clone())
                    .collect(),
            }) else {
                return PromptOutcome::Cancelled;
            };

            let ids: Vec<&str> = request
                .servers
                .iter()
                .map(|s| s.definition_id.as_str())
                .collect();
            tracing::info!(servers = ?ids, "prompting for server trust");

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, prompter.prompt(request.clone()))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => {
                        tracing::warn!(
                            timeout_secs = limit.as_secs_f64(),
                            "trust prompt timed out, treating as cancelled"
                        );
                        PromptOutcome::Cancelled
                    }
                },
                None => prompter.prompt(request.clone()).await,
            };

            if let Some(state) = state.upgrade() {
                lock(&state).settle(&outcome);
            }
            outcome
        }
        .boxed()
        .shared()
    }
}
