//! porter-registry: MCP server connection registry.
//! Tracks collections of server definitions (eager or lazily discovered),
//! gates connections behind nonce-based trust with grouped user prompts,
//! substitutes launch placeholders, and starts servers through
//! priority-ordered transport delegates (stdio and streamable HTTP built in).

pub mod collection;
pub mod config;
pub mod definition;
pub mod delegate;
pub mod error;
pub mod hot_reload;
pub mod observable;
pub mod registry;
pub mod transport;
pub mod trust;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;

pub use collection::store::{
    CollectionRegistration, CollectionStore, DiscoveryReport, LazyCollectionState,
};
pub use collection::{Collection, CollectionKind, LaunchResolver, LazyCollection, TrustBehavior};
pub use config::{RegistryConfig, ServerConfig, TransportKind};
pub use definition::{
    ConfigTarget, LaunchConfig, ServerDefinition, StorageScope, VariableReplacement,
};
pub use delegate::{Connection, Delegate, DelegateRegistration, Transport};
pub use error::{LazyLoadFailure, RegistryError, Result};
pub use hot_reload::run_hot_reload;
pub use observable::{Observable, Snapshot};
pub use registry::{Registry, RegistryBuilder, ResolveConnectionArgs};
pub use transport::{HttpDelegate, StdioDelegate};
pub use trust::{
    Interaction, ParticipantDecision, PromptOutcome, PromptType, PromptedServer, TrustNegotiator,
    TrustNonceBearer, TrustOptions, TrustPromptRequest, TrustPrompter, TrustedAtNonce,
};
pub use variables::{EnvPlaceholderResolver, PlaceholderResolver};
