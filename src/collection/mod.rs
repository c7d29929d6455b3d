//! Collections of server definitions.
//!
//! A collection is either eager (definitions known up front) or lazy (a
//! descriptor that can load the real collection on demand). Lazy collections
//! are placeholders: loading is expected to register an eager collection with
//! the same id, which then replaces the placeholder in the store.

pub mod store;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::definition::{ConfigTarget, LaunchConfig, ServerDefinition, StorageScope};
use crate::observable::Observable;

/// Whether connecting to a collection's servers needs user consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustBehavior {
    /// Servers start without any trust check.
    Trusted,
    /// Servers start without prompting only at a nonce the user already trusted.
    TrustedOnNonce,
}

/// Descriptor for a collection whose definitions are not known until loaded.
#[async_trait]
pub trait LazyCollection: Send + Sync {
    /// True if the collection's definitions are already known from a cache.
    fn is_cached(&self) -> bool;

    /// Load the collection. Expected to register the real collection.
    async fn load(&self) -> crate::Result<()>;

    /// Called once if loading finished without the real collection appearing.
    fn removed(&self);
}

/// Override for how a collection turns a definition into a launch config.
#[async_trait]
pub trait LaunchResolver: Send + Sync {
    async fn resolve_server_launch(
        &self,
        definition: &ServerDefinition,
    ) -> crate::Result<LaunchConfig>;
}

/// Eager or lazy collection.
#[derive(Clone)]
pub enum CollectionKind {
    Eager,
    Lazy(Arc<dyn LazyCollection>),
}

impl fmt::Debug for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Eager => f.write_str("Eager"),
            CollectionKind::Lazy(lazy) => f
                .debug_struct("Lazy")
                .field("is_cached", &lazy.is_cached())
                .finish(),
        }
    }
}

/// A named group of server definitions sharing a trust policy.
pub struct Collection {
    pub id: String,
    pub label: String,
    /// Locality hint: `None` for local servers.
    pub remote_authority: Option<String>,
    pub server_definitions: Observable<Vec<ServerDefinition>>,
    pub trust_behavior: TrustBehavior,
    pub scope: StorageScope,
    pub config_target: ConfigTarget,
    pub kind: CollectionKind,
    pub launch_resolver: Option<Arc<dyn LaunchResolver>>,
}

impl Collection {
    /// Eager, nonce-trusted, user-scoped collection.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            remote_authority: None,
            server_definitions: Observable::new(Vec::new()),
            trust_behavior: TrustBehavior::TrustedOnNonce,
            scope: StorageScope::User,
            config_target: ConfigTarget::User,
            kind: CollectionKind::Eager,
            launch_resolver: None,
        }
    }

    #[must_use]
    pub fn with_definitions(self, definitions: Vec<ServerDefinition>) -> Self {
        self.server_definitions.set(definitions);
        self
    }

    #[must_use]
    pub fn with_trust(mut self, trust_behavior: TrustBehavior) -> Self {
        self.trust_behavior = trust_behavior;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: StorageScope, config_target: ConfigTarget) -> Self {
        self.scope = scope;
        self.config_target = config_target;
        self
    }

    #[must_use]
    pub fn with_remote_authority(mut self, authority: impl Into<String>) -> Self {
        self.remote_authority = Some(authority.into());
        self
    }

    #[must_use]
    pub fn lazy(mut self, descriptor: Arc<dyn LazyCollection>) -> Self {
        self.kind = CollectionKind::Lazy(descriptor);
        self
    }

    #[must_use]
    pub fn with_launch_resolver(mut self, resolver: Arc<dyn LaunchResolver>) -> Self {
        self.launch_resolver = Some(resolver);
        self
    }

    pub fn lazy_descriptor(&self) -> Option<&Arc<dyn LazyCollection>> {
        match &self.kind {
            CollectionKind::Lazy(lazy) => Some(lazy),
            CollectionKind::Eager => None,
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.kind, CollectionKind::Lazy(_))
    }

    /// Lazy and not yet known from cache.
    pub fn has_unknown_definitions(&self) -> bool {
        self.lazy_descriptor().is_some_and(|lazy| !lazy.is_cached())
    }

    /// Current definition with the given id.
    pub fn definition(&self, id: &str) -> Option<ServerDefinition> {
        self.server_definitions
            .get()
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("remote_authority", &self.remote_authority)
            .field("trust_behavior", &self.trust_behavior)
            .field("kind", &self.kind)
            .field("definitions", &self.server_definitions.get().len())
            .finish()
    }
}
