//! Error types for registry and connection operations.
//!
//! Trust denial is not an error: `Registry::resolve_connection` reports it as
//! `Ok(None)`. Everything here is an infrastructure failure the host decides
//! how to surface.

use thiserror::Error;

/// A lazy collection whose `load()` failed during discovery.
#[derive(Debug)]
pub struct LazyLoadFailure {
    pub collection_id: String,
    pub error: RegistryError,
}

impl std::fmt::Display for LazyLoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.collection_id, self.error)
    }
}

/// Main error type for registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Config file could not be read or parsed
    #[error("failed to load config '{0}': {1}")]
    ConfigLoad(String, String),

    /// Invalid configuration for a named server
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// No registered delegate can start the server
    #[error("no delegate can start server '{0}'")]
    NoMatchingDelegate(String),

    /// A delegate failed to start the transport for a named server
    #[error("transport start failed for server '{0}': {1}")]
    TransportStart(String, String),

    /// MCP handshake did not finish in time
    #[error("handshake for server '{0}' timed out after {1}s")]
    HandshakeTimeout(String, u64),

    /// Placeholder resolution failed for a named server
    #[error("variable resolution failed for server '{0}': {1}")]
    VariableResolution(String, String),

    /// MCP protocol error on an established connection
    #[error("protocol error for server '{0}': {1}")]
    Protocol(String, String),

    /// Loading a lazy collection failed
    #[error("lazy collection load failed for '{0}': {1}")]
    CollectionLoad(String, String),

    /// One or more lazy collections failed during discovery
    #[error("{} lazy collection(s) failed to load: {}", .0.len(), join_failures(.0))]
    LazyLoad(Vec<LazyLoadFailure>),
}

fn join_failures(failures: &[LazyLoadFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
