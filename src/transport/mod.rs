//! Built-in MCP transports.
//!
//! Both delegates hand back an [`McpTransport`]: an rmcp client session plus
//! whatever process it owns. Cancelling the session token (explicitly or when
//! the transport is dropped) stops the rmcp service; stdio children are also
//! killed on drop.

pub mod http;
pub mod stdio;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, Tool};
use rmcp::service::RunningService;
use rmcp::{Peer, RoleClient};
use tokio::process::Child;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::delegate::Transport;
use crate::error::RegistryError;

pub use http::HttpDelegate;
pub use stdio::StdioDelegate;

/// Default limit for the MCP initialize handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Rolling buffer of a server's stderr lines.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a line, evicting the oldest at capacity.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Last `n` lines joined with newlines.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Map the outcome of a timed handshake onto registry errors.
pub(crate) fn handshake_result<T, E: std::fmt::Display>(
    server: &str,
    limit: Duration,
    result: Result<Result<T, E>, tokio::time::error::Elapsed>,
) -> crate::Result<T> {
    match result {
        Err(_elapsed) => Err(RegistryError::HandshakeTimeout(
            server.to_string(),
            limit.as_secs(),
        )),
        Ok(Err(e)) => Err(RegistryError::TransportStart(
            server.to_string(),
            e.to_string(),
        )),
        Ok(Ok(running)) => Ok(running),
    }
}

/// A live rmcp client session.
pub struct McpTransport {
    server: String,
    peer: Peer<RoleClient>,
    cancel: CancellationToken,
    child: tokio::sync::Mutex<Option<Child>>,
    _service: RunningService<RoleClient, ()>,
    _guard: DropGuard,
}

impl McpTransport {
    pub(crate) fn new(
        server: impl Into<String>,
        service: RunningService<RoleClient, ()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            server: server.into(),
            peer: service.peer().clone(),
            _guard: cancel.clone().drop_guard(),
            cancel,
            child: tokio::sync::Mutex::new(None),
            _service: service,
        }
    }

    /// Owns the server process; it is killed on shutdown or drop.
    pub(crate) fn with_child(mut self, child: Child) -> Self {
        self.child = tokio::sync::Mutex::new(Some(child));
        self
    }
}

#[async_trait]
impl Transport for McpTransport {
    async fn list_tools(&self) -> crate::Result<Vec<Tool>> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| RegistryError::Protocol(self.server.clone(), e.to_string()))?;
        tracing::debug!(server = %self.server, tool_count = tools.len(), "tools listed");
        Ok(tools)
    }

    async fn call_tool(&self, params: CallToolRequestParams) -> crate::Result<CallToolResult> {
        self.peer
            .call_tool(params)
            .await
            .map_err(|e| RegistryError::Protocol(self.server.clone(), e.to_string()))
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(mut child) = self.child.lock().await.take() {
            tracing::info!(server = %self.server, "stopping server process");
            let _ = child.kill().await;
        }
    }
}
