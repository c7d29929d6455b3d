//! Streamable HTTP delegate.
//!
//! No subprocess and no stdout filtering: connect, handshake, hand back the
//! session. Configured headers are sent on every request.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::ServiceExt;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use tokio_util::sync::CancellationToken;

use crate::collection::Collection;
use crate::definition::{LaunchConfig, ServerDefinition};
use crate::delegate::{Delegate, Transport};
use crate::error::RegistryError;
use crate::transport::{DEFAULT_HANDSHAKE_TIMEOUT, McpTransport, handshake_result};

/// Connects to remote servers over streamable HTTP.
pub struct HttpDelegate {
    handshake_timeout: Duration,
}

impl Default for HttpDelegate {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl HttpDelegate {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

fn header_map(server: &str, headers: &HashMap<String, String>) -> crate::Result<HeaderMap> {
    let invalid = |msg: String| RegistryError::InvalidConfig(server.to_string(), msg);
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| invalid(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("invalid value for header '{name}': {e}")))?;
        map.insert(header, value);
    }
    Ok(map)
}

#[async_trait]
impl Delegate for HttpDelegate {
    fn name(&self) -> &str {
        "http"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn can_start(
        &self,
        _collection: &Collection,
        _definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> bool {
        matches!(launch, LaunchConfig::Http { .. })
    }

    async fn start(
        &self,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> crate::Result<Box<dyn Transport>> {
        let server = definition.id.as_str();
        let LaunchConfig::Http { url, headers } = launch else {
            return Err(RegistryError::InvalidConfig(
                server.to_string(),
                "http delegate cannot start a stdio server".to_string(),
            ));
        };
        if url.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                server.to_string(),
                "http transport requires 'url' field".to_string(),
            ));
        }

        tracing::info!(server = %server, url = %url, "connecting to HTTP MCP server");
        let client = reqwest::Client::builder()
            .default_headers(header_map(server, headers)?)
            .build()
            .map_err(|e| RegistryError::TransportStart(server.to_string(), e.to_string()))?;
        let transport = StreamableHttpClientTransport::with_client(
            client,
            StreamableHttpClientTransportConfig::with_uri(url.as_str()),
        );

        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(
            self.handshake_timeout,
            ().serve_with_ct(transport, cancel.clone()),
        )
        .await;
        let service = handshake_result(server, self.handshake_timeout, result).inspect_err(|e| {
            cancel.cancel();
            tracing::warn!(server = %server, error = %e, "HTTP server failed to start");
        })?;

        tracing::info!(server = %server, "HTTP MCP session ready");
        Ok(Box::new(McpTransport::new(server, service, cancel)))
    }
}
