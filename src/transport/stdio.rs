//! Stdio subprocess delegate.
//!
//! The child is spawned with raw `tokio::process::Command` rather than rmcp's
//! child-process transport so stdout can be filtered: servers that print
//! banners or logs on stdout would otherwise break the JSON-RPC stream.
//! Stderr is drained into a bounded buffer that feeds startup error messages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::collection::Collection;
use crate::definition::{LaunchConfig, ServerDefinition};
use crate::delegate::{Delegate, Transport};
use crate::error::RegistryError;
use crate::transport::{DEFAULT_HANDSHAKE_TIMEOUT, McpTransport, StderrBuffer, handshake_result};

const STDERR_LINES: usize = 100;

/// Lines of stderr included in a startup error.
const STDERR_TAIL: usize = 5;

/// Starts local stdio servers.
pub struct StdioDelegate {
    handshake_timeout: Duration,
}

impl Default for StdioDelegate {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl StdioDelegate {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped, an
/// `export ` prefix is allowed and matching surrounding quotes are stripped.
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = ['"', '\'']
                .iter()
                .find_map(|q| {
                    value
                        .strip_prefix(*q)
                        .and_then(|v| v.strip_suffix(*q))
                })
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Environment for the child: env file values overridden by explicit ones.
async fn merged_env(
    server: &str,
    env: &HashMap<String, String>,
    env_file: Option<&str>,
    cwd: Option<&Path>,
) -> crate::Result<HashMap<String, String>> {
    let mut merged = HashMap::new();
    if let Some(file) = env_file {
        let mut path = PathBuf::from(file);
        if path.is_relative() {
            if let Some(cwd) = cwd {
                path = cwd.join(path);
            }
        }
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            RegistryError::TransportStart(
                server.to_string(),
                format!("failed to read env file {}: {e}", path.display()),
            )
        })?;
        merged.extend(parse_env_file(&contents));
    }
    merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(merged)
}

async fn spawn_child(server: &str, launch: &LaunchConfig) -> crate::Result<Child> {
    let LaunchConfig::Stdio {
        command,
        args,
        env,
        env_file,
        ..
    } = launch
    else {
        return Err(RegistryError::InvalidConfig(
            server.to_string(),
            "stdio delegate cannot start an http server".to_string(),
        ));
    };
    if command.trim().is_empty() {
        return Err(RegistryError::InvalidConfig(
            server.to_string(),
            "stdio transport requires 'command' field".to_string(),
        ));
    }

    let cwd = launch.working_dir();
    let env = merged_env(server, env, env_file.as_deref(), cwd.as_deref()).await?;

    let mut cmd = Command::new(command);
    cmd.args(args).envs(env);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| RegistryError::TransportStart(server.to_string(), e.to_string()))
}

/// Forward only JSON lines from the child's stdout to the returned reader.
fn start_stdout_filter(
    child_stdout: tokio::process::ChildStdout,
    server: String,
    cancel: CancellationToken,
) -> tokio::io::ReadHalf<tokio::io::DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _client_writer) = tokio::io::split(client_side);
    let (_server_reader, mut writer) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) if is_json_line(&line) => {
                        if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(line)) => {
                        tracing::debug!(server = %server, line = %line, "discarding non-JSON stdout line");
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        // dropping the writer signals EOF to rmcp
    });

    reader
}

fn is_json_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line).is_ok()
}

fn start_stderr_drain(
    child_stderr: tokio::process::ChildStderr,
    server: String,
    buffer: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        tracing::debug!(server = %server, line = %line, "server stderr");
                        buffer
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(line);
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });
}

#[async_trait]
impl Delegate for StdioDelegate {
    fn name(&self) -> &str {
        "stdio"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn can_start(
        &self,
        collection: &Collection,
        _definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> bool {
        collection.remote_authority.is_none() && matches!(launch, LaunchConfig::Stdio { .. })
    }

    async fn start(
        &self,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> crate::Result<Box<dyn Transport>> {
        let server = definition.id.as_str();
        tracing::info!(server = %server, "spawning stdio MCP server");

        let mut child = spawn_child(server, launch).await?;
        let pipe_error = |name: &str| {
            RegistryError::TransportStart(server.to_string(), format!("failed to open {name} pipe"))
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        let cancel = CancellationToken::new();
        let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(STDERR_LINES)));
        let filtered = start_stdout_filter(stdout, server.to_string(), cancel.clone());
        start_stderr_drain(stderr, server.to_string(), stderr_buf.clone(), cancel.clone());

        let result = tokio::time::timeout(
            self.handshake_timeout,
            ().serve_with_ct((filtered, stdin), cancel.clone()),
        )
        .await;

        match handshake_result(server, self.handshake_timeout, result) {
            Ok(service) => {
                tracing::info!(server = %server, "stdio MCP server ready");
                Ok(Box::new(McpTransport::new(server, service, cancel).with_child(child)))
            }
            Err(e) => {
                cancel.cancel();
                let _ = child.kill().await;
                let tail = stderr_buf
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .tail(STDERR_TAIL);
                tracing::warn!(server = %server, error = %e, stderr = %tail, "stdio server failed to start");
                Err(match e {
                    RegistryError::TransportStart(id, msg) if !tail.is_empty() => {
                        RegistryError::TransportStart(id, format!("{msg}; stderr: {tail}"))
                    }
                    other => other,
                })
            }
        }
    }
}
