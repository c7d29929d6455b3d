//! Hot reload of the registry config file.
//!
//! Watches the file with `notify`. Each detected change (after a 100ms
//! debounce) re-reads and validates the config, then swaps the config
//! collection and applies `enabled`. A failed reload keeps the previous
//! collection and logs a warning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::registry::Registry;

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watch `config_path` and reload `registry` on every change until cancelled.
pub async fn run_hot_reload(
    config_path: PathBuf,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify v8 implements EventHandler for FnMut, not for tokio senders
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .map_err(|e| watch_error(&config_path, e))?;
    watcher
        .watch(&config_path, RecursiveMode::NonRecursive)
        .map_err(|e| watch_error(&config_path, e))?;
    // dropping the watcher stops events silently
    let _watcher = watcher;

    tracing::info!(path = %config_path.display(), "watching config file");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Ok(_)) => {
                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}

                    match reload(&registry, &config_path).await {
                        Ok(()) => tracing::info!(path = %config_path.display(), "config reloaded"),
                        Err(e) => tracing::warn!(
                            error = %e,
                            path = %config_path.display(),
                            "reload failed, keeping previous config"
                        ),
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "file watcher error"),
                None => {
                    tracing::debug!("watcher channel closed");
                    return Ok(());
                }
            },
            _ = cancel.cancelled() => {
                tracing::debug!("hot reload cancelled");
                return Ok(());
            }
        }
    }
}

fn watch_error(path: &Path, e: notify::Error) -> crate::RegistryError {
    crate::RegistryError::ConfigLoad(path.display().to_string(), format!("cannot watch: {e}"))
}

/// Load `config_path` and apply it to `registry`.
pub async fn reload(registry: &Registry, config_path: &Path) -> crate::Result<()> {
    let config = RegistryConfig::load(config_path).await?;
    registry.apply_config(&config, config_path.parent())
}
