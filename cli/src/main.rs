//! porter-registry: inspect and connect to configured MCP servers.
//!
//! Three subcommands:
//! - `list`: show collections, servers and lazy discovery state
//! - `connect <server>`: resolve trust, start the server and list its tools
//! - `watch`: hot-reload the config and print changes until Ctrl-C

mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use porter_registry::{
    PromptType, Registry, RegistryConfig, ResolveConnectionArgs, run_hot_reload,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::prompt::{TerminalPrompter, TrustStore};

#[derive(Parser)]
#[command(
    name = "porter-registry",
    version,
    about = "Inspect and connect to configured MCP servers"
)]
struct Cli {
    /// Path to registry.toml [default: ./registry.toml or ~/.config/porter/registry.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List collections and their servers
    List,
    /// Start a server after trust checks and list its tools
    Connect {
        /// Server id
        server: String,
        /// When to ask: default, never, only-new or all-untrusted
        #[arg(long, default_value = "default")]
        prompt: PromptType,
        /// Trust changed definitions without asking
        #[arg(long)]
        auto_trust: bool,
        /// Trust store path [default: $DATA_DIR/porter/trust.json]
        #[arg(long)]
        trust_store: Option<PathBuf>,
    },
    /// Reload the config on change and print the servers until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
        cancel_for_signal.cancel();
    });

    let config_path = resolve_config(cli.config)?;
    let registry = Arc::new(build_registry(&config_path).await?);

    match cli.command {
        Commands::List => run_list(&registry).await,
        Commands::Connect {
            server,
            prompt,
            auto_trust,
            trust_store,
        } => run_connect(&registry, &server, prompt, auto_trust, trust_store).await,
        Commands::Watch => run_watch(config_path, registry, cancel).await,
    }
}

async fn build_registry(config_path: &Path) -> Result<Registry> {
    let config = RegistryConfig::load(config_path).await?;
    Registry::from_config(&config, config_path.parent(), Arc::new(TerminalPrompter))
        .context("failed to build registry")
}

async fn run_list(registry: &Registry) -> Result<()> {
    let report = registry.discover_collections().await;
    for failure in &report.failures {
        eprintln!("warning: {failure}");
    }

    if !registry.is_enabled() {
        println!("registry is disabled (enabled = false)");
        return Ok(());
    }
    print_collections(registry);
    println!("lazy collections: {:?}", registry.lazy_collection_state());
    Ok(())
}

fn print_collections(registry: &Registry) {
    for collection in registry.collections().iter() {
        println!(
            "{} ({}) trust={:?}",
            collection.id, collection.label, collection.trust_behavior
        );
        for definition in collection.server_definitions.get().iter() {
            let nonce = definition.cache_nonce.get(..12).unwrap_or(definition.cache_nonce.as_str());
            println!("  {:<24} {:<32} nonce={nonce}", definition.id, definition.label);
        }
    }
}

async fn run_connect(
    registry: &Registry,
    server: &str,
    prompt_type: PromptType,
    auto_trust: bool,
    trust_store: Option<PathBuf>,
) -> Result<()> {
    let (collection, definition) = registry
        .find_definition(server)
        .with_context(|| format!("no server '{server}' in any visible collection"))?;

    let store_path = trust_store
        .or_else(TrustStore::default_path)
        .context("no data directory for the trust store; pass --trust-store")?;
    let mut store = TrustStore::load(&store_path)?;
    let mut bearer = store.bearer(&collection.id, &definition.id);

    let args = ResolveConnectionArgs::new(&collection, &definition, &mut bearer)
        .prompt_type(prompt_type)
        .auto_trust_changes(auto_trust);
    let resolved = registry.resolve_connection(args).await;

    store.set(&collection.id, &definition.id, bearer);
    store.save()?;

    let Some(connection) = resolved? else {
        println!("server '{server}' is not trusted; not started");
        return Ok(());
    };

    let tools = connection.list_tools().await;
    match &tools {
        Ok(tools) => {
            println!("{server}: {} tool(s)", tools.len());
            for tool in tools {
                let description = tool.description.as_deref().unwrap_or("");
                println!("  {:<32} {description}", tool.name);
            }
        }
        Err(e) => eprintln!("failed to list tools: {e}"),
    }
    connection.dispose().await;
    tools.map(|_| ()).map_err(Into::into)
}

async fn run_watch(
    config_path: PathBuf,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut updates = registry.subscribe_collections();
    let watcher = tokio::spawn(run_hot_reload(
        config_path,
        registry.clone(),
        cancel.child_token(),
    ));

    print_collections(&registry);
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("--- collections changed ---");
                print_collections(&registry);
            }
            _ = cancel.cancelled() => break,
        }
    }

    watcher.await.context("hot reload task panicked")??;
    Ok(())
}

/// Resolve config file path: explicit flag → ./registry.toml → ~/.config/porter/registry.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("registry.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("porter").join("registry.toml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(anyhow::anyhow!(
        "No registry.toml found. Searched ./registry.toml and ~/.config/porter/registry.toml. \
         Use --config to specify a path."
    ))
}
