//! Transport delegates and the connections they produce.
//!
//! A delegate knows how to start a transport for some kinds of definitions.
//! Delegates are kept in descending priority order (registration order breaks
//! ties) and the first one whose `can_start` accepts a definition starts it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, Tool};
use tokio::sync::watch;

use crate::collection::Collection;
use crate::definition::{LaunchConfig, ServerDefinition};
use crate::observable::{Observable, Snapshot};

/// A started, owned channel to one MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_tools(&self) -> crate::Result<Vec<Tool>>;

    async fn call_tool(&self, params: CallToolRequestParams) -> crate::Result<CallToolResult>;

    /// Release the transport. Dropping it must release it too.
    async fn shutdown(&self);
}

/// Provider able to start transports for the definitions it supports.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Higher priorities are tried first.
    fn priority(&self) -> i32;

    /// `launch` is the effective launch, after launch overrides and
    /// placeholder substitution.
    fn can_start(
        &self,
        collection: &Collection,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> bool;

    async fn start(
        &self,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> crate::Result<Box<dyn Transport>>;

    /// Wait until the delegate's providers have finished initial setup.
    async fn wait_for_initial_provider_promises(&self) {}
}

/// Result of a successful connection resolution. Owned by the caller.
pub struct Connection {
    collection_id: String,
    definition: ServerDefinition,
    launch: LaunchConfig,
    transport: Box<dyn Transport>,
}

impl Connection {
    pub fn new(
        collection_id: impl Into<String>,
        definition: ServerDefinition,
        launch: LaunchConfig,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            definition,
            launch,
            transport,
        }
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    /// Launch configuration after overrides and placeholder substitution.
    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<Tool>> {
        self.transport.list_tools().await
    }

    pub async fn call_tool(&self, params: CallToolRequestParams) -> crate::Result<CallToolResult> {
        self.transport.call_tool(params).await
    }

    /// Shut the transport down.
    pub async fn dispose(self) {
        tracing::debug!(server = %self.definition.id, "disposing connection");
        self.transport.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("collection_id", &self.collection_id)
            .field("definition", &self.definition.id)
            .field("launch", &self.launch)
            .finish()
    }
}

struct DelegateEntry {
    handle: u64,
    delegate: Arc<dyn Delegate>,
}

#[derive(Default)]
struct DelegateTable {
    entries: Vec<DelegateEntry>,
    next_handle: u64,
}

struct DelegateSetInner {
    table: Mutex<DelegateTable>,
    published: Observable<Vec<Arc<dyn Delegate>>>,
}

impl DelegateSetInner {
    fn lock(&self) -> MutexGuard<'_, DelegateTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, table: &DelegateTable) {
        self.published.set(
            table
                .entries
                .iter()
                .map(|e| Arc::clone(&e.delegate))
                .collect(),
        );
    }
}

/// Handle returned by `register_delegate`; dropping it unregisters.
#[must_use = "dropping the registration unregisters the delegate"]
pub struct DelegateRegistration {
    set: Weak<DelegateSetInner>,
    handle: u64,
}

impl DelegateRegistration {
    pub fn dispose(self) {
        // unregistration happens in Drop
    }
}

impl Drop for DelegateRegistration {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            let mut table = set.lock();
            table.entries.retain(|e| e.handle != self.handle);
            set.publish(&table);
        }
    }
}

/// Priority-ordered set of registered delegates.
#[derive(Clone)]
pub struct DelegateSet {
    inner: Arc<DelegateSetInner>,
}

impl Default for DelegateSet {
    fn default() -> Self {
        Self {
            inner: Arc::new(DelegateSetInner {
                table: Mutex::new(DelegateTable::default()),
                published: Observable::new(Vec::new()),
            }),
        }
    }
}

impl DelegateSet {
    pub fn register(&self, delegate: Arc<dyn Delegate>) -> DelegateRegistration {
        let mut table = self.inner.lock();
        table.next_handle += 1;
        let handle = table.next_handle;
        tracing::debug!(delegate = delegate.name(), priority = delegate.priority(), "registering delegate");
        table.entries.push(DelegateEntry { handle, delegate });
        // stable: equal priorities keep registration order
        table
            .entries
            .sort_by(|a, b| b.delegate.priority().cmp(&a.delegate.priority()));
        self.inner.publish(&table);
        DelegateRegistration {
            set: Arc::downgrade(&self.inner),
            handle,
        }
    }

    /// Delegates in the order they are tried.
    pub fn delegates(&self) -> Arc<Vec<Arc<dyn Delegate>>> {
        self.inner.published.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<Vec<Arc<dyn Delegate>>>> {
        self.inner.published.subscribe()
    }

    /// First delegate able to start `definition` with `launch`.
    pub fn find(
        &self,
        collection: &Collection,
        definition: &ServerDefinition,
        launch: &LaunchConfig,
    ) -> Option<Arc<dyn Delegate>> {
        self.delegates()
            .iter()
            .find(|d| d.can_start(collection, definition, launch))
            .cloned()
    }
}
