//! Collection registration bookkeeping and lazy collection discovery.
//!
//! Registered collections live in one table behind a `std::sync::Mutex`. The
//! guard is never held across an `.await`, so a registration and the
//! post-discovery sweep can never interleave halfway. Every mutation
//! republishes the visible snapshot and the aggregate lazy state.
//!
//! Lazy loads are single-flight: a discovery that finds a load already in
//! flight for an entry awaits that load instead of starting another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use tokio::sync::watch;

use crate::collection::Collection;
use crate::error::{LazyLoadFailure, RegistryError};
use crate::observable::{Observable, Snapshot};

/// Aggregate discovery progress over every registered collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyCollectionState {
    /// At least one lazy collection has not been loaded.
    HasUnknown,
    /// A discovery run is in flight.
    LoadingUnknown,
    /// Every collection's definitions are known.
    AllKnown,
}

/// Outcome of one `discover_collections` run.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Collections that replaced a lazy placeholder during the run.
    pub found: Vec<Arc<Collection>>,
    /// Ids of lazy collections swept because loading produced nothing.
    pub removed: Vec<String>,
    /// Lazy collections whose `load()` failed. They stay registered.
    pub failures: Vec<LazyLoadFailure>,
}

impl DiscoveryReport {
    /// Fold load failures into a single error.
    pub fn into_result(self) -> crate::Result<Vec<Arc<Collection>>> {
        if self.failures.is_empty() {
            Ok(self.found)
        } else {
            Err(RegistryError::LazyLoad(self.failures))
        }
    }
}

struct Entry {
    handle: u64,
    collection: Arc<Collection>,
}

/// In-flight `load()` shared by overlapping discoveries. The error is kept as
/// its message so every waiter gets a copy.
type SharedLoad = Shared<BoxFuture<'static, Result<(), String>>>;

struct StoreState {
    entries: Vec<Entry>,
    next_handle: u64,
    ongoing_discoveries: usize,
    enabled: bool,
    // keyed by entry handle
    loading: HashMap<u64, SharedLoad>,
}

impl StoreState {
    fn lazy_state(&self) -> LazyCollectionState {
        if self.ongoing_discoveries > 0 {
            LazyCollectionState::LoadingUnknown
        } else if self
            .entries
            .iter()
            .any(|e| e.collection.has_unknown_definitions())
        {
            LazyCollectionState::HasUnknown
        } else {
            LazyCollectionState::AllKnown
        }
    }

    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Join the in-flight load for `handle`, or start one.
    fn shared_load(&mut self, handle: u64, collection: &Collection) -> Option<SharedLoad> {
        if let Some(load) = self.loading.get(&handle) {
            tracing::debug!(collection = %collection.id, "joining in-flight lazy load");
            return Some(load.clone());
        }
        let lazy = Arc::clone(collection.lazy_descriptor()?);
        let load = async move { lazy.load().await.map_err(load_message) }
            .boxed()
            .shared();
        self.loading.insert(handle, load.clone());
        Some(load)
    }
}

fn load_message(error: RegistryError) -> String {
    match error {
        RegistryError::CollectionLoad(_, message) => message,
        other => other.to_string(),
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    visible: Observable<Vec<Arc<Collection>>>,
    lazy_state: Observable<LazyCollectionState>,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Republish both snapshots. Called with the state lock held.
    fn publish(&self, state: &StoreState) {
        let visible = if state.enabled {
            state
                .entries
                .iter()
                .map(|e| Arc::clone(&e.collection))
                .collect()
        } else {
            Vec::new()
        };
        self.visible.set(visible);
        self.lazy_state.set_if_changed(state.lazy_state());
    }

    fn unregister(&self, handle: u64) {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.handle != handle);
        if state.entries.len() != before {
            self.publish(&state);
        }
    }
}

/// Handle returned by `register_collection`. Dropping or disposing it removes
/// the collection; it is a no-op if the entry was already replaced or swept.
#[must_use = "dropping the registration unregisters the collection"]
pub struct CollectionRegistration {
    store: Weak<StoreInner>,
    handle: u64,
    collection_id: String,
}

impl CollectionRegistration {
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn dispose(self) {
        // unregistration happens in Drop
    }
}

impl Drop for CollectionRegistration {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unregister(self.handle);
        }
    }
}

/// Set of registered collections plus lazy discovery state.
#[derive(Clone)]
pub struct CollectionStore {
    inner: Arc<StoreInner>,
}

impl Default for CollectionStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CollectionStore {
    /// Create an empty store. `enabled` gates the visible snapshot.
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    entries: Vec::new(),
                    next_handle: 0,
                    ongoing_discoveries: 0,
                    enabled,
                    loading: HashMap::new(),
                }),
                visible: Observable::new(Vec::new()),
                lazy_state: Observable::new(LazyCollectionState::AllKnown),
            }),
        }
    }

    /// Register a collection.
    ///
    /// A registered lazy collection with the same id is replaced in place
    /// (same position, no `removed()` callback). Otherwise the collection is
    /// appended.
    pub fn register_collection(&self, collection: Collection) -> CollectionRegistration {
        let collection = Arc::new(collection);
        let collection_id = collection.id.clone();
        let mut state = self.inner.lock();
        let handle = Self::insert(&mut state, collection);
        self.inner.publish(&state);

        CollectionRegistration {
            store: Arc::downgrade(&self.inner),
            handle,
            collection_id,
        }
    }

    /// Swap `previous` for `collection` and set enablement in one step.
    ///
    /// Subscribers see a single snapshot: never one without either
    /// collection, nor the new one visible before `enabled` applies. The new
    /// collection takes the previous one's position.
    pub fn replace_collection(
        &self,
        previous: Option<CollectionRegistration>,
        collection: Collection,
        enabled: bool,
    ) -> CollectionRegistration {
        let collection = Arc::new(collection);
        let collection_id = collection.id.clone();
        let handle = {
            let mut state = self.inner.lock();
            let position = previous
                .as_ref()
                .and_then(|p| state.entries.iter().position(|e| e.handle == p.handle));
            let handle = match position {
                Some(idx) => {
                    let handle = state.allocate_handle();
                    state.entries[idx] = Entry { handle, collection };
                    handle
                }
                None => Self::insert(&mut state, collection),
            };
            state.enabled = enabled;
            self.inner.publish(&state);
            handle
        };
        // its entry is gone, so the drop is a no-op
        drop(previous);

        CollectionRegistration {
            store: Arc::downgrade(&self.inner),
            handle,
            collection_id,
        }
    }

    /// Insert under the lock without publishing; returns the new handle.
    fn insert(state: &mut StoreState, collection: Arc<Collection>) -> u64 {
        let collection_id = collection.id.clone();
        let handle = state.allocate_handle();

        let replaced = state
            .entries
            .iter_mut()
            .find(|e| e.collection.is_lazy() && e.collection.id == collection.id);
        match replaced {
            Some(entry) => {
                tracing::debug!(collection = %collection_id, "replacing lazy collection");
                entry.handle = handle;
                entry.collection = collection;
            }
            None => {
                if state.entries.iter().any(|e| e.collection.id == collection_id) {
                    tracing::warn!(collection = %collection_id, "collection id already registered");
                }
                tracing::debug!(collection = %collection_id, "registering collection");
                state.entries.push(Entry { handle, collection });
            }
        }
        handle
    }

    /// Visible collections: empty while disabled.
    pub fn collections(&self) -> Arc<Vec<Arc<Collection>>> {
        self.inner.visible.get()
    }

    pub fn subscribe_collections(&self) -> watch::Receiver<Snapshot<Vec<Arc<Collection>>>> {
        self.inner.visible.subscribe()
    }

    /// Look up a registered collection by id, ignoring enablement.
    pub fn collection(&self, id: &str) -> Option<Arc<Collection>> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|e| e.collection.id == id)
            .map(|e| Arc::clone(&e.collection))
    }

    pub fn lazy_collection_state(&self) -> LazyCollectionState {
        self.inner.lock().lazy_state()
    }

    pub fn subscribe_lazy_collection_state(
        &self,
    ) -> watch::Receiver<Snapshot<LazyCollectionState>> {
        self.inner.lazy_state.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Toggle visibility without touching registrations.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.lock();
        if state.enabled != enabled {
            state.enabled = enabled;
            self.inner.publish(&state);
        }
    }

    /// Load every registered, uncached lazy collection concurrently, then
    /// sweep the ones that were not replaced by a real registration.
    pub async fn discover_collections(&self) -> DiscoveryReport {
        let to_discover: Vec<(u64, Arc<Collection>, SharedLoad)> = {
            let mut state = self.inner.lock();
            let unknown: Vec<(u64, Arc<Collection>)> = state
                .entries
                .iter()
                .filter(|e| e.collection.has_unknown_definitions())
                .map(|e| (e.handle, Arc::clone(&e.collection)))
                .collect();
            let pending = unknown
                .into_iter()
                .filter_map(|(handle, collection)| {
                    let load = state.shared_load(handle, &collection)?;
                    Some((handle, collection, load))
                })
                .collect();
            state.ongoing_discoveries += 1;
            self.inner.publish(&state);
            pending
        };
        let mut guard = DiscoveryGuard {
            inner: &self.inner,
            armed: true,
        };

        tracing::info!(count = to_discover.len(), "discovering lazy collections");

        let results = join_all(to_discover.iter().map(|(_, _, load)| load.clone())).await;

        let mut report = DiscoveryReport::default();
        let mut swept = Vec::new();
        {
            let mut state = self.inner.lock();
            guard.armed = false;
            state.ongoing_discoveries -= 1;

            for ((handle, collection, _), result) in to_discover.into_iter().zip(results) {
                state.loading.remove(&handle);
                if let Err(message) = result {
                    tracing::warn!(
                        collection = %collection.id,
                        error = %message,
                        "lazy collection failed to load"
                    );
                    report.failures.push(LazyLoadFailure {
                        collection_id: collection.id.clone(),
                        error: RegistryError::CollectionLoad(collection.id.clone(), message),
                    });
                    continue;
                }

                let current = state
                    .entries
                    .iter()
                    .position(|e| e.collection.id == collection.id);
                match current {
                    Some(idx) if state.entries[idx].handle == handle => {
                        state.entries.remove(idx);
                        swept.push(collection);
                    }
                    Some(idx) => report.found.push(Arc::clone(&state.entries[idx].collection)),
                    // disposed while loading
                    None => {}
                }
            }
            self.inner.publish(&state);
        }

        // callbacks run outside the lock so they may touch the store
        for collection in swept {
            tracing::info!(collection = %collection.id, "lazy collection produced no servers, removing");
            if let Some(lazy) = collection.lazy_descriptor() {
                lazy.removed();
            }
            report.removed.push(collection.id.clone());
        }

        report
    }
}

/// Decrements the in-flight counter if discovery is dropped mid-load.
struct DiscoveryGuard<'a> {
    inner: &'a StoreInner,
    armed: bool,
}

impl Drop for DiscoveryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock();
            state.ongoing_discoveries -= 1;
            self.inner.publish(&state);
        }
    }
}
