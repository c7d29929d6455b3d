//! Registry: the single public entry point for collections, delegates, and
//! connection resolution.
//!
//! `resolve_connection` runs trust, launch override, placeholder substitution
//! and delegate start in that order. Trust denial is `Ok(None)`; everything
//! else that goes wrong is an error for the host to surface.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::Instrument;

use crate::collection::store::{
    CollectionRegistration, CollectionStore, DiscoveryReport, LazyCollectionState,
};
use crate::collection::Collection;
use crate::config::RegistryConfig;
use crate::definition::{ServerDefinition, StorageScope};
use crate::delegate::{Connection, Delegate, DelegateRegistration, DelegateSet};
use crate::error::RegistryError;
use crate::observable::Snapshot;
use crate::transport::{HttpDelegate, StdioDelegate};
use crate::trust::{
    Interaction, PromptType, TrustNegotiator, TrustNonceBearer, TrustOptions, TrustPrompter,
};
use crate::variables::{EnvPlaceholderResolver, PlaceholderResolver, VariableResolver};

/// Arguments for [`Registry::resolve_connection`].
pub struct ResolveConnectionArgs<'a> {
    pub collection: &'a Collection,
    pub definition: &'a ServerDefinition,
    /// Updated in place with the trust decision.
    pub bearer: &'a mut TrustNonceBearer,
    /// Groups concurrent resolutions behind one prompt.
    pub interaction: Option<&'a Interaction>,
    pub prompt_type: PromptType,
    pub auto_trust_changes: bool,
    /// Span the resolution is logged under.
    pub span: Option<tracing::Span>,
}

impl<'a> ResolveConnectionArgs<'a> {
    pub fn new(
        collection: &'a Collection,
        definition: &'a ServerDefinition,
        bearer: &'a mut TrustNonceBearer,
    ) -> Self {
        Self {
            collection,
            definition,
            bearer,
            interaction: None,
            prompt_type: PromptType::Default,
            auto_trust_changes: false,
            span: None,
        }
    }

    #[must_use]
    pub fn interaction(mut self, interaction: &'a Interaction) -> Self {
        self.interaction = Some(interaction);
        self
    }

    #[must_use]
    pub fn prompt_type(mut self, prompt_type: PromptType) -> Self {
        self.prompt_type = prompt_type;
        self
    }

    #[must_use]
    pub fn auto_trust_changes(mut self, auto_trust_changes: bool) -> Self {
        self.auto_trust_changes = auto_trust_changes;
        self
    }

    #[must_use]
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    prompter: Arc<dyn TrustPrompter>,
    placeholder_resolver: Arc<dyn PlaceholderResolver>,
    prompt_timeout: Option<Duration>,
    enabled: bool,
}

impl RegistryBuilder {
    pub fn new(prompter: Arc<dyn TrustPrompter>) -> Self {
        Self {
            prompter,
            placeholder_resolver: Arc::new(EnvPlaceholderResolver::new()),
            prompt_timeout: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn placeholder_resolver(mut self, resolver: Arc<dyn PlaceholderResolver>) -> Self {
        self.placeholder_resolver = resolver;
        self
    }

    #[must_use]
    pub fn prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            store: CollectionStore::new(self.enabled),
            delegates: DelegateSet::default(),
            trust: TrustNegotiator::new(self.prompter).with_prompt_timeout(self.prompt_timeout),
            variables: VariableResolver::new(self.placeholder_resolver),
            config_collection: Mutex::new(None),
            builtin_delegates: Mutex::new(Vec::new()),
        }
    }
}

pub struct Registry {
    store: CollectionStore,
    delegates: DelegateSet,
    trust: TrustNegotiator,
    variables: VariableResolver,
    /// Registration of the collection built from the config file.
    config_collection: Mutex<Option<CollectionRegistration>>,
    builtin_delegates: Mutex<Vec<DelegateRegistration>>,
}

impl Registry {
    pub fn new(
        prompter: Arc<dyn TrustPrompter>,
        placeholder_resolver: Arc<dyn PlaceholderResolver>,
    ) -> Self {
        RegistryBuilder::new(prompter)
            .placeholder_resolver(placeholder_resolver)
            .build()
    }

    pub fn builder(prompter: Arc<dyn TrustPrompter>) -> RegistryBuilder {
        RegistryBuilder::new(prompter)
    }

    /// Build a registry from config: built-in stdio and HTTP delegates plus
    /// the config collection. `config_dir` is the folder placeholders such as
    /// `${workspaceFolder}` resolve against.
    pub fn from_config(
        config: &RegistryConfig,
        config_dir: Option<&Path>,
        prompter: Arc<dyn TrustPrompter>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let registry = RegistryBuilder::new(prompter)
            .prompt_timeout(config.prompt_timeout())
            .enabled(config.enabled)
            .build();

        let timeout = config.handshake_timeout();
        let builtin = vec![
            registry.register_delegate(Arc::new(StdioDelegate::new(timeout))),
            registry.register_delegate(Arc::new(HttpDelegate::new(timeout))),
        ];
        *lock(&registry.builtin_delegates) = builtin;

        registry.apply_config(config, config_dir)?;
        Ok(registry)
    }

    /// Replace the config collection and apply the enablement setting.
    ///
    /// On a validation error nothing changes.
    pub fn apply_config(
        &self,
        config: &RegistryConfig,
        config_dir: Option<&Path>,
    ) -> crate::Result<()> {
        let collection = config.to_collection(config_dir)?;
        let count = collection.server_definitions.get().len();
        let collection_id = collection.id.clone();

        let mut slot = lock(&self.config_collection);
        let registration = self
            .store
            .replace_collection(slot.take(), collection, config.enabled);
        *slot = Some(registration);
        drop(slot);

        tracing::info!(
            collection = %collection_id,
            servers = count,
            enabled = config.enabled,
            "config collection applied"
        );
        Ok(())
    }

    pub fn register_collection(&self, collection: Collection) -> CollectionRegistration {
        self.store.register_collection(collection)
    }

    pub fn register_delegate(&self, delegate: Arc<dyn Delegate>) -> DelegateRegistration {
        self.delegates.register(delegate)
    }

    /// Visible collections, empty while disabled.
    pub fn collections(&self) -> Arc<Vec<Arc<Collection>>> {
        self.store.collections()
    }

    pub fn subscribe_collections(&self) -> watch::Receiver<Snapshot<Vec<Arc<Collection>>>> {
        self.store.subscribe_collections()
    }

    /// Delegates in the order they are tried.
    pub fn delegates(&self) -> Arc<Vec<Arc<dyn Delegate>>> {
        self.delegates.delegates()
    }

    pub fn subscribe_delegates(&self) -> watch::Receiver<Snapshot<Vec<Arc<dyn Delegate>>>> {
        self.delegates.subscribe()
    }

    pub fn lazy_collection_state(&self) -> LazyCollectionState {
        self.store.lazy_collection_state()
    }

    pub fn subscribe_lazy_collection_state(&self) -> watch::Receiver<Snapshot<LazyCollectionState>> {
        self.store.subscribe_lazy_collection_state()
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.store.set_enabled(enabled);
    }

    /// Wait for delegates to finish provider setup, then load lazy collections.
    pub async fn discover_collections(&self) -> DiscoveryReport {
        let delegates = self.delegates();
        join_all(
            delegates
                .iter()
                .map(|d| d.wait_for_initial_provider_promises()),
        )
        .await;
        self.store.discover_collections().await
    }

    /// Find a visible definition by id, returning its collection too.
    pub fn find_definition(&self, id: &str) -> Option<(Arc<Collection>, ServerDefinition)> {
        self.collections().iter().find_map(|collection| {
            collection
                .definition(id)
                .map(|definition| (Arc::clone(collection), definition))
        })
    }

    /// Forget saved placeholder values for `scope`.
    pub fn clear_saved_inputs(&self, scope: StorageScope) {
        self.variables.clear_saved_inputs(scope);
    }

    /// Resolve a connection, or `Ok(None)` when trust is denied.
    pub async fn resolve_connection(
        &self,
        args: ResolveConnectionArgs<'_>,
    ) -> crate::Result<Option<Connection>> {
        let span = args.span.clone().unwrap_or_else(|| {
            tracing::info_span!(
                "resolve_connection",
                collection = %args.collection.id,
                server = %args.definition.id
            )
        });
        self.resolve(args).instrument(span).await
    }

    async fn resolve(&self, args: ResolveConnectionArgs<'_>) -> crate::Result<Option<Connection>> {
        let ResolveConnectionArgs {
            collection,
            definition,
            bearer,
            interaction,
            prompt_type,
            auto_trust_changes,
            ..
        } = args;

        let options = TrustOptions {
            interaction,
            prompt_type,
            auto_trust_changes,
        };
        if !self
            .trust
            .resolve_trust(collection, definition, bearer, options)
            .await
        {
            tracing::info!(server = %definition.id, "server not trusted, no connection");
            return Ok(None);
        }

        let mut launch = match &collection.launch_resolver {
            Some(resolver) => resolver.resolve_server_launch(definition).await?,
            None => definition.launch.clone(),
        };

        if let Some(replacement) = &definition.variable_replacement {
            launch = self
                .variables
                .resolve(definition, &launch, replacement)
                .await?;
        }

        let delegate = self
            .delegates
            .find(collection, definition, &launch)
            .ok_or_else(|| RegistryError::NoMatchingDelegate(definition.id.clone()))?;

        tracing::info!(server = %definition.id, delegate = delegate.name(), "starting server");
        let transport = delegate.start(definition, &launch).await?;

        Ok(Some(Connection::new(
            collection.id.clone(),
            definition.clone(),
            launch,
            transport,
        )))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("collections", &self.store.collections().len())
            .field("delegates", &self.delegates.delegates().len())
            .field("enabled", &self.store.is_enabled())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::collection::{LaunchResolver, TrustBehavior};
    use crate::definition::{LaunchConfig, VariableReplacement};
    use crate::testing::{CountingResolver, FakeDelegate, ScriptedPrompter};
    use crate::trust::TrustedAtNonce;

    fn definition(id: &str, nonce: &str) -> ServerDefinition {
        ServerDefinition::new(id, id.to_uppercase(), nonce, LaunchConfig::stdio("node", vec![]))
    }

    fn registry_with(prompter: Arc<ScriptedPrompter>) -> (Registry, Arc<FakeDelegate>, DelegateRegistration) {
        let registry = Registry::new(prompter, Arc::new(CountingResolver::default()));
        let delegate = Arc::new(FakeDelegate::new("fake", 0));
        let registration = registry.register_delegate(delegate.clone());
        (registry, delegate, registration)
    }

    fn nonce_collection() -> Collection {
        Collection::new("config", "Config").with_trust(TrustBehavior::TrustedOnNonce)
    }

    #[tokio::test]
    async fn test_trusted_collection_connects_without_prompt() {
        let prompter = ScriptedPrompter::cancelling();
        let (registry, delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::new();

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap();

        assert!(connection.is_some());
        assert_eq!(prompter.call_count(), 0);
        assert_eq!(delegate.start_count(), 1);
    }

    #[tokio::test]
    async fn test_cached_nonce_connects_without_prompt() {
        let prompter = ScriptedPrompter::cancelling();
        let (registry, _delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::trusted_at("n1");

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap();

        assert!(connection.is_some());
        assert_eq!(prompter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_changed_nonce_approved_updates_bearer() {
        let prompter = ScriptedPrompter::approving(&["a"]);
        let (registry, _delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let def = definition("a", "nonce-b");
        let mut bearer = TrustNonceBearer::trusted_at("nonce-a");

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap()
            .expect("approved server connects");

        assert_eq!(connection.definition().id, "a");
        assert_eq!(connection.collection_id(), "config");
        assert_eq!(bearer.trusted_at_nonce, TrustedAtNonce::Nonce("nonce-b".into()));
        assert_eq!(prompter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_changed_nonce_denied_marks_bearer() {
        let prompter = ScriptedPrompter::approving(&[]);
        let (registry, delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let def = definition("a", "nonce-b");
        let mut bearer = TrustNonceBearer::trusted_at("nonce-a");

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap();

        assert!(connection.is_none());
        assert!(bearer.is_explicitly_denied());
        assert_eq!(delegate.start_count(), 0);
    }

    #[tokio::test]
    async fn test_grouped_definitions_share_one_prompt() {
        let prompter = ScriptedPrompter::approving(&["a"]);
        let (registry, delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let (def_a, def_b) = (definition("a", "na"), definition("b", "nb"));
        let (mut bearer_a, mut bearer_b) = (TrustNonceBearer::new(), TrustNonceBearer::new());
        let interaction = Interaction::new();

        let (a, b) = tokio::join!(
            registry.resolve_connection(
                ResolveConnectionArgs::new(&collection, &def_a, &mut bearer_a).interaction(&interaction)
            ),
            registry.resolve_connection(
                ResolveConnectionArgs::new(&collection, &def_b, &mut bearer_b).interaction(&interaction)
            ),
        );

        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_none());
        assert_eq!(prompter.call_count(), 1);
        assert_eq!(prompter.prompted_ids(0), vec!["a", "b"]);
        assert_eq!(bearer_a.trusted_at_nonce, TrustedAtNonce::Nonce("na".into()));
        assert!(bearer_b.is_explicitly_denied());
        assert_eq!(delegate.start_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_prompt_denies_group_without_touching_bearers() {
        let prompter = ScriptedPrompter::cancelling();
        let (registry, _delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let (def_a, def_b) = (definition("a", "na"), definition("b", "nb"));
        let mut bearer_a = TrustNonceBearer::trusted_at("old");
        let mut bearer_b = TrustNonceBearer::new();
        let interaction = Interaction::new();

        let (a, b) = tokio::join!(
            registry.resolve_connection(
                ResolveConnectionArgs::new(&collection, &def_a, &mut bearer_a).interaction(&interaction)
            ),
            registry.resolve_connection(
                ResolveConnectionArgs::new(&collection, &def_b, &mut bearer_b).interaction(&interaction)
            ),
        );

        assert!(a.unwrap().is_none());
        assert!(b.unwrap().is_none());
        assert_eq!(prompter.call_count(), 1);
        assert_eq!(bearer_a.trusted_at_nonce, TrustedAtNonce::Nonce("old".into()));
        assert_eq!(bearer_b.trusted_at_nonce, TrustedAtNonce::Unset);
    }

    #[tokio::test]
    async fn test_never_and_only_new_deny_silently() {
        let prompter = ScriptedPrompter::approving(&["a"]);
        let (registry, _delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let def = definition("a", "n1");

        let mut fresh = TrustNonceBearer::new();
        let never = registry
            .resolve_connection(
                ResolveConnectionArgs::new(&collection, &def, &mut fresh).prompt_type(PromptType::Never),
            )
            .await
            .unwrap();

        let mut denied = TrustNonceBearer::denied();
        let only_new = registry
            .resolve_connection(
                ResolveConnectionArgs::new(&collection, &def, &mut denied)
                    .prompt_type(PromptType::OnlyNew),
            )
            .await
            .unwrap();

        assert!(never.is_none());
        assert!(only_new.is_none());
        assert_eq!(prompter.call_count(), 0);
        assert_eq!(fresh.trusted_at_nonce, TrustedAtNonce::Unset);
        assert!(denied.is_explicitly_denied());
    }

    #[tokio::test]
    async fn test_auto_trust_changes_skips_prompt() {
        let prompter = ScriptedPrompter::cancelling();
        let (registry, _delegate, _reg) = registry_with(prompter.clone());
        let collection = nonce_collection();
        let def = definition("a", "n2");
        let mut bearer = TrustNonceBearer::trusted_at("n1");

        let connection = registry
            .resolve_connection(
                ResolveConnectionArgs::new(&collection, &def, &mut bearer).auto_trust_changes(true),
            )
            .await
            .unwrap();

        assert!(connection.is_some());
        assert_eq!(prompter.call_count(), 0);
        assert!(bearer.is_trusted_at("n2"));
    }

    #[tokio::test]
    async fn test_no_capable_delegate_is_error() {
        let registry = Registry::new(
            ScriptedPrompter::cancelling(),
            Arc::new(CountingResolver::default()),
        );
        let _reg = registry.register_delegate(Arc::new(FakeDelegate::new("picky", 0).refusing()));
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::new();

        let result = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await;

        assert!(matches!(result, Err(RegistryError::NoMatchingDelegate(id)) if id == "a"));
    }

    #[tokio::test]
    async fn test_highest_priority_capable_delegate_starts() {
        let registry = Registry::new(
            ScriptedPrompter::cancelling(),
            Arc::new(CountingResolver::default()),
        );
        let low = Arc::new(FakeDelegate::new("low", 0));
        let high = Arc::new(FakeDelegate::new("high", 5));
        let _low = registry.register_delegate(low.clone());
        let _high = registry.register_delegate(high.clone());
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::new();

        registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap();

        assert_eq!(high.start_count(), 1);
        assert_eq!(low.start_count(), 0);
    }

    #[tokio::test]
    async fn test_delegate_start_failure_propagates() {
        let registry = Registry::new(
            ScriptedPrompter::cancelling(),
            Arc::new(CountingResolver::default()),
        );
        let _reg = registry.register_delegate(Arc::new(FakeDelegate::new("bad", 0).failing("exit 1")));
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::new();

        let result = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await;

        assert!(matches!(result, Err(RegistryError::TransportStart(id, msg)) if id == "a" && msg == "exit 1"));
    }

    struct PinnedLaunch(AtomicUsize);

    #[async_trait]
    impl LaunchResolver for PinnedLaunch {
        async fn resolve_server_launch(
            &self,
            _definition: &ServerDefinition,
        ) -> crate::Result<LaunchConfig> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(LaunchConfig::stdio("${env:OVERRIDE}", vec![]))
        }
    }

    #[tokio::test]
    async fn test_launch_override_then_variable_replacement() {
        let counting = Arc::new(CountingResolver::default());
        let registry = Registry::new(ScriptedPrompter::cancelling(), counting.clone());
        let delegate = Arc::new(FakeDelegate::new("fake", 0));
        let _reg = registry.register_delegate(delegate.clone());
        let pinned = Arc::new(PinnedLaunch(AtomicUsize::new(0)));
        let collection = nonce_collection()
            .with_trust(TrustBehavior::Trusted)
            .with_launch_resolver(pinned.clone());
        let def = definition("a", "n1").with_variable_replacement(VariableReplacement {
            folder: Some(PathBuf::from("/work")),
            target: StorageScope::User,
        });
        let mut bearer = TrustNonceBearer::new();

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap()
            .unwrap();

        let expected = LaunchConfig::stdio("env:OVERRIDE#1", vec![]);
        assert_eq!(pinned.0.load(Ordering::SeqCst), 1);
        assert_eq!(connection.launch(), &expected);
        assert_eq!(delegate.last_launch(), Some(expected));
    }

    struct HttpOverride;

    #[async_trait]
    impl LaunchResolver for HttpOverride {
        async fn resolve_server_launch(
            &self,
            _definition: &ServerDefinition,
        ) -> crate::Result<LaunchConfig> {
            Ok(LaunchConfig::http("http://localhost:1/mcp"))
        }
    }

    #[tokio::test]
    async fn test_delegate_chosen_by_overridden_launch() {
        let registry = Registry::new(
            ScriptedPrompter::cancelling(),
            Arc::new(CountingResolver::default()),
        );
        let _stdio = registry.register_delegate(Arc::new(StdioDelegate::default()));
        let http = Arc::new(FakeDelegate::new("http", 0).http_only());
        let _http = registry.register_delegate(http.clone());
        let collection = nonce_collection()
            .with_trust(TrustBehavior::Trusted)
            .with_launch_resolver(Arc::new(HttpOverride));
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::new();

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap()
            .unwrap();

        let expected = LaunchConfig::http("http://localhost:1/mcp");
        assert_eq!(connection.launch(), &expected);
        assert_eq!(http.last_launch(), Some(expected));
    }

    #[tokio::test]
    async fn test_no_variable_replacement_leaves_launch_untouched() {
        let counting = Arc::new(CountingResolver::default());
        let registry = Registry::new(ScriptedPrompter::cancelling(), counting.clone());
        let delegate = Arc::new(FakeDelegate::new("fake", 0));
        let _reg = registry.register_delegate(delegate.clone());
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let launch = LaunchConfig::stdio("${env:LEFT_ALONE}", vec![]);
        let def = ServerDefinition::new("a", "A", "n1", launch.clone());
        let mut bearer = TrustNonceBearer::new();

        registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap();

        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        assert_eq!(delegate.last_launch(), Some(launch));
    }

    #[tokio::test]
    async fn test_clear_saved_inputs_forces_new_resolution() {
        let counting = Arc::new(CountingResolver::default());
        let registry = Registry::new(ScriptedPrompter::cancelling(), counting.clone());
        let _reg = registry.register_delegate(Arc::new(FakeDelegate::new("fake", 0)));
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let def = ServerDefinition::new("a", "A", "n1", LaunchConfig::stdio("${input:cmd}", vec![]))
            .with_variable_replacement(VariableReplacement {
                folder: None,
                target: StorageScope::Workspace,
            });
        let mut bearer = TrustNonceBearer::new();

        for _ in 0..2 {
            registry
                .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
                .await
                .unwrap();
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        registry.clear_saved_inputs(StorageScope::Workspace);
        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert_eq!(connection.launch(), &LaunchConfig::stdio("input:cmd#2", vec![]));
    }

    #[tokio::test]
    async fn test_dispose_shuts_transport_down() {
        let (registry, delegate, _reg) = registry_with(ScriptedPrompter::cancelling());
        let collection = nonce_collection().with_trust(TrustBehavior::Trusted);
        let def = definition("a", "n1");
        let mut bearer = TrustNonceBearer::new();

        let connection = registry
            .resolve_connection(ResolveConnectionArgs::new(&collection, &def, &mut bearer))
            .await
            .unwrap()
            .unwrap();
        connection.dispose().await;

        assert_eq!(delegate.shutdowns.load(Ordering::SeqCst), 1);
    }

    fn config(toml_str: &str) -> RegistryConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[tokio::test]
    async fn test_from_config_registers_builtins_and_collection() {
        let cfg = config(
            r#"
            [servers.local]
            transport = "stdio"
            command = "node"

            [servers.remote]
            transport = "http"
            url = "http://localhost:1/mcp"
            "#,
        );
        let registry = Registry::from_config(&cfg, None, ScriptedPrompter::cancelling()).unwrap();

        let names: Vec<String> = registry.delegates().iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["stdio", "http"]);
        assert_eq!(registry.collections().len(), 1);
        let (collection, definition) = registry.find_definition("remote").unwrap();
        assert_eq!(collection.id, "config");
        assert!(matches!(definition.launch, LaunchConfig::Http { .. }));
        assert!(registry.find_definition("missing").is_none());
    }

    #[tokio::test]
    async fn test_apply_config_replaces_collection_and_enablement() {
        let registry = Registry::from_config(
            &config("[servers.a]\ntransport = \"stdio\"\ncommand = \"a\"\n"),
            None,
            ScriptedPrompter::cancelling(),
        )
        .unwrap();

        registry
            .apply_config(
                &config("enabled = false\n[servers.b]\ntransport = \"stdio\"\ncommand = \"b\"\n"),
                None,
            )
            .unwrap();
        assert!(registry.collections().is_empty());

        registry.set_enabled(true);
        assert_eq!(registry.collections().len(), 1);
        assert!(registry.find_definition("a").is_none());
        assert!(registry.find_definition("b").is_some());
    }

    #[tokio::test]
    async fn test_apply_config_publishes_no_transient_state() {
        let registry = Registry::from_config(
            &config("[servers.a]\ntransport = \"stdio\"\ncommand = \"a\"\n"),
            None,
            ScriptedPrompter::cancelling(),
        )
        .unwrap();
        let mut rx = registry.subscribe_collections();
        let version = rx.borrow_and_update().version;

        registry
            .apply_config(&config("[servers.b]\ntransport = \"stdio\"\ncommand = \"b\"\n"), None)
            .unwrap();
        let swapped = rx.borrow_and_update().clone();
        assert_eq!(swapped.version, version + 1);
        assert_eq!(swapped.value.len(), 1);
        assert!(swapped.value[0].definition("b").is_some());

        registry
            .apply_config(
                &config("enabled = false\n[servers.c]\ntransport = \"stdio\"\ncommand = \"c\"\n"),
                None,
            )
            .unwrap();
        let hidden = rx.borrow_and_update().clone();
        assert_eq!(hidden.version, version + 2);
        assert!(hidden.value.is_empty());
    }

    #[tokio::test]
    async fn test_apply_invalid_config_keeps_previous() {
        let registry = Registry::from_config(
            &config("[servers.a]\ntransport = \"stdio\"\ncommand = \"a\"\n"),
            None,
            ScriptedPrompter::cancelling(),
        )
        .unwrap();

        let result = registry.apply_config(&config("[servers.b]\ntransport = \"http\"\n"), None);

        assert!(matches!(result, Err(RegistryError::InvalidConfig(id, _)) if id == "b"));
        assert!(registry.find_definition("a").is_some());
    }

    #[tokio::test]
    async fn test_discover_collections_waits_for_delegates() {
        struct SlowDelegate(Arc<AtomicUsize>);

        #[async_trait]
        impl Delegate for SlowDelegate {
            fn name(&self) -> &str {
                "slow"
            }
            fn priority(&self) -> i32 {
                0
            }
            fn can_start(&self, _: &Collection, _: &ServerDefinition, _: &LaunchConfig) -> bool {
                false
            }
            async fn start(
                &self,
                definition: &ServerDefinition,
                _: &LaunchConfig,
            ) -> crate::Result<Box<dyn crate::delegate::Transport>> {
                Err(RegistryError::TransportStart(definition.id.clone(), "unused".into()))
            }
            async fn wait_for_initial_provider_promises(&self) {
                tokio::task::yield_now().await;
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let waited = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new(
            ScriptedPrompter::cancelling(),
            Arc::new(CountingResolver::default()),
        );
        let _reg = registry.register_delegate(Arc::new(SlowDelegate(waited.clone())));

        let report = registry.discover_collections().await;

        assert_eq!(waited.load(Ordering::SeqCst), 1);
        assert!(report.found.is_empty() && report.removed.is_empty());
        assert_eq!(registry.lazy_collection_state(), LazyCollectionState::AllKnown);
    }
}
