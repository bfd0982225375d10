//! Authentication coordinator
//!
//! The [`AuthenticationCoordinator`] is the registry of session providers
//! and the single entry point callers go through.  It deduplicates
//! concurrent identical `get_session` requests via a
//! [`TaskSingler`](crate::singler::TaskSingler), bootstraps dynamic
//! providers through client registration, fans provider session-change
//! events out to one channel, and routes cross-process secret-store changes
//! back into the owning provider's token store.
//!
//! The coordinator is constructed once per process and wired explicitly
//! (HTTP client, config, secret store, flow delegate); there are no
//! process-wide singletons.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{DynauthError, Result};
use crate::protocol::{
    fetch_dynamic_registration, AuthorizationServerMetadata, ProtectedResourceMetadata,
    DEFAULT_CALLBACK_PORT,
};
use crate::provider::{
    dynamic_provider_id, host_label, AuthProvider, DynamicAuthProvider, DynamicProviderConfig,
    FlowDelegate,
};
use crate::secrets::{SecretKey, SecretStore};
use crate::singler::TaskSingler;
use crate::token_store::{
    PersistFn, Session, SessionAccount, SessionChange, TokenRecord, TokenStore,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Client identity and callback settings used for dynamic registration and
/// authorization flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynauthConfig {
    /// `client_name` sent during dynamic client registration.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// `client_uri` sent during dynamic client registration.
    #[serde(default = "default_client_uri")]
    pub client_uri: String,

    /// Redirect URI used in authorization and code-exchange requests.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

fn default_client_name() -> String {
    "dynauth".to_string()
}

fn default_client_uri() -> String {
    "https://github.com/dynauth/dynauth".to_string()
}

fn default_redirect_uri() -> String {
    format!("http://127.0.0.1:{DEFAULT_CALLBACK_PORT}/")
}

impl Default for DynauthConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            client_uri: default_client_uri(),
            redirect_uri: default_redirect_uri(),
        }
    }
}

/// Options supplied when registering a provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderOptions {
    /// Whether the provider can hold sessions for multiple accounts at
    /// once.
    pub supports_multiple_accounts: bool,
}

/// Boolean options of a `get_session` request.
///
/// The flags participate in the request deduplication key, so two calls
/// with the same extension, provider, and scopes but different flags are
/// not collapsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetSessionOptions {
    /// Create a session via the provider's creation flow when none exists.
    pub create_if_none: bool,

    /// Ignore any remembered session preference.
    pub clear_session_preference: bool,

    /// Never prompt or open UI; fail instead.
    pub silent: bool,
}

impl GetSessionOptions {
    /// Canonical string of the boolean flags, sorted by flag name.
    fn canonical_flags(&self) -> String {
        format!(
            "clearSessionPreference:{},createIfNone:{},silent:{}",
            self.clear_session_preference, self.create_if_none, self.silent
        )
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A provider's session-set change, tagged with the provider id.
#[derive(Debug, Clone)]
pub struct ProviderSessionChange {
    /// The provider whose sessions changed.
    pub provider_id: String,

    /// The session diff.
    pub change: SessionChange,
}

/// Notification that a dynamic provider finished registering.
#[derive(Debug, Clone)]
pub struct DynamicProviderRegistered {
    /// The new provider's id.
    pub provider_id: String,

    /// The new provider's label.
    pub label: String,

    /// The authorization server the provider authenticates against.
    pub authorization_server: Url,

    /// The client id obtained statically or via dynamic registration.
    pub client_id: String,
}

// ---------------------------------------------------------------------------
// Registry internals
// ---------------------------------------------------------------------------

struct DynamicEntry {
    client_id: String,
    token_store: Arc<TokenStore>,
}

struct RegisteredProvider {
    label: String,
    provider: Arc<dyn AuthProvider>,
    #[allow(dead_code)]
    options: ProviderOptions,
    relay: JoinHandle<()>,
    dynamic: Option<DynamicEntry>,
}

type Providers = Arc<Mutex<HashMap<String, RegisteredProvider>>>;

/// Handle returned by [`AuthenticationCoordinator::register_provider`].
///
/// Call [`dispose`](Self::dispose) to unsubscribe the change relay and
/// unregister the provider.  Dropping the handle without disposing leaves
/// the provider registered.
pub struct RegistrationDisposer {
    providers: Providers,
    id: String,
}

impl std::fmt::Debug for RegistrationDisposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationDisposer")
            .field("id", &self.id)
            .finish()
    }
}

impl RegistrationDisposer {
    /// Unregisters the provider and stops relaying its change events.
    pub fn dispose(self) {
        if let Some(registered) = self.providers.lock().unwrap().remove(&self.id) {
            registered.relay.abort();
            tracing::debug!("unregistered authentication provider {}", self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// AuthenticationCoordinator
// ---------------------------------------------------------------------------

/// Registry of authentication providers and front door for session calls.
pub struct AuthenticationCoordinator {
    http: reqwest::Client,
    config: DynauthConfig,
    secrets: Arc<dyn SecretStore>,
    delegate: Arc<dyn FlowDelegate>,
    providers: Providers,
    access: Mutex<HashMap<(String, String), bool>>,
    singler: TaskSingler<Result<Option<Session>>>,
    session_changes: broadcast::Sender<ProviderSessionChange>,
    registrations: broadcast::Sender<DynamicProviderRegistered>,
}

impl AuthenticationCoordinator {
    /// Creates a coordinator with no providers registered.
    ///
    /// # Arguments
    ///
    /// * `http` - Shared HTTP client for registration and token requests.
    /// * `config` - Client identity and callback settings.
    /// * `secrets` - Secret store persisting dynamic provider token sets.
    /// * `delegate` - UI-adjacent collaborators of the authorization flow.
    pub fn new(
        http: reqwest::Client,
        config: DynauthConfig,
        secrets: Arc<dyn SecretStore>,
        delegate: Arc<dyn FlowDelegate>,
    ) -> Arc<Self> {
        let (session_changes, _) = broadcast::channel(64);
        let (registrations, _) = broadcast::channel(16);
        Arc::new(Self {
            http,
            config,
            secrets,
            delegate,
            providers: Arc::new(Mutex::new(HashMap::new())),
            access: Mutex::new(HashMap::new()),
            singler: TaskSingler::new(),
            session_changes,
            registrations,
        })
    }

    /// Subscribes to relayed session-change events from all providers.
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<ProviderSessionChange> {
        self.session_changes.subscribe()
    }

    /// Subscribes to dynamic-provider registration notifications.
    pub fn subscribe_registrations(&self) -> broadcast::Receiver<DynamicProviderRegistered> {
        self.registrations.subscribe()
    }

    // -----------------------------------------------------------------------
    // Provider registry
    // -----------------------------------------------------------------------

    /// Registers a session provider under `id`.
    ///
    /// Subscribes to the provider's session-change events and relays them
    /// on the coordinator channel tagged with the provider id.
    ///
    /// # Errors
    ///
    /// Returns [`DynauthError::AlreadyRegistered`] when `id` is taken.
    pub fn register_provider(
        &self,
        id: impl Into<String>,
        label: impl Into<String>,
        provider: Arc<dyn AuthProvider>,
        options: ProviderOptions,
    ) -> Result<RegistrationDisposer> {
        self.register_inner(id.into(), label.into(), provider, options, None)
    }

    fn register_inner(
        &self,
        id: String,
        label: String,
        provider: Arc<dyn AuthProvider>,
        options: ProviderOptions,
        dynamic: Option<DynamicEntry>,
    ) -> Result<RegistrationDisposer> {
        let mut providers = self.providers.lock().unwrap();
        if providers.contains_key(&id) {
            return Err(DynauthError::AlreadyRegistered(id));
        }

        let relay = {
            let mut rx = provider.subscribe_sessions();
            let tx = self.session_changes.clone();
            let provider_id = id.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(change) => {
                            let _ = tx.send(ProviderSessionChange {
                                provider_id: provider_id.clone(),
                                change,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                "session change relay for {provider_id} lagged by {skipped}"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        tracing::debug!("registered authentication provider {id}");
        providers.insert(
            id.clone(),
            RegisteredProvider {
                label,
                provider,
                options,
                relay,
                dynamic,
            },
        );

        Ok(RegistrationDisposer {
            providers: Arc::clone(&self.providers),
            id,
        })
    }

    /// The label a provider was registered with.
    pub fn provider_label(&self, provider_id: &str) -> Option<String> {
        self.providers
            .lock()
            .unwrap()
            .get(provider_id)
            .map(|p| p.label.clone())
    }

    fn require_provider(&self, provider_id: &str) -> Result<Arc<dyn AuthProvider>> {
        self.providers
            .lock()
            .unwrap()
            .get(provider_id)
            .map(|p| Arc::clone(&p.provider))
            .ok_or_else(|| {
                DynauthError::NotFound(format!("authentication provider '{provider_id}'"))
            })
    }

    // -----------------------------------------------------------------------
    // Extension access
    // -----------------------------------------------------------------------

    /// Records whether `extension_id` may use sessions of `provider_id`.
    ///
    /// The decision normally comes from a UI consent prompt, which is out
    /// of scope here; embedders feed the outcome into this ledger.
    pub fn set_access_allowed(&self, extension_id: &str, provider_id: &str, allowed: bool) {
        self.access.lock().unwrap().insert(
            (extension_id.to_string(), provider_id.to_string()),
            allowed,
        );
    }

    fn is_access_allowed(&self, extension_id: &str, provider_id: &str) -> bool {
        self.access
            .lock()
            .unwrap()
            .get(&(extension_id.to_string(), provider_id.to_string()))
            .copied()
            // Absent entry: nothing was denied.
            .unwrap_or(true)
    }

    // -----------------------------------------------------------------------
    // Session calls
    // -----------------------------------------------------------------------

    /// Returns a session of `provider_id` matching `scopes` for
    /// `extension_id`, creating one when requested.
    ///
    /// Concurrent calls with the same extension, provider, sorted scopes,
    /// and option flags collapse into one provider invocation; every
    /// joined caller receives the same session or error.
    ///
    /// # Errors
    ///
    /// Returns [`DynauthError::NotFound`] for an unknown provider and
    /// [`DynauthError::PermissionDenied`] when access was denied for this
    /// extension or a silent request would need to create a session.
    pub async fn get_session(
        &self,
        extension_id: &str,
        provider_id: &str,
        scopes: &[String],
        options: GetSessionOptions,
    ) -> Result<Option<Session>> {
        // Provider readiness and access are checked before joining the
        // deduplicated request.
        let provider = self.require_provider(provider_id)?;
        if !self.is_access_allowed(extension_id, provider_id) {
            return Err(DynauthError::PermissionDenied(format!(
                "extension '{extension_id}' was denied access to provider '{provider_id}'"
            )));
        }

        let key = request_key(extension_id, provider_id, scopes, &options);
        let scopes = scopes.to_vec();
        self.singler
            .get_or_create(&key, move || resolve_session(provider, scopes, options))
            .await
    }

    /// Distinct accounts across all sessions of `provider_id`.
    pub async fn get_accounts(&self, provider_id: &str) -> Result<Vec<SessionAccount>> {
        let provider = self.require_provider(provider_id)?;
        let sessions = provider.get_sessions(None).await?;

        let mut accounts: Vec<SessionAccount> = Vec::new();
        for session in sessions {
            if !accounts.iter().any(|a| a.id == session.account.id) {
                accounts.push(session.account);
            }
        }
        Ok(accounts)
    }

    /// Removes a session on the owning provider.
    pub async fn remove_session(&self, provider_id: &str, session_id: &str) -> Result<()> {
        let provider = self.require_provider(provider_id)?;
        provider.remove_session(session_id).await
    }

    // -----------------------------------------------------------------------
    // Dynamic providers
    // -----------------------------------------------------------------------

    /// Bootstraps and registers a [`DynamicAuthProvider`] for an
    /// authorization server.
    ///
    /// When `client_id` is absent, the server metadata must carry a
    /// registration endpoint; a single dynamic registration call obtains
    /// the client id.  The provider id is derived from the authorization
    /// server and (when present) the protected resource.  One
    /// [`DynamicProviderRegistered`] notification is broadcast on success.
    ///
    /// # Returns
    ///
    /// The new provider's id.
    ///
    /// # Errors
    ///
    /// Returns [`DynauthError::Registration`] when no client id is given
    /// and the server has no registration endpoint, or when registration
    /// fails; [`DynauthError::AlreadyRegistered`] when the derived id is
    /// taken.
    pub async fn register_dynamic_provider(
        &self,
        authorization_server: &Url,
        server_metadata: AuthorizationServerMetadata,
        resource_metadata: Option<ProtectedResourceMetadata>,
        client_id: Option<String>,
        initial_tokens: Vec<TokenRecord>,
    ) -> Result<String> {
        let client_id = match client_id {
            Some(client_id) => client_id,
            None => {
                // Checked on the caller's metadata, before defaults are
                // applied: a server that did not advertise a registration
                // endpoint does not offer registration.
                let endpoint = server_metadata.registration_endpoint.clone().ok_or_else(|| {
                    DynauthError::Registration(format!(
                        "authorization server {authorization_server} has no registration endpoint"
                    ))
                })?;
                fetch_dynamic_registration(
                    &self.http,
                    &endpoint,
                    &self.config.client_name,
                    &self.config.client_uri,
                )
                .await?
                .client_id
            }
        };

        let metadata = server_metadata.with_defaults()?;
        let provider_id = dynamic_provider_id(
            authorization_server,
            resource_metadata.as_ref().map(|r| &r.resource),
        );

        let token_store = Arc::new(TokenStore::new(
            initial_tokens,
            host_label(authorization_server),
            self.persist_fn(&provider_id, &client_id)?,
        ));

        let provider = Arc::new(DynamicAuthProvider::new(
            self.http.clone(),
            DynamicProviderConfig {
                server_metadata: metadata,
                resource_metadata: resource_metadata.clone(),
                client_id: client_id.clone(),
                redirect_uri: self.config.redirect_uri.clone(),
            },
            Arc::clone(&self.delegate),
            Arc::clone(&token_store),
        )?);

        let label = provider.label().to_string();
        // The provider lives for the coordinator's lifetime; the disposer
        // is intentionally not kept.
        let _ = self.register_inner(
            provider_id.clone(),
            label.clone(),
            provider,
            ProviderOptions::default(),
            Some(DynamicEntry {
                client_id: client_id.clone(),
                token_store,
            }),
        )?;

        let _ = self.registrations.send(DynamicProviderRegistered {
            provider_id: provider_id.clone(),
            label,
            authorization_server: authorization_server.clone(),
            client_id,
        });

        Ok(provider_id)
    }

    /// Builds the fire-and-forget persistence callback for a dynamic
    /// provider's token store.
    fn persist_fn(&self, provider_id: &str, client_id: &str) -> Result<PersistFn> {
        let key = SecretKey::new(provider_id, client_id).encode()?;
        let secrets = Arc::clone(&self.secrets);
        Ok(Arc::new(move |tokens: Vec<TokenRecord>| {
            let secrets = Arc::clone(&secrets);
            let key = key.clone();
            tokio::spawn(async move {
                match serde_json::to_string(&tokens) {
                    Ok(json) => {
                        if let Err(e) = secrets.set(&key, &json).await {
                            tracing::warn!("failed to persist token set: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("failed to serialize token set: {e}"),
                }
            });
        }))
    }

    // -----------------------------------------------------------------------
    // Cross-process sync
    // -----------------------------------------------------------------------

    /// Spawns the task that routes secret-store change events to the
    /// owning dynamic provider's token store.
    ///
    /// The task holds only a weak reference; it ends when the coordinator
    /// is dropped or the change channel closes.
    pub fn start_token_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.secrets.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        let Some(coordinator) = Weak::upgrade(&weak) else {
                            break;
                        };
                        coordinator.handle_secret_change(&change.key).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("secret change feed lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Routes one secret-store change to the matching provider, if any.
    async fn handle_secret_change(&self, raw_key: &str) {
        let Some(key) = SecretKey::parse(raw_key) else {
            return;
        };

        let store = {
            let providers = self.providers.lock().unwrap();
            let Some(registered) = providers.get(&key.auth_provider_id) else {
                return;
            };
            let Some(dynamic) = &registered.dynamic else {
                return;
            };
            if dynamic.client_id != key.client_id {
                return;
            }
            Arc::clone(&dynamic.token_store)
        };

        match self.secrets.get(raw_key).await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<TokenRecord>>(&json) {
                Ok(tokens) => {
                    tracing::debug!(
                        "reconciling {} externally pushed tokens for {}",
                        tokens.len(),
                        key.auth_provider_id
                    );
                    store.reconcile(tokens);
                }
                Err(e) => tracing::warn!("ignoring malformed pushed token set: {e}"),
            },
            Ok(None) => store.reconcile(Vec::new()),
            Err(e) => tracing::warn!("failed to read pushed token set: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request resolution
// ---------------------------------------------------------------------------

/// Builds the deduplication key for a `get_session` request.
fn request_key(
    extension_id: &str,
    provider_id: &str,
    scopes: &[String],
    options: &GetSessionOptions,
) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    format!(
        "{extension_id} {provider_id} [{}] {}",
        sorted.join(" "),
        options.canonical_flags()
    )
}

/// Resolves one deduplicated `get_session` request against a provider.
async fn resolve_session(
    provider: Arc<dyn AuthProvider>,
    scopes: Vec<String>,
    options: GetSessionOptions,
) -> Result<Option<Session>> {
    let sessions = provider.get_sessions(Some(&scopes)).await?;
    if let Some(session) = sessions.into_iter().next() {
        return Ok(Some(session));
    }

    if !options.create_if_none {
        return Ok(None);
    }
    if options.silent {
        return Err(DynauthError::PermissionDenied(
            "session creation requires user interaction but the request was silent".to_string(),
        ));
    }

    let cancel = CancellationToken::new();
    let session = provider.create_session(&scopes, &cancel).await?;
    Ok(Some(session))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
