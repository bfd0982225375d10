//! Dynamic OAuth 2.0 session provider
//!
//! A [`DynamicAuthProvider`] implements the session-provider contract
//! ([`AuthProvider`]) on top of a [`TokenStore`]: it answers session
//! queries, proactively refreshes tokens inside the expiry skew window,
//! runs the authorization-code + PKCE flow to create new sessions, and
//! removes sessions on request.
//!
//! UI-adjacent steps of the flow (opening the authorization URL, creating
//! the app-scoped state URI, waiting for the redirect callback, confirming
//! a fallback flow) are delegated to a [`FlowDelegate`] supplied by the
//! embedding application.
//!
//! # Flow overview
//!
//! 1. Generate a PKCE challenge and a fresh nonce.
//! 2. Ask the delegate for the opaque `state` URI keyed by the nonce.
//! 3. Build the authorization URL and hand it to the delegate to open.
//! 4. Await the redirect callback (raced against cancellation) and extract
//!    the `code` from the raw query string.
//! 5. Exchange the code at the token endpoint with the PKCE verifier.
//!
//! # References
//!
//! - RFC 7636 PKCE <https://www.rfc-editor.org/rfc/rfc7636>
//! - RFC 8707 Resource Indicators <https://www.rfc-editor.org/rfc/rfc8707>

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::{DynauthError, Result};
use crate::pkce::{self, PkceChallenge};
use crate::protocol::{AuthorizationServerMetadata, ProtectedResourceMetadata};
use crate::token_store::{
    scopes_match, Session, SessionChange, TokenChange, TokenRecord, TokenStore,
};

/// Tokens expiring within this window of "now" are treated as expired and
/// refreshed (or dropped) before session queries return.
pub const REFRESH_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Ordered list of session-creation flows, tried first to last.
const CREATION_FLOWS: &[&str] = &["url handler"];

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The session-provider contract consumed by the coordinator.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Stable provider identifier.
    fn id(&self) -> &str;

    /// Human-readable provider label.
    fn label(&self) -> &str;

    /// Returns the sessions matching `scopes` (order-insensitive), or all
    /// sessions when `scopes` is `None`.
    async fn get_sessions(&self, scopes: Option<&[String]>) -> Result<Vec<Session>>;

    /// Creates a new session for `scopes`, driving the authorization flow.
    async fn create_session(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<Session>;

    /// Removes the session with the given id.  Unknown ids are a no-op.
    async fn remove_session(&self, session_id: &str) -> Result<()>;

    /// Subscribes to session-set change events.
    fn subscribe_sessions(&self) -> broadcast::Receiver<SessionChange>;
}

/// UI-adjacent collaborators of the authorization flow.
///
/// Implemented by the embedding application; the provider never renders
/// anything itself.
#[async_trait]
pub trait FlowDelegate: Send + Sync {
    /// Creates the app-scoped opaque `state` URI for a flow nonce.  The
    /// redirect callback is later matched on this exact value.
    async fn create_state_uri(&self, nonce: &str) -> Result<String>;

    /// Opens the authorization URL (browser or equivalent).
    async fn open_external(&self, url: &Url) -> Result<()>;

    /// Waits for the authorization redirect keyed by `state_uri` and
    /// returns the callback's **raw, non-decoded** query string.
    async fn wait_for_callback(&self, state_uri: &str) -> Result<String>;

    /// Asks whether the next creation flow should be attempted after
    /// `failed_flow` failed.  Returning `false` cancels session creation.
    async fn confirm_fallback(&self, failed_flow: &str, next_flow: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// Builds the provider id for an authorization server and optional
/// protected resource: `"<server>"` or `"<server> <resource>"`.
pub fn dynamic_provider_id(authorization_server: &Url, resource: Option<&Url>) -> String {
    match resource {
        Some(resource) => format!("{authorization_server} {resource}"),
        None => authorization_server.to_string(),
    }
}

/// Host component of a URL, falling back to the full URL string.
pub fn host_label(url: &Url) -> String {
    url.host_str()
        .map(str::to_string)
        .unwrap_or_else(|| url.to_string())
}

// ---------------------------------------------------------------------------
// Token endpoint response
// ---------------------------------------------------------------------------

/// Raw JSON response from the token endpoint.
///
/// `access_token` and `token_type` are mandatory; a response missing either
/// fails deserialization and surfaces as a token exchange failure.
#[derive(Debug, serde::Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenEndpointResponse {
    /// Converts the raw response into a [`TokenRecord`], stamping
    /// `created_at` and enforcing the requested scope when the granted
    /// scope disagrees (or is absent).
    fn into_record(self, requested_scope: &str, now_ms: i64) -> TokenRecord {
        let scope = match self.scope {
            Some(granted) if granted == requested_scope => granted,
            Some(granted) => {
                tracing::debug!(
                    "granted scope '{granted}' differs from requested '{requested_scope}'; \
                     keeping the requested scope"
                );
                requested_scope.to_string()
            }
            None => requested_scope.to_string(),
        };

        TokenRecord {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            expires_in: self.expires_in,
            scope,
            created_at: now_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// DynamicAuthProvider
// ---------------------------------------------------------------------------

/// Construction parameters for a [`DynamicAuthProvider`].
#[derive(Debug, Clone)]
pub struct DynamicProviderConfig {
    /// Authorization server metadata; absent endpoints are defaulted.
    pub server_metadata: AuthorizationServerMetadata,

    /// Protected resource this provider authenticates against, if any.
    pub resource_metadata: Option<ProtectedResourceMetadata>,

    /// The client id this provider acts as.
    pub client_id: String,

    /// Redirect URI sent in authorization and code-exchange requests.
    pub redirect_uri: String,
}

/// Session provider for one dynamically registered authorization server +
/// client pair.
pub struct DynamicAuthProvider {
    id: String,
    label: String,
    http: reqwest::Client,
    authorization_endpoint: Url,
    token_endpoint: Url,
    resource: Option<Url>,
    client_id: String,
    redirect_uri: String,
    delegate: Arc<dyn FlowDelegate>,
    token_store: Arc<TokenStore>,
}

impl DynamicAuthProvider {
    /// Creates a provider over an existing token store.
    ///
    /// # Errors
    ///
    /// Returns [`DynauthError::ProtocolFormat`] when the server metadata
    /// endpoints cannot be resolved.
    pub fn new(
        http: reqwest::Client,
        config: DynamicProviderConfig,
        delegate: Arc<dyn FlowDelegate>,
        token_store: Arc<TokenStore>,
    ) -> Result<Self> {
        let metadata = config.server_metadata.with_defaults()?;
        let authorization_endpoint = metadata.authorization_endpoint.clone().ok_or_else(|| {
            DynauthError::ProtocolFormat("authorization endpoint unresolved".to_string())
        })?;
        let token_endpoint = metadata
            .token_endpoint
            .clone()
            .ok_or_else(|| DynauthError::ProtocolFormat("token endpoint unresolved".to_string()))?;

        let resource = config.resource_metadata.as_ref().map(|r| r.resource.clone());
        let id = dynamic_provider_id(&metadata.issuer, resource.as_ref());
        let label = config
            .resource_metadata
            .as_ref()
            .and_then(|r| r.resource_name.clone())
            .unwrap_or_else(|| host_label(&metadata.issuer));

        Ok(Self {
            id,
            label,
            http,
            authorization_endpoint,
            token_endpoint,
            resource,
            client_id: config.client_id,
            redirect_uri: config.redirect_uri,
            delegate,
            token_store,
        })
    }

    /// The client id this provider acts as.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The token store backing this provider.
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    // -----------------------------------------------------------------------
    // Authorization flow
    // -----------------------------------------------------------------------

    /// Builds the authorization URL for one flow attempt.
    fn build_authorization_url(
        &self,
        scope: &str,
        state: &str,
        challenge: &PkceChallenge,
    ) -> Url {
        let mut url = self.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("response_type", "code");
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("state", state);
            query.append_pair("code_challenge", &challenge.challenge);
            query.append_pair("code_challenge_method", &challenge.method);
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
            if let Some(resource) = &self.resource {
                query.append_pair("resource", resource.as_str());
            }
        }
        url
    }

    /// Runs the PKCE url-handler creation flow once.
    async fn url_handler_flow(
        &self,
        scope: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenRecord> {
        let challenge = pkce::generate();
        let nonce = Uuid::new_v4().to_string();
        let state = self.delegate.create_state_uri(&nonce).await?;

        let authorize_url = self.build_authorization_url(scope, &state, &challenge);
        self.delegate.open_external(&authorize_url).await?;

        tracing::debug!("awaiting authorization callback for provider {}", self.id);
        let raw_query = tokio::select! {
            _ = cancel.cancelled() => return Err(DynauthError::Cancelled),
            callback = self.delegate.wait_for_callback(&state) => callback?,
        };

        let code = extract_code_from_query(&raw_query).ok_or_else(|| {
            DynauthError::ProtocolFormat(
                "authorization callback carried no code parameter".to_string(),
            )
        })?;

        self.exchange_authorization_code(&code, &challenge.verifier, scope)
            .await
    }

    /// Exchanges an authorization code for a token record.
    async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        scope: &str,
    ) -> Result<TokenRecord> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.post_token_request(&params, scope).await
    }

    /// Exchanges a refresh token for a replacement token record.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        scope: &str,
    ) -> Result<TokenRecord> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.post_token_request(&params, scope).await
    }

    /// POSTs a form-encoded token request and converts the response.
    async fn post_token_request(
        &self,
        params: &[(&str, &str)],
        scope: &str,
    ) -> Result<TokenRecord> {
        let resp = self
            .http
            .post(self.token_endpoint.clone())
            .form(params)
            .send()
            .await
            .map_err(|e| {
                DynauthError::TokenExchange(format!("token endpoint request failed: {e}"))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DynauthError::TokenExchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let raw: TokenEndpointResponse = resp
            .json()
            .await
            .map_err(|e| DynauthError::TokenExchange(format!("malformed token response: {e}")))?;

        Ok(raw.into_record(scope, now_ms()))
    }
}

#[async_trait]
impl AuthProvider for DynamicAuthProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn get_sessions(&self, scopes: Option<&[String]>) -> Result<Vec<Session>> {
        let Some(requested) = scopes else {
            return Ok(self.token_store.sessions());
        };

        let now = now_ms();
        let expiring: Vec<TokenRecord> = self
            .token_store
            .tokens()
            .into_iter()
            .filter(|token| scopes_match(&token.scopes(), requested))
            .filter(|token| token.expires_within(now, REFRESH_WINDOW_MS))
            .collect();

        // Refreshes run sequentially so each store mutation and its
        // persistence write land before the next refresh begins.
        for token in expiring {
            self.token_store.update(&TokenChange {
                added: vec![],
                removed: vec![token.clone()],
            });

            let Some(refresh_token) = token.refresh_token.as_deref() else {
                tracing::debug!(
                    "dropping expired token without refresh token for provider {}",
                    self.id
                );
                continue;
            };

            match self.exchange_refresh_token(refresh_token, &token.scope).await {
                Ok(refreshed) => self.token_store.update(&TokenChange {
                    added: vec![refreshed],
                    removed: vec![],
                }),
                // Recovered locally: the token stays dropped and the
                // session disappears from the result.
                Err(e) => tracing::warn!("token refresh failed for provider {}: {e}", self.id),
            }
        }

        Ok(self
            .token_store
            .sessions()
            .into_iter()
            .filter(|session| session.matches_scopes(requested))
            .collect())
    }

    async fn create_session(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let scope = scopes.join(" ");

        for (index, flow) in CREATION_FLOWS.iter().enumerate() {
            let attempt = match *flow {
                "url handler" => self.url_handler_flow(&scope, cancel).await,
                other => Err(DynauthError::NotFound(format!(
                    "unknown session creation flow '{other}'"
                ))),
            };

            let err = match attempt {
                Ok(token) => {
                    self.token_store.update(&TokenChange {
                        added: vec![token.clone()],
                        removed: vec![],
                    });
                    return self
                        .token_store
                        .sessions()
                        .into_iter()
                        .find(|s| s.access_token == token.access_token)
                        .ok_or_else(|| {
                            DynauthError::NotFound(
                                "session for newly created token".to_string(),
                            )
                        });
                }
                Err(e) => e,
            };

            if err == DynauthError::Cancelled {
                return Err(err);
            }

            match CREATION_FLOWS.get(index + 1) {
                Some(next) => {
                    if !self.delegate.confirm_fallback(flow, next).await {
                        return Err(DynauthError::Cancelled);
                    }
                    tracing::debug!("flow '{flow}' failed ({err}); falling back to '{next}'");
                }
                None => return Err(err),
            }
        }

        Err(DynauthError::NotFound(
            "no session creation flow available".to_string(),
        ))
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        let Some(session) = self
            .token_store
            .sessions()
            .into_iter()
            .find(|s| s.id == session_id)
        else {
            tracing::warn!("remove_session: unknown session {session_id} on {}", self.id);
            return Ok(());
        };

        let Some(token) = self
            .token_store
            .tokens()
            .into_iter()
            .find(|t| t.access_token == session.access_token)
        else {
            tracing::warn!(
                "remove_session: no token backs session {session_id} on {}",
                self.id
            );
            return Ok(());
        };

        self.token_store.update(&TokenChange {
            added: vec![],
            removed: vec![token],
        });
        Ok(())
    }

    fn subscribe_sessions(&self) -> broadcast::Receiver<SessionChange> {
        self.token_store.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Utility functions
// ---------------------------------------------------------------------------

/// Extracts the `code` parameter from a **raw** callback query string.
///
/// The value is deliberately not percent-decoded: the code is forwarded to
/// the token endpoint byte-for-byte as the authorization server sent it, so
/// codes containing `+` or `%`-escapes survive unchanged.  A generic
/// URL-decoding query parser must not be substituted here.
pub(crate) fn extract_code_from_query(raw_query: &str) -> Option<String> {
    raw_query
        .split('&')
        .find_map(|pair| pair.strip_prefix("code="))
        .map(str::to_string)
}

/// Current instant in epoch milliseconds.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_store::PersistFn;

    struct StubDelegate;

    #[async_trait]
    impl FlowDelegate for StubDelegate {
        async fn create_state_uri(&self, nonce: &str) -> Result<String> {
            Ok(format!("app://auth/callback?nonce={nonce}"))
        }

        async fn open_external(&self, _url: &Url) -> Result<()> {
            Ok(())
        }

        async fn wait_for_callback(&self, _state_uri: &str) -> Result<String> {
            Err(DynauthError::Cancelled)
        }

        async fn confirm_fallback(&self, _failed_flow: &str, _next_flow: &str) -> bool {
            false
        }
    }

    fn make_provider() -> DynamicAuthProvider {
        let persist: PersistFn = Arc::new(|_| {});
        let store = Arc::new(TokenStore::new(
            Vec::new(),
            "auth.example.com".to_string(),
            persist,
        ));
        let metadata = AuthorizationServerMetadata {
            issuer: Url::parse("https://auth.example.com").unwrap(),
            authorization_endpoint: None,
            token_endpoint: None,
            registration_endpoint: None,
            response_types_supported: None,
        };
        DynamicAuthProvider::new(
            reqwest::Client::new(),
            DynamicProviderConfig {
                server_metadata: metadata,
                resource_metadata: Some(ProtectedResourceMetadata {
                    resource: Url::parse("https://api.example.com/").unwrap(),
                    resource_name: Some("Example API".to_string()),
                }),
                client_id: "client-1".to_string(),
                redirect_uri: "http://127.0.0.1:33418/".to_string(),
            },
            Arc::new(StubDelegate),
            store,
        )
        .expect("provider construction")
    }

    // -----------------------------------------------------------------------
    // extract_code_from_query
    // -----------------------------------------------------------------------

    #[test]
    fn test_extract_code_basic() {
        assert_eq!(
            extract_code_from_query("code=abc123&state=xyz"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_code_from_query("state=xyz&code=abc123"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn test_extract_code_preserves_raw_escapes() {
        // Percent-escapes and '+' must survive byte-for-byte.
        assert_eq!(
            extract_code_from_query("code=a%2Bb%2Fc&state=s"),
            Some("a%2Bb%2Fc".to_string())
        );
        assert_eq!(
            extract_code_from_query("code=a+b&state=s"),
            Some("a+b".to_string())
        );
    }

    #[test]
    fn test_extract_code_absent_returns_none() {
        assert!(extract_code_from_query("state=xyz").is_none());
        assert!(extract_code_from_query("").is_none());
        // 'encoded' key must not match a strict 'code=' prefix.
        assert!(extract_code_from_query("decode=1&state=s").is_none());
    }

    // -----------------------------------------------------------------------
    // Provider identity
    // -----------------------------------------------------------------------

    #[test]
    fn test_dynamic_provider_id_composition() {
        let server = Url::parse("https://auth.example.com/").unwrap();
        let resource = Url::parse("https://api.example.com/").unwrap();

        assert_eq!(dynamic_provider_id(&server, None), "https://auth.example.com/");
        assert_eq!(
            dynamic_provider_id(&server, Some(&resource)),
            "https://auth.example.com/ https://api.example.com/"
        );
    }

    #[test]
    fn test_provider_uses_resource_name_as_label() {
        let provider = make_provider();
        assert_eq!(provider.label(), "Example API");
        assert_eq!(
            provider.id(),
            "https://auth.example.com/ https://api.example.com/"
        );
    }

    #[test]
    fn test_host_label_falls_back_to_full_url() {
        let url = Url::parse("https://auth.example.com/path").unwrap();
        assert_eq!(host_label(&url), "auth.example.com");
    }

    // -----------------------------------------------------------------------
    // build_authorization_url
    // -----------------------------------------------------------------------

    #[test]
    fn test_authorization_url_contains_required_params() {
        let provider = make_provider();
        let challenge = pkce::generate();
        let url = provider.build_authorization_url("openid profile", "app://state", &challenge);

        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let get = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("client_id"), Some("client-1".to_string()));
        assert_eq!(get("response_type"), Some("code".to_string()));
        assert_eq!(
            get("redirect_uri"),
            Some("http://127.0.0.1:33418/".to_string())
        );
        assert_eq!(get("state"), Some("app://state".to_string()));
        assert_eq!(get("code_challenge"), Some(challenge.challenge.clone()));
        assert_eq!(get("code_challenge_method"), Some("S256".to_string()));
        assert_eq!(get("scope"), Some("openid profile".to_string()));
        assert_eq!(get("resource"), Some("https://api.example.com/".to_string()));
    }

    #[test]
    fn test_authorization_url_omits_empty_scope() {
        let provider = make_provider();
        let challenge = pkce::generate();
        let url = provider.build_authorization_url("", "state", &challenge);
        assert!(
            !url.query().unwrap_or("").contains("scope="),
            "empty scope must be omitted: {url}"
        );
    }

    #[test]
    fn test_default_endpoints_resolved_from_issuer() {
        let provider = make_provider();
        assert_eq!(
            provider.authorization_endpoint.as_str(),
            "https://auth.example.com/authorize"
        );
        assert_eq!(
            provider.token_endpoint.as_str(),
            "https://auth.example.com/token"
        );
    }

    // -----------------------------------------------------------------------
    // TokenEndpointResponse::into_record
    // -----------------------------------------------------------------------

    #[test]
    fn test_into_record_enforces_requested_scope() {
        let raw = TokenEndpointResponse {
            access_token: "tok".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            refresh_token: None,
            id_token: None,
            scope: Some("something else".to_string()),
        };
        let record = raw.into_record("openid profile", 1_000);
        assert_eq!(record.scope, "openid profile");
        assert_eq!(record.created_at, 1_000);
    }

    #[test]
    fn test_into_record_keeps_matching_scope_and_fills_missing() {
        let matching = TokenEndpointResponse {
            access_token: "tok".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: None,
            refresh_token: Some("r".to_string()),
            id_token: None,
            scope: Some("openid".to_string()),
        };
        assert_eq!(matching.into_record("openid", 5).scope, "openid");

        let missing = TokenEndpointResponse {
            access_token: "tok".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: None,
            refresh_token: None,
            id_token: None,
            scope: None,
        };
        assert_eq!(missing.into_record("openid", 5).scope, "openid");
    }

    // -----------------------------------------------------------------------
    // remove_session no-op paths
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_remove_session_unknown_id_is_a_no_op() {
        let provider = make_provider();
        provider
            .remove_session("definitely-not-a-session")
            .await
            .expect("unknown session id must not error");
    }
}
