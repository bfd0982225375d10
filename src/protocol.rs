//! Stateless OAuth 2.0 protocol utilities
//!
//! This module holds the protocol-level helpers the rest of the crate builds
//! on: authorization server / protected resource metadata with well-known
//! defaults, `WWW-Authenticate` challenge parsing, JWT claim extraction, and
//! Dynamic Client Registration (RFC 7591).
//!
//! All functions here are stateless; HTTP calls go through a shared
//! [`reqwest::Client`] supplied by the caller.
//!
//! # References
//!
//! - RFC 7591 Dynamic Client Registration <https://www.rfc-editor.org/rfc/rfc7591>
//! - RFC 8414 Authorization Server Metadata <https://www.rfc-editor.org/rfc/rfc8414>
//! - RFC 9728 Protected Resource Metadata <https://www.rfc-editor.org/rfc/rfc9728>

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{DynauthError, Result};

/// Default local callback port included in the registered redirect URIs.
pub const DEFAULT_CALLBACK_PORT: u16 = 33418;

// ---------------------------------------------------------------------------
// Authorization Server Metadata (RFC 8414)
// ---------------------------------------------------------------------------

/// Metadata document describing an OAuth 2.0 authorization server.
///
/// Only `issuer` is mandatory.  The endpoint fields default to well-known
/// paths resolved against the issuer when absent; call
/// [`with_defaults`](Self::with_defaults) to obtain a fully resolved
/// document.  Explicitly provided values are always preserved.
///
/// # Examples
///
/// ```
/// use dynauth::protocol::AuthorizationServerMetadata;
///
/// let json = r#"{
///     "issuer": "https://auth.example.com",
///     "token_endpoint": "https://auth.example.com/oauth2/token"
/// }"#;
///
/// let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
/// let meta = meta.with_defaults().unwrap();
///
/// // Explicit value preserved, absent value defaulted.
/// assert_eq!(
///     meta.token_endpoint.unwrap().as_str(),
///     "https://auth.example.com/oauth2/token"
/// );
/// assert_eq!(
///     meta.authorization_endpoint.unwrap().as_str(),
///     "https://auth.example.com/authorize"
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// The issuer identifier URI for this authorization server.
    pub issuer: Url,

    /// The URL of the authorization endpoint (RFC 6749 section 3.1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<Url>,

    /// The URL of the token endpoint (RFC 6749 section 3.2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<Url>,

    /// Optional URL of the Dynamic Client Registration endpoint (RFC 7591).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<Url>,

    /// List of `response_type` values the server supports (e.g. `["code"]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_types_supported: Option<Vec<String>>,
}

impl AuthorizationServerMetadata {
    /// Builds the default metadata document for a bare issuer URL.
    ///
    /// All endpoints are resolved to their well-known paths off the issuer:
    /// `/authorize`, `/token`, and `/register`.
    pub fn for_issuer(issuer: Url) -> Result<Self> {
        Self {
            issuer,
            authorization_endpoint: None,
            token_endpoint: None,
            registration_endpoint: None,
            response_types_supported: None,
        }
        .with_defaults()
    }

    /// Fills absent fields with their well-known defaults.
    ///
    /// `authorization_endpoint`, `token_endpoint`, and
    /// `registration_endpoint` default to `/authorize`, `/token`, and
    /// `/register` resolved against the issuer; `response_types_supported`
    /// defaults to `["code"]`.  Explicit values are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`DynauthError::ProtocolFormat`] if a default path cannot be
    /// resolved against the issuer URL.
    pub fn with_defaults(mut self) -> Result<Self> {
        if self.authorization_endpoint.is_none() {
            self.authorization_endpoint = Some(join_issuer(&self.issuer, "/authorize")?);
        }
        if self.token_endpoint.is_none() {
            self.token_endpoint = Some(join_issuer(&self.issuer, "/token")?);
        }
        if self.registration_endpoint.is_none() {
            self.registration_endpoint = Some(join_issuer(&self.issuer, "/register")?);
        }
        if self.response_types_supported.is_none() {
            self.response_types_supported = Some(vec!["code".to_string()]);
        }
        Ok(self)
    }
}

/// Resolves a well-known path against the issuer URL.
fn join_issuer(issuer: &Url, path: &str) -> Result<Url> {
    issuer.join(path).map_err(|e| {
        DynauthError::ProtocolFormat(format!("cannot resolve {path} against issuer {issuer}: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Protected Resource Metadata (RFC 9728)
// ---------------------------------------------------------------------------

/// Metadata document describing a protected OAuth 2.0 resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The URI of the protected resource itself.
    pub resource: Url,

    /// Human-readable name for the resource, if advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Client registration (RFC 7591)
// ---------------------------------------------------------------------------

/// Response document from a Dynamic Client Registration request.
///
/// `client_id` is the only mandatory field; a response without it fails
/// deserialization and surfaces as a registration failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// The client identifier issued by the authorization server.
    pub client_id: String,

    /// Human-readable client name echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// URI of the client's homepage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,

    /// Grant types registered for this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<String>>,

    /// Redirect URIs registered for this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<Vec<String>>,

    /// Token endpoint authentication method (`"none"` for public clients).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
}

/// Returns the fixed redirect URI set sent during client registration.
///
/// Contains the bare loopback hosts and both suffixed with the default
/// callback port, so the server accepts the callback regardless of which
/// loopback form the local handler ends up using.
pub fn default_redirect_uris() -> Vec<String> {
    vec![
        "http://localhost/".to_string(),
        "http://127.0.0.1/".to_string(),
        format!("http://localhost:{DEFAULT_CALLBACK_PORT}/"),
        format!("http://127.0.0.1:{DEFAULT_CALLBACK_PORT}/"),
    ]
}

/// Performs Dynamic Client Registration (RFC 7591).
///
/// POSTs the client metadata as JSON to `registration_endpoint` and returns
/// the parsed registration document.
///
/// # Arguments
///
/// * `http` - Shared [`reqwest::Client`].
/// * `registration_endpoint` - The server's registration endpoint URL.
/// * `client_name` - Human-readable name sent as `client_name`.
/// * `client_uri` - Homepage URI sent as `client_uri`.
///
/// # Errors
///
/// Returns [`DynauthError::Registration`] when the request fails, the
/// response status is not OK (the message carries the status and body text),
/// or the response body lacks a `client_id`.
pub async fn fetch_dynamic_registration(
    http: &reqwest::Client,
    registration_endpoint: &Url,
    client_name: &str,
    client_uri: &str,
) -> Result<ClientRegistration> {
    tracing::debug!("registering OAuth client at {registration_endpoint}");

    let body = serde_json::json!({
        "client_name": client_name,
        "client_uri": client_uri,
        "grant_types": [
            "authorization_code",
            "refresh_token",
            "urn:ietf:params:oauth:grant-type:device_code",
        ],
        "response_types": ["code"],
        "redirect_uris": default_redirect_uris(),
        "token_endpoint_auth_method": "none",
    });

    let resp = http
        .post(registration_endpoint.clone())
        .json(&body)
        .send()
        .await
        .map_err(|e| DynauthError::Registration(format!("registration request failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(DynauthError::Registration(format!(
            "registration endpoint returned {status}: {text}"
        )));
    }

    let registration: ClientRegistration = resp.json().await.map_err(|e| {
        DynauthError::Registration(format!("failed to parse registration response: {e}"))
    })?;

    tracing::info!("registered OAuth client {}", registration.client_id);
    Ok(registration)
}

// ---------------------------------------------------------------------------
// WWW-Authenticate parsing
// ---------------------------------------------------------------------------

/// A parsed `WWW-Authenticate` challenge header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WwwAuthenticate {
    /// The authentication scheme (e.g. `"Bearer"`).
    pub scheme: String,

    /// Challenge attributes with surrounding quotes stripped from values.
    pub params: HashMap<String, String>,
}

impl WwwAuthenticate {
    /// Returns the `scope` attribute of an `insufficient_scope` challenge,
    /// if present.
    pub fn bearer_challenge_scope(&self) -> Option<&str> {
        self.params.get("scope").map(String::as_str)
    }
}

/// Parses a `WWW-Authenticate` header value.
///
/// The first whitespace-delimited token is the scheme; the remainder is
/// split on commas, each `key=value` pair (value quotes stripped) becoming
/// an entry in `params`.  A header with no attribute part yields the whole
/// value as the scheme and an empty parameter map.
///
/// # Examples
///
/// ```
/// use dynauth::protocol::parse_www_authenticate;
///
/// let challenge = parse_www_authenticate(r#"Bearer realm="api", error="invalid_token""#);
/// assert_eq!(challenge.scheme, "Bearer");
/// assert_eq!(challenge.params["realm"], "api");
/// assert_eq!(challenge.params["error"], "invalid_token");
///
/// let bare = parse_www_authenticate("Bearer");
/// assert_eq!(bare.scheme, "Bearer");
/// assert!(bare.params.is_empty());
/// ```
pub fn parse_www_authenticate(value: &str) -> WwwAuthenticate {
    let Some((scheme, rest)) = value.split_once(char::is_whitespace) else {
        return WwwAuthenticate {
            scheme: value.to_string(),
            params: HashMap::new(),
        };
    };

    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, raw)) = part.split_once('=') {
            let key = key.trim().to_string();
            let val = raw.trim().trim_matches('"').to_string();
            if !key.is_empty() {
                params.insert(key, val);
            }
        }
    }

    WwwAuthenticate {
        scheme: scheme.to_string(),
        params,
    }
}

// ---------------------------------------------------------------------------
// JWT claims
// ---------------------------------------------------------------------------

/// Extracts the claims object from a JWT without verifying its signature.
///
/// The token must consist of exactly three dot-separated segments.  The
/// header and payload segments are base64url-decoded and JSON-parsed; both
/// must be JSON objects.  The payload object is returned.
///
/// No signature validation is performed; the claims are used only to derive
/// display metadata for the account that owns a token.
///
/// # Errors
///
/// Returns [`DynauthError::ProtocolFormat`] when the segment count is wrong
/// or a segment decodes to non-object JSON, and
/// [`DynauthError::ProtocolParse`] (carrying the upstream message) when
/// base64 decoding or JSON parsing fails.
///
/// # Examples
///
/// ```
/// use dynauth::protocol::get_claims_from_jwt;
///
/// // {"alg":"none"} . {"sub":"user-1"} . (unsigned)
/// let jwt = "eyJhbGciOiJub25lIn0.eyJzdWIiOiJ1c2VyLTEifQ.sig";
/// let claims = get_claims_from_jwt(jwt).unwrap();
/// assert_eq!(claims["sub"], "user-1");
///
/// assert!(get_claims_from_jwt("only.two").is_err());
/// ```
pub fn get_claims_from_jwt(token: &str) -> Result<Map<String, Value>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(DynauthError::ProtocolFormat(format!(
            "expected 3 JWT segments, found {}",
            parts.len()
        )));
    }

    // The header must decode to an object too, even though only the payload
    // is returned.
    decode_jwt_object(parts[0], "header")?;
    decode_jwt_object(parts[1], "payload")
}

/// Decodes one base64url JWT segment into a JSON object.
fn decode_jwt_object(segment: &str, which: &str) -> Result<Map<String, Value>> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| {
            DynauthError::ProtocolParse(format!("failed to decode JWT {which}: {e}"))
        })?;

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| DynauthError::ProtocolParse(format!("failed to parse JWT {which}: {e}")))?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(DynauthError::ProtocolFormat(format!(
            "JWT {which} is not a JSON object (found {})",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
