//! Dynauth - dynamic OAuth 2.0 authentication library
//!
//! This library implements a dynamic OAuth 2.0 authentication subsystem:
//! stateless protocol utilities, a reactive token store deriving
//! authenticated sessions, a provider driving the authorization-code +
//! PKCE flow with proactive refresh, a single-flight request deduplicator,
//! and a coordinator that registers providers and routes caller requests.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `protocol`: metadata defaults, `WWW-Authenticate` parsing, JWT claim
//!   extraction, dynamic client registration (RFC 7591)
//! - `pkce`: PKCE S256 challenge generation (RFC 7636)
//! - `secrets`: secret storage contract, keyring and in-memory stores
//! - `token_store`: token set with derived sessions and change diffs
//! - `singler`: single-flight collapsing of identical async requests
//! - `provider`: the dynamic session provider and its flow delegate seam
//! - `coordinator`: provider registry, deduplicated session calls,
//!   dynamic provider bootstrap, cross-process token sync
//! - `error`: error types and result alias
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dynauth::coordinator::{AuthenticationCoordinator, DynauthConfig, GetSessionOptions};
//! use dynauth::protocol::AuthorizationServerMetadata;
//! use dynauth::provider::FlowDelegate;
//! use dynauth::secrets::KeyringSecretStore;
//! use dynauth::Result;
//! use url::Url;
//!
//! # async fn example(delegate: Arc<dyn FlowDelegate>) -> Result<()> {
//! let coordinator = AuthenticationCoordinator::new(
//!     reqwest::Client::new(),
//!     DynauthConfig::default(),
//!     Arc::new(KeyringSecretStore::new("my-app")),
//!     delegate,
//! );
//! coordinator.start_token_sync();
//!
//! let server = Url::parse("https://auth.example.com").unwrap();
//! let metadata = AuthorizationServerMetadata::for_issuer(server.clone())?;
//! let provider_id = coordinator
//!     .register_dynamic_provider(&server, metadata, None, None, Vec::new())
//!     .await?;
//!
//! let session = coordinator
//!     .get_session(
//!         "my-extension",
//!         &provider_id,
//!         &["openid".to_string()],
//!         GetSessionOptions { create_if_none: true, ..Default::default() },
//!     )
//!     .await?;
//! println!("session: {:?}", session.map(|s| s.id));
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod pkce;
pub mod protocol;
pub mod provider;
pub mod secrets;
pub mod singler;
pub mod token_store;

// Re-export commonly used types
pub use coordinator::{AuthenticationCoordinator, DynauthConfig, GetSessionOptions};
pub use error::{DynauthError, Result};
pub use provider::{AuthProvider, DynamicAuthProvider, FlowDelegate};
pub use token_store::{Session, SessionChange, TokenRecord, TokenStore};
