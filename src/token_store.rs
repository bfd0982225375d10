//! Reactive token set with derived sessions
//!
//! A [`TokenStore`] holds the current set of tokens for one provider+client
//! pair and derives the caller-visible [`Session`] list from it.  Sessions
//! are a pure projection of token records and are never mutated
//! independently: every mutation goes through [`TokenStore::update`] (or
//! [`TokenStore::reconcile`] for externally pushed arrays), which diffs the
//! old and new session sets by access token and broadcasts one change event
//! when they differ.
//!
//! Persistence is best-effort: `update` hands the new full token array to an
//! injected callback without awaiting completion, so a crash between the
//! mutation and the write can lose it.  External reconciliation on the next
//! read is the recovery path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::protocol::get_claims_from_jwt;

// ---------------------------------------------------------------------------
// TokenRecord
// ---------------------------------------------------------------------------

/// A stored OAuth token as issued by the token endpoint.
///
/// `access_token` is the unique key within a provider+client token set.
/// `created_at` (epoch milliseconds) is stamped whenever a token is created
/// or replaced by a refresh, never otherwise; together with `expires_in`
/// seconds it determines the expiry instant without a server round-trip.
///
/// # Examples
///
/// ```
/// use dynauth::token_store::TokenRecord;
///
/// let token = TokenRecord {
///     access_token: "tok".to_string(),
///     token_type: "Bearer".to_string(),
///     refresh_token: None,
///     id_token: None,
///     expires_in: Some(3600),
///     scope: "openid profile".to_string(),
///     created_at: 1_700_000_000_000,
/// };
///
/// assert_eq!(token.scopes(), vec!["openid", "profile"]);
/// assert_eq!(token.expires_at(), Some(1_700_003_600_000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// The access token string issued by the authorization server.
    pub access_token: String,

    /// The token type, typically `"Bearer"`.
    pub token_type: String,

    /// Refresh token for obtaining a replacement without re-authorizing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// OpenID Connect identity token, when issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Lifetime in seconds from `created_at`.  `None` means non-expiring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Space-joined scope string as requested at issuance.
    #[serde(default)]
    pub scope: String,

    /// Issuance instant in epoch milliseconds.
    pub created_at: i64,
}

impl TokenRecord {
    /// Splits the stored scope string into its ordered scope sequence.
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }

    /// The absolute expiry instant in epoch milliseconds, when known.
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_in
            .map(|secs| self.created_at + (secs as i64) * 1000)
    }

    /// Returns `true` when the token is expired, or will be within
    /// `window_ms` of `now_ms`.  Tokens without an expiry never match.
    pub fn expires_within(&self, now_ms: i64, window_ms: i64) -> bool {
        match self.expires_at() {
            Some(at) => now_ms >= at - window_ms,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The account a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAccount {
    /// Stable account identifier.
    pub id: String,

    /// Human-readable account label.
    pub label: String,
}

/// The caller-visible authenticated credential derived from a
/// [`TokenRecord`].
///
/// The id is a stable hash of the access token, so the same token always
/// yields the same session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Stable session identifier (hex SHA-256 of the access token).
    pub id: String,

    /// The access token backing this session.
    pub access_token: String,

    /// The owning account.
    pub account: SessionAccount,

    /// Ordered scope sequence from the token's scope string.
    pub scopes: Vec<String>,

    /// OpenID Connect identity token, when the backing token carries one.
    pub id_token: Option<String>,
}

impl Session {
    /// Order-insensitive scope-set equality against `scopes`.
    pub fn matches_scopes(&self, scopes: &[String]) -> bool {
        scopes_match(&self.scopes, scopes)
    }
}

/// Compares two scope sequences as sets (sorted-array equality).
///
/// Stored scope strings keep their original order; only comparisons are
/// order-insensitive.
pub fn scopes_match(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left = a.to_vec();
    let mut right = b.to_vec();
    left.sort();
    right.sort();
    left == right
}

/// Derives the stable session id for an access token.
pub fn session_id_for(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Projects a token record into a session.
///
/// Account identity is taken from JWT claims of the id token (preferred) or
/// the access token: label from `preferred_username`, `email`, or `sub`;
/// id from `sub`.  Opaque tokens fall back to `fallback_label` for both.
fn derive_session(token: &TokenRecord, fallback_label: &str) -> Session {
    let claims = token
        .id_token
        .as_deref()
        .and_then(|jwt| get_claims_from_jwt(jwt).ok())
        .or_else(|| get_claims_from_jwt(&token.access_token).ok());

    let account = match claims {
        Some(claims) => {
            let label = ["preferred_username", "email", "sub"]
                .iter()
                .find_map(|key| claims.get(*key).and_then(|v| v.as_str()))
                .unwrap_or(fallback_label)
                .to_string();
            let id = claims
                .get("sub")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| label.clone());
            SessionAccount { id, label }
        }
        None => SessionAccount {
            id: fallback_label.to_string(),
            label: fallback_label.to_string(),
        },
    };

    Session {
        id: session_id_for(&token.access_token),
        access_token: token.access_token.clone(),
        account,
        scopes: token.scopes(),
        id_token: token.id_token.clone(),
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// A batch of tokens to apply through [`TokenStore::update`].
#[derive(Debug, Clone, Default)]
pub struct TokenChange {
    /// Records to upsert: replaced in place when the access token is
    /// already present, appended otherwise.
    pub added: Vec<TokenRecord>,

    /// Records to remove, matched by access token.
    pub removed: Vec<TokenRecord>,
}

/// Session-set difference broadcast after a mutation.
///
/// At least one of `added`/`removed` is non-empty.
#[derive(Debug, Clone)]
pub struct SessionChange {
    /// Sessions present after the mutation but not before.
    pub added: Vec<Session>,

    /// Sessions present before the mutation but not after.
    pub removed: Vec<Session>,
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// Callback invoked with the full token array after every persisting
/// mutation.  Not awaited; implementations that perform I/O spawn it.
pub type PersistFn = Arc<dyn Fn(Vec<TokenRecord>) + Send + Sync>;

struct StoreState {
    tokens: Vec<TokenRecord>,
    sessions: Vec<Session>,
}

/// Reactive token set for one provider+client pair.
///
/// Invariants:
/// - exactly one [`Session`] per [`TokenRecord`], matched by access token;
/// - the session list always equals the projection of the token list;
/// - sessions are recomputed only when the token identity set (the set of
///   access tokens) changes.
pub struct TokenStore {
    state: Mutex<StoreState>,
    persist: PersistFn,
    fallback_label: String,
    changes: broadcast::Sender<SessionChange>,
}

impl TokenStore {
    /// Creates a store seeded with `initial` tokens.
    ///
    /// Seeding fires no change event and does not persist.
    ///
    /// # Arguments
    ///
    /// * `initial` - Token records loaded from persistence, if any.
    /// * `fallback_label` - Account label used for tokens without readable
    ///   JWT claims (typically the authorization server host).
    /// * `persist` - Callback receiving the full token array after each
    ///   persisting mutation.
    pub fn new(initial: Vec<TokenRecord>, fallback_label: String, persist: PersistFn) -> Self {
        let sessions = initial
            .iter()
            .map(|t| derive_session(t, &fallback_label))
            .collect();
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(StoreState {
                tokens: initial,
                sessions,
            }),
            persist,
            fallback_label,
            changes,
        }
    }

    /// Snapshot of the current token records.
    pub fn tokens(&self) -> Vec<TokenRecord> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Snapshot of the current derived sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.state.lock().unwrap().sessions.clone()
    }

    /// Subscribes to session-set change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    /// Applies a batch of removals and upserts.  The sole mutator.
    ///
    /// Removals are applied first (matched by access token), then each
    /// added record replaces an existing record with the same access token
    /// or is appended.  When anything changed, the new full token array is
    /// handed to the persist callback (fire-and-forget; see the module
    /// docs) and the session projection is refreshed.
    pub fn update(&self, change: &TokenChange) {
        self.mutate(
            |tokens| {
                let mut next = tokens.to_vec();
                for removed in &change.removed {
                    next.retain(|t| t.access_token != removed.access_token);
                }
                for added in &change.added {
                    match next
                        .iter_mut()
                        .find(|t| t.access_token == added.access_token)
                    {
                        Some(slot) => *slot = added.clone(),
                        None => next.push(added.clone()),
                    }
                }
                next
            },
            true,
        );
    }

    /// Replaces the token array with one pushed from another process.
    ///
    /// Follows the same diff/notify path as [`update`](Self::update) but
    /// does not re-persist: the pushed array is already the persisted
    /// state.
    pub fn reconcile(&self, tokens: Vec<TokenRecord>) {
        self.mutate(|_| tokens, false);
    }

    fn mutate(&self, next: impl FnOnce(&[TokenRecord]) -> Vec<TokenRecord>, persist: bool) {
        let mut state = self.state.lock().unwrap();
        let next_tokens = next(&state.tokens);
        if next_tokens == state.tokens {
            return;
        }

        let old_ids: HashSet<String> = state
            .tokens
            .iter()
            .map(|t| t.access_token.clone())
            .collect();
        let new_ids: HashSet<String> = next_tokens
            .iter()
            .map(|t| t.access_token.clone())
            .collect();

        state.tokens = next_tokens;

        // Sessions are memoized on the token identity set: replacing a
        // record under an unchanged access token leaves them as-is.
        if old_ids != new_ids {
            let new_sessions: Vec<Session> = state
                .tokens
                .iter()
                .map(|t| derive_session(t, &self.fallback_label))
                .collect();
            let old_sessions = std::mem::replace(&mut state.sessions, new_sessions);

            let added: Vec<Session> = state
                .sessions
                .iter()
                .filter(|s| !old_ids.contains(s.access_token.as_str()))
                .cloned()
                .collect();
            let removed: Vec<Session> = old_sessions
                .into_iter()
                .filter(|s| !new_ids.contains(s.access_token.as_str()))
                .collect();

            if !added.is_empty() || !removed.is_empty() {
                let _ = self.changes.send(SessionChange { added, removed });
            }
        }

        if persist {
            (self.persist)(state.tokens.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
