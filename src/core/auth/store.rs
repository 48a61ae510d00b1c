// Storage ports for the auth feature.
// The core defines WHAT it needs from persistence; the infra layer provides
// DashMap and SQLite implementations of these traits.

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{AuthError, Identity, PendingAuthGrant, Session};

/// Persistence for identities, keyed by the provider subject id.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, subject: &str) -> Result<Option<Identity>, AuthError>;

    /// Insert-or-replace by subject id.
    async fn upsert(&self, identity: Identity) -> Result<(), AuthError>;
}

/// Persistence for sessions.
///
/// `rotate` is the only compound operation: it must retire the old refresh
/// token, revoke its session and install the replacement as one atomic
/// per-key step, so that concurrent refreshes with the same token produce
/// exactly one winner.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> Result<(), AuthError>;

    async fn get(&self, id: Uuid) -> Result<Option<Session>, AuthError>;

    async fn find_by_refresh(&self, refresh_token: &str) -> Result<Option<Session>, AuthError>;

    /// Returns `false` when `old_refresh` was already rotated or revoked -
    /// the caller observed a lost race, not a storage fault.
    async fn rotate(&self, old_refresh: &str, replacement: Session) -> Result<bool, AuthError>;

    /// Idempotent: revoking a revoked or unknown session is not an error.
    async fn revoke(&self, id: Uuid) -> Result<(), AuthError>;
}

/// Persistence for pending auth grants.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn stage(&self, grant: PendingAuthGrant) -> Result<(), AuthError>;

    /// Single-use consumption: removes and returns the grant. `None` means
    /// absent or already consumed; expiry is checked by the caller.
    async fn consume(&self, token: &str) -> Result<Option<PendingAuthGrant>, AuthError>;
}
