// In-memory implementations of the auth storage ports, backed by DashMap.
// Used by tests and ephemeral deployments; the SQLite stores implement the
// same traits for durable setups.
//
// The single-use and rotation guarantees ride on DashMap's per-key atomicity:
// `remove` returns the value to exactly one of any number of concurrent
// callers, which is all the CAS these paths need.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::core::auth::{
    AuthError, GrantStore, Identity, IdentityStore, PendingAuthGrant, Session, SessionStore,
};

/// Clones share the underlying map, mirroring how the SQLite stores share a
/// pool - one logical store can back several services.
#[derive(Default, Clone)]
pub struct InMemoryIdentityStore {
    identities: Arc<DashMap<String, Identity>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get(&self, subject: &str) -> Result<Option<Identity>, AuthError> {
        Ok(self.identities.get(subject).map(|e| e.clone()))
    }

    async fn upsert(&self, identity: Identity) -> Result<(), AuthError> {
        self.identities.insert(identity.subject.clone(), identity);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<Uuid, Session>>,
    /// refresh token -> session id. Removal from this index is the rotation
    /// CAS point.
    by_refresh: Arc<DashMap<String, Uuid>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), AuthError> {
        self.by_refresh
            .insert(session.refresh_token.clone(), session.id);
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, AuthError> {
        Ok(self.sessions.get(&id).map(|e| e.clone()))
    }

    async fn find_by_refresh(&self, refresh_token: &str) -> Result<Option<Session>, AuthError> {
        Ok(self
            .by_refresh
            .get(refresh_token)
            .and_then(|id| self.sessions.get(&id).map(|e| e.clone())))
    }

    async fn rotate(&self, old_refresh: &str, replacement: Session) -> Result<bool, AuthError> {
        match self.by_refresh.remove(old_refresh) {
            Some((_, old_id)) => {
                if let Some(mut old) = self.sessions.get_mut(&old_id) {
                    old.revoked = true;
                }
                self.insert(replacement).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke(&self, id: Uuid) -> Result<(), AuthError> {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.revoked = true;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryGrantStore {
    grants: Arc<DashMap<String, PendingAuthGrant>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn stage(&self, grant: PendingAuthGrant) -> Result<(), AuthError> {
        // Cheap housekeeping: drop grants that can no longer be exchanged.
        let now = chrono::Utc::now();
        self.grants.retain(|_, g| g.expires_at > now);

        self.grants.insert(grant.token.clone(), grant);
        Ok(())
    }

    async fn consume(&self, token: &str) -> Result<Option<PendingAuthGrant>, AuthError> {
        Ok(self.grants.remove(token).map(|(_, g)| g))
    }
}
