// Session token manager: mints, validates, refreshes and revokes the
// application's own access/refresh token pairs.
//
// Access tokens are HS256 JWTs so validation is a local cryptographic check
// plus one session-record read (for the revoked flag). Refresh tokens are
// opaque and single-use: every successful refresh rotates the pair, and the
// store's `rotate` CAS guarantees that a stolen-but-already-used refresh
// token cannot mint a second live session.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::{random_token, AuthError, Identity, IssuedSession, Session};
use super::store::{IdentityStore, SessionStore};

/// Claims carried by an application access token.
#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    /// Identity subject id.
    sub: String,
    /// Session id - the revocation anchor.
    sid: Uuid,
    iat: i64,
    exp: i64,
    /// Always "access"; refresh tokens are opaque, never JWTs.
    typ: String,
}

pub struct SessionTokenManager<S, I> {
    sessions: S,
    identities: I,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl<S, I> SessionTokenManager<S, I>
where
    S: SessionStore,
    I: IdentityStore,
{
    pub fn new(
        sessions: S,
        identities: I,
        secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // No leeway: an expired token is expired, also in tests.
        validation.leeway = 0;

        Self {
            sessions,
            identities,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            access_ttl,
            refresh_ttl,
        }
    }

    /// Mints a fresh session for a verified identity.
    pub async fn issue(&self, identity: &Identity) -> Result<IssuedSession, AuthError> {
        let session = self.new_session(&identity.subject);
        self.sessions.insert(session.clone()).await?;

        let access_token = self.mint_access(&session)?;
        tracing::debug!(subject = %identity.subject, session_id = %session.id, "issued session");

        Ok(IssuedSession {
            session_id: session.id,
            access_token,
            refresh_token: session.refresh_token,
            access_expires_at: session.access_expires_at,
        })
    }

    /// Resolves an access token to its identity.
    ///
    /// Errors distinguish the three ways a token stops working: it no longer
    /// parses/verifies (`SessionInvalid`), its validity window passed
    /// (`SessionExpired`), or it was explicitly revoked (`SessionRevoked`).
    pub async fn validate(&self, access_token: &str) -> Result<Identity, AuthError> {
        let claims = self.decode_access(access_token)?;

        let session = self
            .sessions
            .get(claims.sid)
            .await?
            .ok_or(AuthError::SessionInvalid)?;
        if session.revoked {
            return Err(AuthError::SessionRevoked);
        }

        self.identities
            .get(&claims.sub)
            .await?
            .ok_or(AuthError::SessionInvalid)
    }

    /// Rotates a refresh token into a new access/refresh pair.
    ///
    /// Refresh tokens are single-use. When two callers race with the same
    /// token, the store's CAS picks one winner; the loser observes
    /// `RefreshInvalid` because the token was already rotated.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedSession, AuthError> {
        let current = self
            .sessions
            .find_by_refresh(refresh_token)
            .await?
            .ok_or(AuthError::RefreshInvalid)?;

        if current.revoked {
            return Err(AuthError::RefreshInvalid);
        }
        if current.refresh_expires_at < Utc::now() {
            return Err(AuthError::RefreshExpired);
        }

        let replacement = self.new_session(&current.subject);
        if !self
            .sessions
            .rotate(refresh_token, replacement.clone())
            .await?
        {
            // Lost the race: someone rotated this token between our read and
            // the CAS.
            return Err(AuthError::RefreshInvalid);
        }

        let access_token = self.mint_access(&replacement)?;
        tracing::debug!(subject = %replacement.subject, session_id = %replacement.id, "rotated session");

        Ok(IssuedSession {
            session_id: replacement.id,
            access_token,
            refresh_token: replacement.refresh_token,
            access_expires_at: replacement.access_expires_at,
        })
    }

    /// Marks a session revoked. Idempotent.
    pub async fn revoke(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.sessions.revoke(session_id).await
    }

    /// Revokes the session behind a presented access token (logout).
    pub async fn revoke_by_access(&self, access_token: &str) -> Result<(), AuthError> {
        let claims = self.decode_access(access_token)?;
        self.sessions.revoke(claims.sid).await
    }

    fn new_session(&self, subject: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            refresh_token: random_token(32),
            issued_at: now,
            access_expires_at: now + self.access_ttl,
            refresh_expires_at: now + self.refresh_ttl,
            revoked: false,
        }
    }

    fn mint_access(&self, session: &Session) -> Result<String, AuthError> {
        let claims = AccessClaims {
            sub: session.subject.clone(),
            sid: session.id,
            iat: session.issued_at.timestamp(),
            exp: session.access_expires_at.timestamp(),
            typ: "access".to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("access token encoding: {e}")))
    }

    fn decode_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::SessionExpired,
                _ => AuthError::SessionInvalid,
            },
        )?;
        if data.claims.typ != "access" {
            return Err(AuthError::SessionInvalid);
        }
        Ok(data.claims)
    }
}

/// The narrow view other components need of the session layer: resolving an
/// access token to an identity. The orchestrator takes this instead of the
/// whole manager so its tests can script session expiry.
#[async_trait::async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, access_token: &str) -> Result<Identity, AuthError>;
}

#[async_trait::async_trait]
impl<S, I> SessionValidator for SessionTokenManager<S, I>
where
    S: SessionStore,
    I: IdentityStore,
{
    async fn validate(&self, access_token: &str) -> Result<Identity, AuthError> {
        SessionTokenManager::validate(self, access_token).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
