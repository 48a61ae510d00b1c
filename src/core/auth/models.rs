// Domain models for the OAuth-to-session bridge.
// Nothing in here knows about HTTP, JWKS endpoints, or SQL - those live in
// the infra layer behind the traits in `store.rs`.

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERRORS
// ============================================================================

/// Everything that can go wrong between "user clicked sign in" and
/// "request carries a valid session".
///
/// The first four variants are terminal for a login attempt; the session
/// variants tell the client to re-authenticate. `Storage` and `Provider`
/// are infrastructure faults and map to 5xx at the HTTP boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Credential failed verification")]
    InvalidCredential,

    #[error("Credential is expired")]
    CredentialExpired,

    #[error("Auth grant is expired or already used")]
    ExpiredGrant,

    #[error("State nonce does not match the issued one")]
    StateMismatch,

    #[error("Session is expired")]
    SessionExpired,

    #[error("Session has been revoked")]
    SessionRevoked,

    #[error("Session token is invalid")]
    SessionInvalid,

    #[error("Refresh token is invalid")]
    RefreshInvalid,

    #[error("Refresh token is expired")]
    RefreshExpired,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ============================================================================
// DOMAIN MODELS
// ============================================================================

/// Claims extracted from a verified Google artifact.
///
/// This is the convergence point of all three login paths: whichever shape
/// the artifact had, by the time it becomes `GoogleClaims` the signature,
/// issuer and audience checks have already passed.
#[derive(Debug, Clone, PartialEq)]
pub struct GoogleClaims {
    /// Google's stable subject id (`sub`). The only key we trust across logins.
    pub subject: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
}

/// A user as we know them, keyed by the provider's subject id.
///
/// `google_refresh_token` is only populated by the server-side OAuth flows
/// (temp token / authorization code); a bare ID credential never carries one.
/// It feeds the credential broker that scopes outbound tool calls.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    pub google_refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl Identity {
    /// Builds a fresh identity from verified claims.
    pub fn from_claims(claims: &GoogleClaims, now: DateTime<Utc>) -> Self {
        Self {
            subject: claims.subject.clone(),
            email: claims.email.clone(),
            name: claims.name.clone(),
            picture: claims.picture.clone(),
            google_refresh_token: None,
            created_at: now,
            updated_at: now,
            last_login: Some(now),
        }
    }

    /// Applies the mutable profile fields from a later login.
    /// The subject never changes; a missing refresh token never clobbers a
    /// stored one.
    pub fn apply_login(&mut self, claims: &GoogleClaims, now: DateTime<Utc>) {
        self.email = claims.email.clone();
        self.name = claims.name.clone();
        if claims.picture.is_some() {
            self.picture = claims.picture.clone();
        }
        self.updated_at = now;
        self.last_login = Some(now);
    }
}

/// One application session: the record behind an access/refresh token pair.
///
/// Access tokens are stateless JWTs; this record is the anchor for
/// revocation and refresh rotation. Invariant: a non-revoked, non-expired
/// session resolves to exactly one identity via `subject`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub subject: String,
    /// Opaque, single-use. Rotated on every successful refresh.
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Short-lived, single-use bridge between an external OAuth completion and
/// session issuance. Consumption is atomic; a second consumer sees
/// `ExpiredGrant`.
#[derive(Debug, Clone)]
pub struct PendingAuthGrant {
    pub token: String,
    /// Anti-replay nonce; required (and checked) on the authorization-code
    /// path, absent on the temp-token path.
    pub state: Option<String>,
    pub claims: GoogleClaims,
    pub google_refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// What the caller gets back from `issue` and `refresh`.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

// ============================================================================
// TOKEN MATERIAL
// ============================================================================

/// Generates an unguessable opaque token: `len` bytes from the OS-seeded
/// CSPRNG, base64url without padding.
pub(crate) fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_are_unique_and_url_safe() {
        let a = random_token(32);
        let b = random_token(32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn apply_login_keeps_subject_and_picture_fallback() {
        let now = Utc::now();
        let claims = GoogleClaims {
            subject: "u1".into(),
            email: "a@b.com".into(),
            name: "Ada".into(),
            picture: Some("https://img/1".into()),
        };
        let mut identity = Identity::from_claims(&claims, now);

        let later = now + chrono::Duration::hours(1);
        let update = GoogleClaims {
            subject: "u1".into(),
            email: "new@b.com".into(),
            name: "Ada L".into(),
            picture: None,
        };
        identity.apply_login(&update, later);

        assert_eq!(identity.subject, "u1");
        assert_eq!(identity.email, "new@b.com");
        // A login without a picture keeps the one we already have.
        assert_eq!(identity.picture.as_deref(), Some("https://img/1"));
        assert_eq!(identity.last_login, Some(later));
    }

    #[test]
    fn auth_error_messages_do_not_leak_token_material() {
        let err = AuthError::RefreshInvalid;
        assert_eq!(err.to_string(), "Refresh token is invalid");
    }
}
