// Credential exchange: turns a one-time Google artifact into a verified
// Identity. Three artifact shapes converge on one entry point; whichever
// path a login takes, it ends in the same identity upsert.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::models::{random_token, AuthError, GoogleClaims, Identity, PendingAuthGrant};
use super::store::{GrantStore, IdentityStore};

/// How long a staged grant stays exchangeable.
const GRANT_TTL_MINUTES: i64 = 10;

/// Verifies a signed ID credential against the identity provider.
///
/// The infra implementation checks the RS256 signature against Google's
/// published keys, the audience against our client id and the issuer against
/// the accounts.google.com pair. Kept as a trait so the exchange logic is
/// testable without a network or real key material.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<GoogleClaims, AuthError>;
}

/// The three accepted login artifacts.
///
/// `TempToken` and `AuthCode` both resolve through a staged
/// `PendingAuthGrant`; only the code path carries (and must match) the state
/// nonce. When a request contains more than one artifact the temp token wins;
/// that precedence is applied where the request body is parsed.
#[derive(Debug, Clone)]
pub enum AuthArtifact {
    /// A signed ID token straight from Google Sign-In.
    Credential(String),
    /// A single-use token minted by the server-side OAuth completion.
    TempToken(String),
    /// The legacy redirect flow: authorization code plus the state nonce the
    /// redirect was issued with.
    AuthCode { code: String, state: String },
}

/// Exchanges login artifacts for identities and stages grants for the
/// server-side OAuth completion flow.
pub struct CredentialExchanger<V, I, G> {
    verifier: V,
    identities: I,
    grants: G,
}

impl<V, I, G> CredentialExchanger<V, I, G>
where
    V: CredentialVerifier,
    I: IdentityStore,
    G: GrantStore,
{
    pub fn new(verifier: V, identities: I, grants: G) -> Self {
        Self {
            verifier,
            identities,
            grants,
        }
    }

    /// The single entry point for all three login paths.
    ///
    /// Side effect: upserts the identity record (insert on first login,
    /// profile refresh afterwards).
    pub async fn exchange(&self, artifact: AuthArtifact) -> Result<Identity, AuthError> {
        match artifact {
            AuthArtifact::Credential(credential) => {
                let claims = self.verifier.verify(&credential).await?;
                tracing::info!(subject = %claims.subject, "verified signed credential");
                self.upsert_identity(claims, None).await
            }
            AuthArtifact::TempToken(token) => {
                let grant = self.consume_grant(&token).await?;
                tracing::info!(subject = %grant.claims.subject, "exchanged temp token");
                self.upsert_identity(grant.claims, grant.google_refresh_token)
                    .await
            }
            AuthArtifact::AuthCode { code, state } => {
                let grant = self.consume_grant(&code).await?;
                // Anti-replay: the code is only valid together with the nonce
                // it was issued with.
                if grant.state.as_deref() != Some(state.as_str()) {
                    tracing::warn!(subject = %grant.claims.subject, "state nonce mismatch on code exchange");
                    return Err(AuthError::StateMismatch);
                }
                tracing::info!(subject = %grant.claims.subject, "exchanged authorization code");
                self.upsert_identity(grant.claims, grant.google_refresh_token)
                    .await
            }
        }
    }

    /// Stages a grant for a login completed out-of-band (the OAuth callback
    /// side). Returns the grant so the caller can hand its token to the
    /// client for the final `exchange` round-trip.
    pub async fn stage_grant(
        &self,
        claims: GoogleClaims,
        google_refresh_token: Option<String>,
        state: Option<String>,
    ) -> Result<PendingAuthGrant, AuthError> {
        let grant = PendingAuthGrant {
            token: random_token(32),
            state,
            claims,
            google_refresh_token,
            expires_at: Utc::now() + Duration::minutes(GRANT_TTL_MINUTES),
        };
        self.grants.stage(grant.clone()).await?;
        Ok(grant)
    }

    /// Consumes a grant exactly once. Absent, already-consumed and expired
    /// grants are indistinguishable to the caller: all are `ExpiredGrant`.
    async fn consume_grant(&self, token: &str) -> Result<PendingAuthGrant, AuthError> {
        let grant = self
            .grants
            .consume(token)
            .await?
            .ok_or(AuthError::ExpiredGrant)?;

        if grant.expires_at < Utc::now() {
            return Err(AuthError::ExpiredGrant);
        }
        Ok(grant)
    }

    async fn upsert_identity(
        &self,
        claims: GoogleClaims,
        google_refresh_token: Option<String>,
    ) -> Result<Identity, AuthError> {
        let now = Utc::now();
        let mut identity = match self.identities.get(&claims.subject).await? {
            Some(mut existing) => {
                existing.apply_login(&claims, now);
                existing
            }
            None => Identity::from_claims(&claims, now),
        };
        if google_refresh_token.is_some() {
            identity.google_refresh_token = google_refresh_token;
        }
        self.identities.upsert(identity.clone()).await?;
        Ok(identity)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    struct StaticVerifier {
        claims: GoogleClaims,
    }

    #[async_trait]
    impl CredentialVerifier for StaticVerifier {
        async fn verify(&self, credential: &str) -> Result<GoogleClaims, AuthError> {
            if credential == "valid" {
                Ok(self.claims.clone())
            } else {
                Err(AuthError::InvalidCredential)
            }
        }
    }

    #[derive(Default)]
    struct MapIdentityStore {
        map: DashMap<String, Identity>,
    }

    #[async_trait]
    impl IdentityStore for MapIdentityStore {
        async fn get(&self, subject: &str) -> Result<Option<Identity>, AuthError> {
            Ok(self.map.get(subject).map(|e| e.clone()))
        }

        async fn upsert(&self, identity: Identity) -> Result<(), AuthError> {
            self.map.insert(identity.subject.clone(), identity);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MapGrantStore {
        map: DashMap<String, PendingAuthGrant>,
    }

    #[async_trait]
    impl GrantStore for MapGrantStore {
        async fn stage(&self, grant: PendingAuthGrant) -> Result<(), AuthError> {
            self.map.insert(grant.token.clone(), grant);
            Ok(())
        }

        async fn consume(&self, token: &str) -> Result<Option<PendingAuthGrant>, AuthError> {
            Ok(self.map.remove(token).map(|(_, g)| g))
        }
    }

    fn claims() -> GoogleClaims {
        GoogleClaims {
            subject: "u1".into(),
            email: "a@b.com".into(),
            name: "Ada".into(),
            picture: None,
        }
    }

    fn exchanger() -> CredentialExchanger<StaticVerifier, MapIdentityStore, MapGrantStore> {
        CredentialExchanger::new(
            StaticVerifier { claims: claims() },
            MapIdentityStore::default(),
            MapGrantStore::default(),
        )
    }

    #[tokio::test]
    async fn credential_path_upserts_identity() {
        let exchanger = exchanger();

        let identity = exchanger
            .exchange(AuthArtifact::Credential("valid".into()))
            .await
            .unwrap();
        assert_eq!(identity.subject, "u1");
        assert_eq!(identity.email, "a@b.com");

        // Second login updates rather than duplicates.
        let again = exchanger
            .exchange(AuthArtifact::Credential("valid".into()))
            .await
            .unwrap();
        assert_eq!(again.created_at, identity.created_at);
    }

    #[tokio::test]
    async fn bad_credential_is_rejected() {
        let exchanger = exchanger();
        let err = exchanger
            .exchange(AuthArtifact::Credential("forged".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn temp_token_is_single_use() {
        let exchanger = exchanger();
        let grant = exchanger
            .stage_grant(claims(), Some("grt-1".into()), None)
            .await
            .unwrap();

        let identity = exchanger
            .exchange(AuthArtifact::TempToken(grant.token.clone()))
            .await
            .unwrap();
        assert_eq!(identity.subject, "u1");
        assert_eq!(identity.google_refresh_token.as_deref(), Some("grt-1"));

        // Replay of the same token fails.
        let err = exchanger
            .exchange(AuthArtifact::TempToken(grant.token))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredGrant));
    }

    #[tokio::test]
    async fn auth_code_requires_matching_state() {
        let exchanger = exchanger();
        let grant = exchanger
            .stage_grant(claims(), None, Some("nonce-1".into()))
            .await
            .unwrap();

        let err = exchanger
            .exchange(AuthArtifact::AuthCode {
                code: grant.token.clone(),
                state: "nonce-2".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));

        // The mismatching attempt consumed the grant, so even the right
        // state cannot replay it.
        let err = exchanger
            .exchange(AuthArtifact::AuthCode {
                code: grant.token,
                state: "nonce-1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredGrant));
    }

    #[tokio::test]
    async fn expired_grant_is_rejected() {
        let exchanger = exchanger();
        let grant = PendingAuthGrant {
            token: "stale".into(),
            state: None,
            claims: claims(),
            google_refresh_token: None,
            expires_at: Utc::now() - Duration::minutes(1),
        };
        exchanger.grants.stage(grant).await.unwrap();

        let err = exchanger
            .exchange(AuthArtifact::TempToken("stale".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredGrant));
    }
}
