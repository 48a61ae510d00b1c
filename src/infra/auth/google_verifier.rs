// =============================================================================
// GOOGLE ID TOKEN VERIFIER
// =============================================================================
//
// Verifies the signed ID credential produced by Google Sign-In:
// - RS256 signature against Google's published JWKS
// - audience must equal our OAuth client id
// - issuer must be accounts.google.com (with or without scheme)
//
// The JWKS document is cached and refreshed on expiry, or early when a token
// arrives signed by a key id we have not seen (Google rotates keys).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::core::auth::{AuthError, CredentialVerifier, GoogleClaims};

const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const VALID_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];
const KEY_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    /// RSA modulus, base64url.
    n: String,
    /// RSA exponent, base64url.
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    keys: HashMap<String, Jwk>,
    expires_at: SystemTime,
}

/// Claims we read out of a Google ID token. Verification of `exp`, `aud`
/// and `iss` happens inside `jsonwebtoken`; the fields here are what is left
/// to extract.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    picture: Option<String>,
}

pub struct GoogleIdTokenVerifier {
    client: Client,
    client_id: String,
    certs_url: String,
    cached_keys: RwLock<Option<CachedKeys>>,
}

impl GoogleIdTokenVerifier {
    pub fn new(client_id: String) -> Self {
        Self {
            client: Client::new(),
            client_id,
            certs_url: GOOGLE_CERTS_URL.to_string(),
            cached_keys: RwLock::new(None),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_issuer(&VALID_ISSUERS);
        validation
    }

    /// Returns the signing key for `kid`, consulting the cache first.
    /// `force_refresh` skips the cache (used when a kid is unknown - Google
    /// may have rotated keys since our last fetch).
    async fn signing_key(&self, kid: &str, force_refresh: bool) -> Result<Jwk, AuthError> {
        if !force_refresh {
            let cached = self.cached_keys.read().await;
            if let Some(cache) = cached.as_ref() {
                if cache.expires_at > SystemTime::now() {
                    if let Some(key) = cache.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        let fresh = self.fetch_keys().await?;
        let key = fresh.get(kid).cloned();

        {
            let mut cached = self.cached_keys.write().await;
            *cached = Some(CachedKeys {
                keys: fresh,
                expires_at: SystemTime::now() + KEY_CACHE_TTL,
            });
        }

        // A kid that is not in a freshly fetched document is not a Google key.
        key.ok_or(AuthError::InvalidCredential)
    }

    async fn fetch_keys(&self) -> Result<HashMap<String, Jwk>, AuthError> {
        let response = self
            .client
            .get(&self.certs_url)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("JWKS fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::Provider(format!(
                "JWKS fetch returned {}",
                response.status()
            )));
        }

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("JWKS parse failed: {e}")))?;

        tracing::debug!(count = jwks.keys.len(), "fetched Google signing keys");
        Ok(jwks.keys.into_iter().map(|k| (k.kid.clone(), k)).collect())
    }

    fn decode_with_key(&self, credential: &str, key: &Jwk) -> Result<GoogleClaims, AuthError> {
        let decoding_key = DecodingKey::from_rsa_components(&key.n, &key.e)
            .map_err(|_| AuthError::InvalidCredential)?;

        let data = decode::<IdTokenClaims>(credential, &decoding_key, &self.validation())
            .map_err(map_jwt_error)?;

        Ok(GoogleClaims {
            subject: data.claims.sub,
            email: data.claims.email,
            name: data.claims.name,
            picture: data.claims.picture,
        })
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::CredentialExpired,
        _ => AuthError::InvalidCredential,
    }
}

#[async_trait]
impl CredentialVerifier for GoogleIdTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<GoogleClaims, AuthError> {
        let header = decode_header(credential).map_err(|_| AuthError::InvalidCredential)?;
        let kid = header.kid.ok_or(AuthError::InvalidCredential)?;

        let key = self.signing_key(&kid, false).await?;
        match self.decode_with_key(credential, &key) {
            Ok(claims) => Ok(claims),
            Err(AuthError::InvalidCredential) => {
                // The cached key may be stale for this kid; one forced refresh
                // before giving up.
                let key = self.signing_key(&kid, true).await?;
                self.decode_with_key(credential, &key)
            }
            Err(other) => Err(other),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::ErrorKind;

    #[tokio::test]
    async fn garbage_credential_is_invalid_without_network() {
        let verifier = GoogleIdTokenVerifier::new("client-1".into());
        let err = verifier.verify("definitely-not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn token_without_kid_is_invalid() {
        // A structurally valid JWT whose header carries no kid.
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({"sub": "u1", "exp": 4102444800u64}),
            &jsonwebtoken::EncodingKey::from_secret(b"k"),
        )
        .unwrap();

        let verifier = GoogleIdTokenVerifier::new("client-1".into());
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[test]
    fn expired_signatures_map_to_credential_expired() {
        let err = jsonwebtoken::errors::Error::from(ErrorKind::ExpiredSignature);
        assert!(matches!(map_jwt_error(err), AuthError::CredentialExpired));

        let err = jsonwebtoken::errors::Error::from(ErrorKind::InvalidAudience);
        assert!(matches!(map_jwt_error(err), AuthError::InvalidCredential));
    }

    #[test]
    fn both_google_issuer_spellings_are_accepted() {
        let verifier = GoogleIdTokenVerifier::new("client-1".into());
        let validation = verifier.validation();
        let issuers = validation.iss.expect("issuers configured");
        for issuer in VALID_ISSUERS {
            assert!(issuers.contains(issuer));
        }
    }
}
