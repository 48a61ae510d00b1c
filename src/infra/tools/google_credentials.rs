// Google credential broker: turns the refresh token stored on an identity
// into a short-lived access token for outbound tool calls, cached per
// subject and renewed shortly before expiry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;

use crate::core::auth::Identity;
use crate::core::tools::{BrokerError, CredentialBroker};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Tokens within this margin of expiry are treated as expired so a call
/// never leaves with a credential about to die mid-flight.
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Clone)]
struct CachedCredential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedCredential {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + Duration::seconds(EXPIRY_SKEW_SECONDS)
    }
}

pub struct GoogleCredentialBroker {
    client: Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    cache: DashMap<String, CachedCredential>,
}

impl GoogleCredentialBroker {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client: Client::new(),
            client_id,
            client_secret,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            cache: DashMap::new(),
        }
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, BrokerError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| BrokerError::Refresh(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BrokerError::Refresh(format!("{status}: {detail}")));
        }

        response
            .json()
            .await
            .map_err(|e| BrokerError::Refresh(format!("token response parse: {e}")))
    }
}

#[async_trait]
impl CredentialBroker for GoogleCredentialBroker {
    async fn access_token(&self, identity: &Identity) -> Result<String, BrokerError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.get(&identity.subject) {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let refresh_token = identity
            .google_refresh_token
            .as_deref()
            .ok_or(BrokerError::MissingCredential)?;

        let fresh = self.exchange_refresh_token(refresh_token).await?;
        let expires_at = now + Duration::seconds(fresh.expires_in);
        tracing::debug!(subject = %identity.subject, "refreshed Google access token");

        self.cache.insert(
            identity.subject.clone(),
            CachedCredential {
                token: fresh.access_token.clone(),
                expires_at,
            },
        );
        Ok(fresh.access_token)
    }
}
