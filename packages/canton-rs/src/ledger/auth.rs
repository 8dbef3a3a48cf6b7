//! Bearer-token acquisition for the participant connection.
//!
//! Two sources: a JWT read from a file, or an OAuth2 client-credentials
//! exchange. Tokens are cached until 60 s before expiry and refreshed
//! lazily behind a mutex; an absent configuration means the participant
//! runs without auth (development).

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Refresh this long before the token actually expires.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Assumed lifetime when a token carries no usable expiry.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub enum AuthConfig {
    /// Path to a file containing a JWT issued for the participant.
    TokenFile { path: String },
    /// OAuth2 client-credentials exchange against `token_url`.
    ClientCredentials {
        client_id: String,
        client_secret: String,
        audience: String,
        token_url: String,
    },
}

/// Custom Debug that keeps the client secret out of logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::TokenFile { path } => {
                f.debug_struct("TokenFile").field("path", path).finish()
            }
            AuthConfig::ClientCredentials {
                client_id,
                audience,
                token_url,
                ..
            } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .field("audience", audience)
                .field("token_url", token_url)
                .finish(),
        }
    }
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: SystemTime,
}

pub struct TokenProvider {
    config: Option<AuthConfig>,
    http: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenProvider {
    pub fn new(config: Option<AuthConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    /// Current bearer token, or `None` when auth is not configured.
    pub async fn token(&self) -> Result<Option<String>> {
        let Some(config) = &self.config else {
            return Ok(None);
        };
        let mut cache = self.cache.lock().await;
        if let Some(cached) = &*cache {
            if SystemTime::now() + EXPIRY_SLACK < cached.expires_at {
                return Ok(Some(cached.value.clone()));
            }
        }
        let fresh = self.fetch(config).await?;
        let value = fresh.value.clone();
        tracing::debug!(token = %crate::redact::Redacted(&value), "Participant token refreshed");
        *cache = Some(fresh);
        Ok(Some(value))
    }

    /// Drop the cached token; the next call fetches a fresh one. Used after
    /// the participant rejects a request as unauthenticated.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn fetch(&self, config: &AuthConfig) -> Result<CachedToken> {
        match config {
            AuthConfig::TokenFile { path } => {
                let token = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| {
                        Error::with_source(
                            crate::ErrorKind::Dependency,
                            format!("failed to read token file {path}"),
                            e,
                        )
                    })?
                    .trim()
                    .to_string();
                let expires_at = jwt_expiry(&token)
                    .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
                    .unwrap_or_else(|| SystemTime::now() + DEFAULT_LIFETIME);
                Ok(CachedToken {
                    value: token,
                    expires_at,
                })
            }
            AuthConfig::ClientCredentials {
                client_id,
                client_secret,
                audience,
                token_url,
            } => {
                let response = self
                    .http
                    .post(token_url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("audience", audience.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| {
                        Error::with_source(crate::ErrorKind::Dependency, "token exchange failed", e)
                    })?;
                if !response.status().is_success() {
                    return Err(Error::unauthorized(format!(
                        "token endpoint returned {}",
                        response.status()
                    )));
                }
                let body: TokenResponse = response.json().await.map_err(|e| {
                    Error::with_source(
                        crate::ErrorKind::Dependency,
                        "token endpoint returned malformed JSON",
                        e,
                    )
                })?;
                let lifetime = body
                    .expires_in
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_LIFETIME);
                Ok(CachedToken {
                    value: body.access_token,
                    expires_at: SystemTime::now() + lifetime,
                })
            }
        }
    }
}

/// Read the `exp` claim out of an unverified JWT payload. The participant
/// verifies the token; we only need the expiry for cache management.
fn jwt_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_expiry_parses_exp_claim() {
        // header/payload are unsigned test fixtures; only the shape matters
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"relayer","exp":1900000000}"#);
        let token = format!("{header}.{payload}.");
        assert_eq!(jwt_expiry(&token), Some(1_900_000_000));
    }

    #[test]
    fn jwt_expiry_tolerates_garbage() {
        assert_eq!(jwt_expiry("not-a-jwt"), None);
        assert_eq!(jwt_expiry("a.b.c"), None);
    }

    #[tokio::test]
    async fn no_auth_config_yields_no_token() {
        let provider = TokenProvider::new(None);
        assert_eq!(provider.token().await.unwrap(), None);
    }
}
