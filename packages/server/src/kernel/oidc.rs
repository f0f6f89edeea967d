//! OIDC verification for the worker callback endpoint.
//!
//! The task queue signs worker deliveries with an OIDC identity token
//! whose audience is the callback URL. The verifier checks signature,
//! issuer and audience against a cached JWKS document.

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Verified identity of a worker delivery.
#[derive(Debug, Clone)]
pub struct OidcClaims {
    pub subject: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait OidcVerifier: Send + Sync {
    /// Verify a bearer token; errors reject the delivery.
    async fn verify(&self, token: &str) -> Result<OidcClaims>;
}

#[derive(Deserialize)]
struct TokenClaims {
    sub: String,
    email: Option<String>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS-backed verifier for queue-signed deliveries.
pub struct GoogleOidcVerifier {
    client: Client,
    audience: String,
    jwks_url: String,
    cache: RwLock<Option<CachedJwks>>,
}

impl GoogleOidcVerifier {
    pub fn new(audience: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            audience: audience.into(),
            jwks_url: GOOGLE_JWKS_URL.to_string(),
            cache: RwLock::new(None),
        }
    }

    /// Set a custom JWKS URL (for tests).
    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks_url = url.into();
        self
    }

    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_TTL {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let keys: JwkSet = self
            .client
            .get(&self.jwks_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("fetching JWKS")?
            .error_for_status()
            .context("JWKS endpoint error")?
            .json()
            .await
            .context("parsing JWKS")?;

        *self.cache.write().await = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        debug!(count = keys.keys.len(), "refreshed JWKS");
        Ok(keys)
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey> {
        let jwks = self.jwks(false).await?;
        let jwk = match jwks.find(kid) {
            Some(jwk) => jwk.clone(),
            // Key rotation: refetch once before giving up.
            None => self
                .jwks(true)
                .await?
                .find(kid)
                .cloned()
                .with_context(|| format!("unknown signing key {kid}"))?,
        };
        DecodingKey::from_jwk(&jwk).context("building decoding key")
    }
}

#[async_trait]
impl OidcVerifier for GoogleOidcVerifier {
    async fn verify(&self, token: &str) -> Result<OidcClaims> {
        let header = decode_header(token).context("malformed token header")?;
        let kid = header.kid.context("token has no key id")?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&GOOGLE_ISSUERS);

        let data =
            decode::<TokenClaims>(token, &key, &validation).context("token validation failed")?;

        Ok(OidcClaims {
            subject: data.claims.sub,
            email: data.claims.email,
        })
    }
}

/// Fixed-token verifier for tests and emulation wiring.
pub struct StaticVerifier {
    accept: String,
}

impl StaticVerifier {
    pub fn new(accept: impl Into<String>) -> Self {
        Self {
            accept: accept.into(),
        }
    }
}

#[async_trait]
impl OidcVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<OidcClaims> {
        if token != self.accept {
            anyhow::bail!("invalid token");
        }
        Ok(OidcClaims {
            subject: "static".to_string(),
            email: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_matches_exact_token() {
        let verifier = StaticVerifier::new("secret");
        assert!(verifier.verify("secret").await.is_ok());
        assert!(verifier.verify("other").await.is_err());
    }
}
