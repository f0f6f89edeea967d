//! Bearer-token acquisition for provider APIs.

use async_trait::async_trait;

use crate::error::Result;

/// Source of OAuth bearer tokens for Google-style provider APIs.
///
/// Production deployments fetch from the serving platform's metadata
/// endpoint; tests use [`crate::testing::StaticTokenSource`].
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<String>;

    /// An OIDC identity token minted for `audience`.
    async fn identity_token(&self, audience: &str) -> Result<String>;
}
