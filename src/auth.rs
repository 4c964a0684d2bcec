use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::PipelineError;

/// Source of bearer tokens for the notes API. Implementations own refresh
/// policy; callers only ever ask for a currently valid token.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, PipelineError>;
}

/// Reads a long-lived token from the environment. Used by the CLI and in
/// tests where no identity flow is available.
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait::async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn access_token(&self) -> Result<String, PipelineError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(PipelineError::auth(format!(
                "set {} to a notes API bearer token",
                self.var
            ))),
        }
    }
}

/// Holds a short-lived access token and refreshes it against the identity
/// token endpoint when it is within a minute of expiry. The refresh
/// protocol itself stays behind this type.
pub struct RefreshingTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    refresh_token: String,
    state: Mutex<TokenState>,
}

#[derive(Default)]
struct TokenState {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl RefreshingTokenProvider {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            refresh_token: refresh_token.into(),
            state: Mutex::new(TokenState::default()),
        })
    }

    async fn refresh(&self) -> anyhow::Result<TokenState> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await
            .context("send token refresh")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("token endpoint returned {status}");
        }
        let body: TokenResponse = response.json().await.context("parse token response")?;
        let expires_at = body
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        Ok(TokenState {
            access_token: body.access_token,
            expires_at,
        })
    }
}

#[async_trait::async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn access_token(&self) -> Result<String, PipelineError> {
        let mut state = self.state.lock().await;
        let fresh = match state.expires_at {
            Some(expires_at) => Utc::now() + Duration::seconds(60) < expires_at,
            None => false,
        };
        if fresh && !state.access_token.is_empty() {
            return Ok(state.access_token.clone());
        }
        tracing::debug!(url = %self.token_url, "refreshing access token");
        *state = self
            .refresh()
            .await
            .map_err(|err| PipelineError::auth(format!("token refresh failed: {err:#}")))?;
        Ok(state.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_provider_reports_missing_token() {
        let provider = EnvTokenProvider::new("DECKIFY_TEST_TOKEN_UNSET");
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, PipelineError::AuthRequired { .. }));
    }
}
