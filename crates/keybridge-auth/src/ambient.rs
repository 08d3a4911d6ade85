//! Ambient credentials: discovery through the platform-standard
//! application-default-credential chain.

use crate::strategy::{AuthStrategy, StrategyContext};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keybridge_core::{Credential, Error, GcpCredential, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const ADC_PATH_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const AUX_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// An access token materialized from the ambient chain.
#[derive(Debug, Clone)]
pub struct AmbientToken {
    pub access_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// Token discovery boundary. The default walks the platform chain; tests
/// substitute a scripted source.
#[async_trait]
pub trait AmbientTokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AmbientToken>;

    /// Introspect the identity behind the token. Best-effort only.
    async fn identity_email(&self, access_token: &str) -> Result<String>;
}

/// Ambient-Credential strategy.
pub struct AmbientCredentialStrategy {
    source: Arc<dyn AmbientTokenSource>,
}

impl AmbientCredentialStrategy {
    pub fn new(source: Arc<dyn AmbientTokenSource>) -> Self {
        Self { source }
    }
}

/// The ambient chain reports revoked login state with this pair of markers;
/// rewrite it into an actionable hint.
fn rewrite_reauth_hint(err: Error) -> Error {
    let text = err.to_string();
    if text.contains("invalid_grant") && text.contains("reauth") {
        return Error::AuthenticationFailed(
            "ambient credentials have been revoked or expired; \
             run `gcloud auth application-default login` and retry"
                .to_string(),
        );
    }
    err
}

#[async_trait]
impl AuthStrategy for AmbientCredentialStrategy {
    fn name(&self) -> &'static str {
        "ambient-credential"
    }

    async fn authenticate(
        &self,
        ctx: &StrategyContext<'_>,
        _upstream: Option<&Credential>,
    ) -> Result<Credential> {
        let token = self
            .source
            .fetch_token()
            .await
            .map_err(rewrite_reauth_hint)?;

        let account = match self.source.identity_email(&token.access_token).await {
            Ok(email) => Some(email),
            Err(err) => {
                debug!(
                    provider = ctx.provider_name,
                    error = %err,
                    "Identity lookup failed; continuing without account"
                );
                None
            }
        };

        Ok(Credential::Gcp(GcpCredential {
            access_token: token.access_token,
            token_expiry: token.expiry,
            project_id: ctx.config.project_id.clone(),
            account,
            scopes: ctx.config.scopes.clone(),
            ..Default::default()
        }))
    }
}

#[derive(Debug, Deserialize)]
struct StoredUserCredentials {
    #[serde(rename = "type")]
    credential_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserinfoResponse {
    email: String,
}

/// Default [`AmbientTokenSource`]: explicit credentials file → well-known
/// gcloud user credentials → metadata server.
pub struct AdcTokenSource {
    client: reqwest::Client,
    oauth_endpoint: String,
    metadata_endpoint: String,
    userinfo_endpoint: String,
}

impl AdcTokenSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(AUX_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            oauth_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            metadata_endpoint: "http://metadata.google.internal".to_string(),
            userinfo_endpoint: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
        }
    }

    pub fn with_endpoints(mut self, oauth: &str, metadata: &str, userinfo: &str) -> Self {
        self.oauth_endpoint = oauth.to_string();
        self.metadata_endpoint = metadata.trim_end_matches('/').to_string();
        self.userinfo_endpoint = userinfo.to_string();
        self
    }

    fn credentials_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(ADC_PATH_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let dirs = directories::BaseDirs::new()?;
        let well_known = dirs
            .config_dir()
            .join("gcloud")
            .join("application_default_credentials.json");
        well_known.exists().then_some(well_known)
    }

    /// Refresh-token grant against the OAuth endpoint.
    async fn refresh(&self, stored: &StoredUserCredentials) -> Result<AmbientToken> {
        let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            stored.client_id.as_deref(),
            stored.client_secret.as_deref(),
            stored.refresh_token.as_deref(),
        ) else {
            return Err(Error::AuthenticationFailed(
                "stored user credentials are missing the refresh token fields".to_string(),
            ));
        };

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .client
            .post(&self.oauth_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            // The body carries the invalid_grant/reauth markers the strategy
            // rewrites into a login hint.
            return Err(Error::AuthenticationFailed(format!(
                "token refresh rejected: {}",
                body
            )));
        }

        let body: OauthTokenResponse = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed token response: {}", err)))?;
        Ok(AmbientToken {
            access_token: body.access_token,
            expiry: body.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    async fn metadata_token(&self) -> Result<AmbientToken> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.metadata_endpoint
        );
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| {
                Error::AuthenticationFailed(format!(
                    "no ambient credentials found (metadata server unreachable: {})",
                    err
                ))
            })?;
        if !response.status().is_success() {
            return Err(Error::AuthenticationFailed(format!(
                "no ambient credentials found (metadata server returned {})",
                response.status()
            )));
        }
        let body: OauthTokenResponse = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed metadata response: {}", err)))?;
        Ok(AmbientToken {
            access_token: body.access_token,
            expiry: body.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

impl Default for AdcTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AmbientTokenSource for AdcTokenSource {
    async fn fetch_token(&self) -> Result<AmbientToken> {
        if let Some(path) = Self::credentials_file() {
            debug!(path = %path.display(), "Using discovered credentials file");
            let raw = tokio::fs::read(&path).await?;
            let stored: StoredUserCredentials = serde_json::from_slice(&raw)?;
            if stored.credential_type != "authorized_user" {
                return Err(Error::AuthenticationFailed(format!(
                    "unsupported ambient credential type {:?}",
                    stored.credential_type
                )));
            }
            return self.refresh(&stored).await;
        }
        self.metadata_token().await
    }

    async fn identity_email(&self, access_token: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::AuthenticationFailed(format!(
                "identity introspection returned {}",
                response.status()
            )));
        }
        let body: UserinfoResponse = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed userinfo response: {}", err)))?;
        Ok(body.email)
    }
}
