//! Federated token exchange: external OIDC token → cloud STS federated
//! token → optional service-identity impersonation.

use crate::strategy::{AuthStrategy, StrategyContext};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keybridge_core::{
    Credential, Error, FederationConfig, GcpCredential, Result, TokenSource,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub const DEFAULT_STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

// Hosts a URL token source may talk to when the configuration does not
// name its own allow-list.
const DEFAULT_ALLOWED_HOSTS: &[&str] = &["token.actions.githubusercontent.com"];

/// Timeout for auxiliary calls (token-source fetch), distinct from the
/// minutes-scale device polling elsewhere.
const AUX_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Result of impersonating a service identity.
#[derive(Debug, Clone)]
pub struct ImpersonatedToken {
    pub access_token: String,
    pub expire_time: DateTime<Utc>,
}

/// Service-identity impersonation boundary.
#[async_trait]
pub trait ImpersonationClient: Send + Sync {
    async fn generate_access_token(
        &self,
        federated_token: &str,
        service_account: &str,
        scopes: &[String],
        lifetime: &str,
    ) -> Result<ImpersonatedToken>;
}

/// Validate a token-source URL before any network call: https only, host on
/// the allow-list.
pub fn validate_token_url(raw: &str, allowed_hosts: &[String]) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|err| Error::InvalidConfig(format!("invalid token source URL {}: {}", raw, err)))?;
    if url.scheme() != "https" {
        return Err(Error::InvalidConfig(format!(
            "token source URL must use https, got {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("token source URL {} has no host", raw)))?;
    let permitted = if allowed_hosts.is_empty() {
        DEFAULT_ALLOWED_HOSTS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    } else {
        allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    };
    if !permitted {
        return Err(Error::InvalidConfig(format!(
            "token source host {} is not on the allow-list",
            host
        )));
    }
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct UrlTokenResponse {
    value: String,
}

#[derive(Debug, Deserialize)]
struct StsExchangeResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: String,
}

/// Federated-Token-Exchange strategy.
pub struct FederatedExchangeStrategy {
    client: reqwest::Client,
    impersonation: Arc<dyn ImpersonationClient>,
}

impl FederatedExchangeStrategy {
    pub fn new(impersonation: Arc<dyn ImpersonationClient>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(AUX_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            impersonation,
        }
    }

    /// Obtain the external token from the configured source. Exactly one
    /// source is configured; empty results are always errors.
    async fn resolve_subject_token(&self, federation: &FederationConfig) -> Result<String> {
        match &federation.token_source {
            TokenSource::Environment { variable } => {
                let value = std::env::var(variable).map_err(|_| {
                    Error::AuthenticationFailed(format!(
                        "token environment variable {} is not set",
                        variable
                    ))
                })?;
                let value = value.trim().to_string();
                if value.is_empty() {
                    return Err(Error::AuthenticationFailed(format!(
                        "token environment variable {} is empty",
                        variable
                    )));
                }
                Ok(value)
            }
            TokenSource::File { path } => {
                let content = tokio::fs::read_to_string(path).await.map_err(|err| {
                    Error::AuthenticationFailed(format!(
                        "cannot read token file {}: {}",
                        path, err
                    ))
                })?;
                let content = content.trim().to_string();
                if content.is_empty() {
                    return Err(Error::AuthenticationFailed(format!(
                        "token file {} is empty",
                        path
                    )));
                }
                Ok(content)
            }
            TokenSource::Url {
                url,
                request_token,
                audience,
            } => {
                let mut url = validate_token_url(url, &federation.allowed_hosts)?;
                if let Some(audience) = audience {
                    url.query_pairs_mut().append_pair("audience", audience);
                }
                self.fetch_url_token(url, request_token.as_deref()).await
            }
        }
    }

    /// Fetch the external token from an already-validated endpoint.
    async fn fetch_url_token(&self, url: Url, request_token: Option<&str>) -> Result<String> {
        let mut request = self.client.get(url.clone());
        if let Some(bearer) = request_token {
            request = request.bearer_auth(bearer);
        }
        let response = request
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!(
                "token endpoint {} returned {}: {}",
                url.host_str().unwrap_or_default(),
                status,
                body
            )));
        }
        let body: UrlTokenResponse = response.json().await.map_err(|err| {
            Error::AuthenticationFailed(format!("malformed token response: {}", err))
        })?;
        if body.value.is_empty() {
            return Err(Error::AuthenticationFailed(
                "token endpoint returned an empty token".to_string(),
            ));
        }
        Ok(body.value)
    }

    /// Exchange the external token for a federated access token.
    async fn exchange_token(
        &self,
        federation: &FederationConfig,
        subject_token: &str,
    ) -> Result<(String, DateTime<Utc>)> {
        let token_url = federation
            .token_url
            .as_deref()
            .unwrap_or(DEFAULT_STS_TOKEN_URL);
        let scope = if federation.scopes.is_empty() {
            DEFAULT_SCOPE.to_string()
        } else {
            federation.scopes.join(" ")
        };
        let params = [
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:token-exchange",
            ),
            ("audience", federation.audience.as_str()),
            ("scope", scope.as_str()),
            (
                "requested_token_type",
                "urn:ietf:params:oauth:token-type:access_token",
            ),
            ("subject_token", subject_token),
            (
                "subject_token_type",
                "urn:ietf:params:oauth:token-type:jwt",
            ),
        ];

        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!(
                "STS token exchange failed: {}",
                body
            )));
        }

        let body: StsExchangeResponse = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed STS response: {}", err)))?;
        let expiry = Utc::now() + Duration::seconds(body.expires_in.unwrap_or(3600));
        Ok((body.access_token, expiry))
    }
}

#[async_trait]
impl AuthStrategy for FederatedExchangeStrategy {
    fn name(&self) -> &'static str {
        "federated-exchange"
    }

    async fn authenticate(
        &self,
        ctx: &StrategyContext<'_>,
        _upstream: Option<&Credential>,
    ) -> Result<Credential> {
        let federation = ctx.config.federation.as_ref().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "provider {} uses federated exchange but has no federation block",
                ctx.provider_name
            ))
        })?;

        let subject_token = self.resolve_subject_token(federation).await?;
        let (federated_token, federated_expiry) =
            self.exchange_token(federation, &subject_token).await?;
        debug!(
            provider = ctx.provider_name,
            audience = %federation.audience,
            "Exchanged external token for federated access token"
        );

        // Impersonation failure is fatal, never silently skipped.
        if let Some(service_account) = &federation.service_account {
            let lifetime = federation.token_lifetime.as_deref().unwrap_or("3600s");
            let scopes = if federation.scopes.is_empty() {
                vec![DEFAULT_SCOPE.to_string()]
            } else {
                federation.scopes.clone()
            };
            let impersonated = self
                .impersonation
                .generate_access_token(&federated_token, service_account, &scopes, lifetime)
                .await?;
            return Ok(Credential::Gcp(GcpCredential {
                access_token: impersonated.access_token,
                token_expiry: Some(impersonated.expire_time),
                project_id: ctx.config.project_id.clone(),
                account: Some(service_account.clone()),
                scopes,
                ..Default::default()
            }));
        }

        Ok(Credential::Gcp(GcpCredential {
            access_token: federated_token,
            token_expiry: Some(federated_expiry),
            project_id: ctx.config.project_id.clone(),
            scopes: federation.scopes.clone(),
            ..Default::default()
        }))
    }
}

/// reqwest-backed [`ImpersonationClient`] against the IAM credentials API.
pub struct HttpImpersonationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpImpersonationClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: "https://iamcredentials.googleapis.com".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }
}

impl Default for HttpImpersonationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImpersonationClient for HttpImpersonationClient {
    async fn generate_access_token(
        &self,
        federated_token: &str,
        service_account: &str,
        scopes: &[String],
        lifetime: &str,
    ) -> Result<ImpersonatedToken> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.endpoint, service_account
        );
        let body = serde_json::json!({
            "scope": scopes,
            "lifetime": lifetime,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(federated_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!(
                "impersonation of {} failed: {}",
                service_account, body
            )));
        }

        let body: GenerateAccessTokenResponse = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed impersonation response: {}", err)))?;
        let expire_time = DateTime::parse_from_rfc3339(&body.expire_time)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| Error::Network(format!("bad expireTime: {}", err)))?;

        Ok(ImpersonatedToken {
            access_token: body.access_token,
            expire_time,
        })
    }
}
