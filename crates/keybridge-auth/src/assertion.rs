//! Assertion exchange: signed IdP assertion → role selection → temporary
//! credentials.

use crate::strategy::{AuthStrategy, StrategyContext};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use keybridge_core::{AwsCredential, Credential, Error, IdentityConfig, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const MIN_SESSION_SECONDS: i64 = 900;
const MAX_SESSION_SECONDS: i64 = 43_200;
const DEFAULT_SESSION_SECONDS: i64 = 3_600;

/// A role/principal pair extracted from an assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCandidate {
    pub role: String,
    pub principal: String,
}

/// Fetches a signed, base64-encoded assertion from the identity provider.
#[async_trait]
pub trait AssertionClient: Send + Sync {
    async fn fetch_assertion(&self, idp_url: &str) -> Result<String>;
}

/// Narrow STS surface: assertion exchange and portal-token role resolution.
#[async_trait]
pub trait StsClient: Send + Sync {
    async fn assume_role_with_assertion(
        &self,
        assertion_b64: &str,
        candidate: &RoleCandidate,
        duration_seconds: i64,
        region: Option<&str>,
    ) -> Result<AwsCredential>;

    /// Resolve temporary keys for an account/role from a portal access token
    /// (the device-flow base credential).
    async fn role_credentials(
        &self,
        portal_token: &str,
        account_id: &str,
        role_name: &str,
        region: Option<&str>,
    ) -> Result<AwsCredential>;

    /// Assume a further role using already-held temporary keys.
    async fn assume_role(
        &self,
        upstream: &AwsCredential,
        role_arn: &str,
        duration_seconds: i64,
        region: Option<&str>,
    ) -> Result<AwsCredential>;
}

/// Requested session duration, clamped to the STS-documented bounds.
/// Unset or unparsable values fall back to one hour.
pub fn session_seconds(configured: Option<&str>) -> i64 {
    let requested = configured
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(DEFAULT_SESSION_SECONDS);
    requested.clamp(MIN_SESSION_SECONDS, MAX_SESSION_SECONDS)
}

/// Extract role/principal candidate pairs from a decoded assertion document.
/// Pairs appear as comma-separated attribute values; the element containing
/// `:role/` is the role, its partner the principal.
pub fn extract_role_candidates(document: &str) -> Vec<RoleCandidate> {
    let mut candidates = Vec::new();
    for raw in document.split(['<', '>']) {
        let value = raw.trim();
        let Some((first, second)) = value.split_once(',') else {
            continue;
        };
        let (first, second) = (first.trim(), second.trim());
        let (role, principal) = if first.contains(":role/") {
            (first, second)
        } else if second.contains(":role/") {
            (second, first)
        } else {
            continue;
        };
        candidates.push(RoleCandidate {
            role: role.to_string(),
            principal: principal.to_string(),
        });
    }
    candidates
}

/// Pick the candidate whose role or principal contains the hint
/// (case-insensitive). No match falls back to the first candidate in source
/// order; zero candidates selects nothing.
pub fn select_role<'a>(
    candidates: &'a [RoleCandidate],
    hint: Option<&str>,
) -> Option<&'a RoleCandidate> {
    if candidates.is_empty() {
        return None;
    }
    if let Some(hint) = hint {
        let needle = hint.to_lowercase();
        if let Some(found) = candidates.iter().find(|candidate| {
            candidate.role.to_lowercase().contains(&needle)
                || candidate.principal.to_lowercase().contains(&needle)
        }) {
            return Some(found);
        }
    }
    candidates.first()
}

/// Assertion-Exchange strategy.
pub struct AssertionExchangeStrategy {
    idp: Arc<dyn AssertionClient>,
    sts: Arc<dyn StsClient>,
    role_hint: Option<String>,
}

impl AssertionExchangeStrategy {
    pub fn new(idp: Arc<dyn AssertionClient>, sts: Arc<dyn StsClient>) -> Self {
        Self {
            idp,
            sts,
            role_hint: None,
        }
    }
}

#[async_trait]
impl AuthStrategy for AssertionExchangeStrategy {
    fn name(&self) -> &'static str {
        "assertion-exchange"
    }

    fn prepare(&mut self, next: Option<&IdentityConfig>) -> Result<()> {
        // The exchange cannot proceed without knowing which role the chain
        // wants; fail before any network call.
        let identity = next.ok_or_else(|| {
            Error::InvalidConfig(
                "assertion exchange requires a downstream identity naming assume_role".to_string(),
            )
        })?;
        let role = identity.assume_role.as_ref().ok_or_else(|| {
            Error::InvalidConfig(
                "identity following an assertion-exchange provider must set assume_role"
                    .to_string(),
            )
        })?;
        self.role_hint = Some(role.clone());
        Ok(())
    }

    async fn authenticate(
        &self,
        ctx: &StrategyContext<'_>,
        _upstream: Option<&Credential>,
    ) -> Result<Credential> {
        let idp_url = ctx.config.idp_url.as_deref().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "provider {} uses assertion exchange but has no idp_url",
                ctx.provider_name
            ))
        })?;

        let assertion = self.idp.fetch_assertion(idp_url).await?;
        let assertion = assertion.trim();
        if assertion.is_empty() {
            return Err(Error::AuthenticationFailed(
                "identity provider returned an empty assertion".to_string(),
            ));
        }

        let decoded = BASE64.decode(assertion).map_err(|err| {
            Error::AuthenticationFailed(format!("assertion is not valid base64: {}", err))
        })?;
        let document = String::from_utf8_lossy(&decoded);

        let candidates = extract_role_candidates(&document);
        let selected = select_role(&candidates, self.role_hint.as_deref()).ok_or_else(|| {
            Error::AuthenticationFailed("assertion contained no role attributes".to_string())
        })?;
        debug!(
            provider = ctx.provider_name,
            role = %selected.role,
            candidates = candidates.len(),
            "Selected role from assertion"
        );

        let duration = session_seconds(ctx.config.session_duration.as_deref());
        let creds = self
            .sts
            .assume_role_with_assertion(assertion, selected, duration, ctx.config.region.as_deref())
            .await?;
        Ok(Credential::Aws(creds))
    }
}

/// reqwest-backed [`StsClient`].
pub struct HttpStsClient {
    client: reqwest::Client,
    sts_endpoint: String,
    portal_endpoint: String,
}

impl HttpStsClient {
    pub fn new(region: Option<&str>) -> Self {
        let region = region.unwrap_or("us-east-1");
        Self {
            client: reqwest::Client::new(),
            sts_endpoint: format!("https://sts.{}.amazonaws.com", region),
            portal_endpoint: format!("https://portal.sso.{}.amazonaws.com", region),
        }
    }

    /// Override endpoints (tests point these at a local server).
    pub fn with_endpoints(mut self, sts_endpoint: &str, portal_endpoint: &str) -> Self {
        self.sts_endpoint = sts_endpoint.trim_end_matches('/').to_string();
        self.portal_endpoint = portal_endpoint.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct AssumeRoleWithSamlEnvelope {
    #[serde(rename = "AssumeRoleWithSAMLResponse")]
    response: AssumeRoleWithSamlResponse,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleWithSamlResponse {
    #[serde(rename = "AssumeRoleWithSAMLResult")]
    result: AssumeRoleWithSamlResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleWithSamlResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: String,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleEnvelope {
    #[serde(rename = "AssumeRoleResponse")]
    response: AssumeRoleResponse,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResponse {
    #[serde(rename = "AssumeRoleResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct RoleCredentialsEnvelope {
    #[serde(rename = "roleCredentials")]
    role_credentials: PortalRoleCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalRoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    /// Epoch milliseconds.
    expiration: i64,
}

#[async_trait]
impl StsClient for HttpStsClient {
    async fn assume_role_with_assertion(
        &self,
        assertion_b64: &str,
        candidate: &RoleCandidate,
        duration_seconds: i64,
        region: Option<&str>,
    ) -> Result<AwsCredential> {
        let duration = duration_seconds.to_string();
        let params = [
            ("Action", "AssumeRoleWithSAML"),
            ("Version", "2011-06-15"),
            ("RoleArn", candidate.role.as_str()),
            ("PrincipalArn", candidate.principal.as_str()),
            ("SAMLAssertion", assertion_b64),
            ("DurationSeconds", duration.as_str()),
        ];

        let response = self
            .client
            .post(&self.sts_endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!(
                "assertion exchange rejected: {}",
                body
            )));
        }

        let envelope: AssumeRoleWithSamlEnvelope = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed STS response: {}", err)))?;
        let creds = envelope.response.result.credentials;
        let expiration = DateTime::parse_from_rfc3339(&creds.expiration)
            .map(|dt| dt.with_timezone(&Utc))
            .ok();

        Ok(AwsCredential {
            access_key_id: Some(creds.access_key_id),
            secret_access_key: Some(creds.secret_access_key),
            session_token: Some(creds.session_token),
            expiration,
            region: region.map(str::to_string),
            ..Default::default()
        })
    }

    async fn role_credentials(
        &self,
        portal_token: &str,
        account_id: &str,
        role_name: &str,
        region: Option<&str>,
    ) -> Result<AwsCredential> {
        let url = format!("{}/federation/credentials", self.portal_endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("account_id", account_id), ("role_name", role_name)])
            .header("x-amz-sso_bearer_token", portal_token)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!(
                "role credential resolution failed for {}/{}: {}",
                account_id, role_name, body
            )));
        }

        let envelope: RoleCredentialsEnvelope = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed portal response: {}", err)))?;
        let creds = envelope.role_credentials;

        Ok(AwsCredential {
            access_key_id: Some(creds.access_key_id),
            secret_access_key: Some(creds.secret_access_key),
            session_token: Some(creds.session_token),
            expiration: DateTime::from_timestamp_millis(creds.expiration),
            region: region.map(str::to_string),
            account_id: Some(account_id.to_string()),
            ..Default::default()
        })
    }

    async fn assume_role(
        &self,
        upstream: &AwsCredential,
        role_arn: &str,
        duration_seconds: i64,
        region: Option<&str>,
    ) -> Result<AwsCredential> {
        let (access_key_id, secret_access_key) = match (
            upstream.access_key_id.as_deref(),
            upstream.secret_access_key.as_deref(),
        ) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(Error::InvalidConfig(
                    "chained role assumption requires upstream access keys".to_string(),
                ));
            }
        };

        let endpoint = url::Url::parse(&self.sts_endpoint)
            .map_err(|err| Error::InvalidConfig(format!("invalid STS endpoint: {}", err)))?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| Error::InvalidConfig("STS endpoint has no host".to_string()))?;
        let host = match endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", "AssumeRole")
            .append_pair("Version", "2011-06-15")
            .append_pair("RoleArn", role_arn)
            .append_pair("RoleSessionName", "keybridge")
            .append_pair("DurationSeconds", &duration_seconds.to_string())
            .finish();

        let signing_region = region.unwrap_or("us-east-1");
        let signed = crate::sigv4::sign_post_form(
            &crate::sigv4::SigningKey {
                access_key_id,
                secret_access_key,
                session_token: upstream.session_token.as_deref(),
            },
            signing_region,
            "sts",
            &host,
            endpoint.path(),
            &body,
            Utc::now(),
        )?;

        let mut request = self
            .client
            .post(&self.sts_endpoint)
            .header("Accept", "application/json")
            .header("Content-Type", signed.content_type)
            .header("X-Amz-Date", &signed.amz_date)
            .header("Authorization", &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!(
                "role assumption rejected for {}: {}",
                role_arn, body
            )));
        }

        let envelope: AssumeRoleEnvelope = response
            .json()
            .await
            .map_err(|err| Error::Network(format!("malformed STS response: {}", err)))?;
        let creds = envelope.response.result.credentials;

        Ok(AwsCredential {
            access_key_id: Some(creds.access_key_id),
            secret_access_key: Some(creds.secret_access_key),
            session_token: Some(creds.session_token),
            expiration: DateTime::parse_from_rfc3339(&creds.expiration)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            region: region.map(str::to_string),
            account_id: upstream.account_id.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybridge_core::ProviderConfig;
    use std::sync::Mutex;

    fn candidates() -> Vec<RoleCandidate> {
        vec![
            RoleCandidate {
                role: "arn:aws:iam::111111111111:role/Prod".to_string(),
                principal: "arn:aws:iam::111111111111:saml-provider/corp".to_string(),
            },
            RoleCandidate {
                role: "arn:aws:iam::111111111111:role/DevAccess".to_string(),
                principal: "arn:aws:iam::111111111111:saml-provider/corp".to_string(),
            },
        ]
    }

    #[test]
    fn test_select_role_by_hint() {
        let candidates = candidates();
        let selected = select_role(&candidates, Some("dev")).unwrap();
        assert!(selected.role.ends_with("DevAccess"));
    }

    #[test]
    fn test_select_role_falls_back_to_first() {
        let candidates = candidates();
        let selected = select_role(&candidates, Some("nonexistent")).unwrap();
        assert!(selected.role.ends_with("Prod"));
    }

    #[test]
    fn test_select_role_with_no_candidates() {
        assert!(select_role(&[], Some("dev")).is_none());
    }

    #[test]
    fn test_extract_role_candidates_from_attributes() {
        let document = "<Response><AttributeValue>arn:aws:iam::1:role/Admin,arn:aws:iam::1:saml-provider/corp</AttributeValue>\
            <AttributeValue>arn:aws:iam::1:saml-provider/corp,arn:aws:iam::1:role/ReadOnly</AttributeValue>\
            <AttributeValue>not-a-pair</AttributeValue></Response>";
        let candidates = extract_role_candidates(document);
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].role.ends_with("role/Admin"));
        // Pair order is normalized regardless of source order.
        assert!(candidates[1].role.ends_with("role/ReadOnly"));
        assert!(candidates[1].principal.contains("saml-provider"));
    }

    #[test]
    fn test_session_seconds_clamped() {
        assert_eq!(session_seconds(None), 3_600);
        assert_eq!(session_seconds(Some("not-a-number")), 3_600);
        assert_eq!(session_seconds(Some("600")), 900);
        assert_eq!(session_seconds(Some("90000")), 43_200);
        assert_eq!(session_seconds(Some("7200")), 7_200);
    }

    struct FixedIdp {
        assertion: String,
    }

    #[async_trait]
    impl AssertionClient for FixedIdp {
        async fn fetch_assertion(&self, _idp_url: &str) -> Result<String> {
            Ok(self.assertion.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSts {
        exchanged: Mutex<Option<(RoleCandidate, i64)>>,
    }

    #[async_trait]
    impl StsClient for RecordingSts {
        async fn assume_role_with_assertion(
            &self,
            _assertion_b64: &str,
            candidate: &RoleCandidate,
            duration_seconds: i64,
            region: Option<&str>,
        ) -> Result<AwsCredential> {
            *self.exchanged.lock().unwrap() = Some((candidate.clone(), duration_seconds));
            Ok(AwsCredential {
                access_key_id: Some("AKIATEST".to_string()),
                secret_access_key: Some("secret".to_string()),
                session_token: Some("session".to_string()),
                expiration: Some(Utc::now() + chrono::Duration::hours(1)),
                region: region.map(str::to_string),
                ..Default::default()
            })
        }

        async fn role_credentials(
            &self,
            _portal_token: &str,
            _account_id: &str,
            _role_name: &str,
            _region: Option<&str>,
        ) -> Result<AwsCredential> {
            unreachable!("not used by assertion exchange")
        }

        async fn assume_role(
            &self,
            _upstream: &AwsCredential,
            _role_arn: &str,
            _duration_seconds: i64,
            _region: Option<&str>,
        ) -> Result<AwsCredential> {
            unreachable!("not used by assertion exchange")
        }
    }

    fn saml_config() -> ProviderConfig {
        ProviderConfig {
            idp_url: Some("https://idp.corp.example.com/saml".to_string()),
            region: Some("us-east-1".to_string()),
            session_duration: Some("7200".to_string()),
            ..Default::default()
        }
    }

    fn dev_identity() -> IdentityConfig {
        IdentityConfig {
            via: "saml".to_string(),
            assume_role: Some("DevAccess".to_string()),
            ..Default::default()
        }
    }

    fn encoded_assertion() -> String {
        let document = "<AttributeValue>arn:aws:iam::1:role/Prod,arn:aws:iam::1:saml-provider/corp</AttributeValue>\
            <AttributeValue>arn:aws:iam::1:role/DevAccess,arn:aws:iam::1:saml-provider/corp</AttributeValue>";
        BASE64.encode(document)
    }

    #[tokio::test]
    async fn test_authenticate_selects_hinted_role() {
        let sts = Arc::new(RecordingSts::default());
        let mut strategy = AssertionExchangeStrategy::new(
            Arc::new(FixedIdp {
                assertion: encoded_assertion(),
            }),
            sts.clone(),
        );
        strategy.prepare(Some(&dev_identity())).unwrap();

        let config = saml_config();
        let ctx = StrategyContext {
            provider_name: "saml",
            config: &config,
            interactive: false,
        };
        let credential = strategy.authenticate(&ctx, None).await.unwrap();
        assert!(matches!(credential, Credential::Aws(_)));

        let (candidate, duration) = sts.exchanged.lock().unwrap().clone().unwrap();
        assert!(candidate.role.ends_with("DevAccess"));
        assert_eq!(duration, 7_200);
    }

    #[tokio::test]
    async fn test_empty_assertion_fails() {
        let mut strategy = AssertionExchangeStrategy::new(
            Arc::new(FixedIdp {
                assertion: "  ".to_string(),
            }),
            Arc::new(RecordingSts::default()),
        );
        strategy.prepare(Some(&dev_identity())).unwrap();

        let config = saml_config();
        let ctx = StrategyContext {
            provider_name: "saml",
            config: &config,
            interactive: false,
        };
        let err = strategy.authenticate(&ctx, None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(msg) if msg.contains("empty assertion")));
    }

    #[test]
    fn test_prepare_without_role_reference_fails_fast() {
        let mut strategy = AssertionExchangeStrategy::new(
            Arc::new(FixedIdp {
                assertion: String::new(),
            }),
            Arc::new(RecordingSts::default()),
        );

        let identity = IdentityConfig {
            via: "saml".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            strategy.prepare(Some(&identity)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            strategy.prepare(None),
            Err(Error::InvalidConfig(_))
        ));
    }
}
