//! Credential model shared by every provider family.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider family a credential or configuration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Aws,
    Gcp,
    Azure,
}

impl ProviderFamily {
    /// Directory segment used in the on-disk credential layout.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::Aws => "aws",
            ProviderFamily::Gcp => "gcp",
            ProviderFamily::Azure => "azure",
        }
    }
}

/// AWS credential: either a key triple (after role resolution) or a portal
/// access token (device-flow base credential, before role resolution).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl AwsCredential {
    /// True when the credential holds a usable key triple.
    pub fn has_keys(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcpCredential {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureCredential {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A short-lived cloud credential produced by an authentication chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Credential {
    Aws(AwsCredential),
    Gcp(GcpCredential),
    Azure(AzureCredential),
}

impl Credential {
    pub fn family(&self) -> ProviderFamily {
        match self {
            Credential::Aws(_) => ProviderFamily::Aws,
            Credential::Gcp(_) => ProviderFamily::Gcp,
            Credential::Azure(_) => ProviderFamily::Azure,
        }
    }

    /// The bearer token carried by this credential, when it has one.
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Credential::Aws(creds) => creds.access_token.as_deref(),
            Credential::Gcp(creds) => Some(creds.access_token.as_str()),
            Credential::Azure(creds) => Some(creds.access_token.as_str()),
        }
    }

    /// Absolute expiry. A credential without one is not cacheable.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        match self {
            Credential::Aws(creds) => creds.expiration,
            Credential::Gcp(creds) => creds.token_expiry,
            Credential::Azure(creds) => creds.expires_at,
        }
    }

    /// Check if the credential is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        let buffer = chrono::Duration::minutes(5);
        self.expiration()
            .map(|exp| Utc::now() + buffer > exp)
            .unwrap_or(false)
    }

    /// The principal this credential acts as, for display purposes.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Credential::Aws(creds) => creds.account_id.as_deref(),
            Credential::Gcp(creds) => creds.account.as_deref(),
            Credential::Azure(creds) => creds.tenant_id.as_deref(),
        }
    }
}
