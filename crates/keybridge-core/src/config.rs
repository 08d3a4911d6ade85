//! Configuration registry types.
//!
//! Schema parsing and validation live outside this workspace; the broker
//! consumes these already-typed registries.

use crate::credential::ProviderFamily;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which authentication strategy a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    DeviceAuthorization,
    AssertionExchange,
    FederatedExchange,
    AmbientCredential,
}

/// Where the external OIDC token for federated exchange comes from.
/// Exactly one source is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    /// Read from a named environment variable. The name is always explicit:
    /// common CI variables hold a request token, not the identity token.
    Environment { variable: String },
    /// Read from a local file; content is trimmed and must be non-empty.
    File { path: String },
    /// Fetch from an HTTPS endpoint on the allow-list.
    Url {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
    },
}

/// Workload-identity-federation settings for the federated-exchange strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// STS audience naming the workload identity pool provider.
    pub audience: String,
    /// STS token-exchange endpoint; the Google STS default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    pub token_source: TokenSource,
    /// Hosts a URL token source may talk to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,
    /// Service identity to impersonate with the federated token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Impersonated-token lifetime, e.g. "3600s".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_lifetime: Option<String>,
}

/// A configured provider: the head of an authentication chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub family: ProviderFamily,
    pub strategy: StrategyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Device-flow portal start URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    /// Identity-provider endpoint for assertion exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idp_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Requested session duration in seconds, as written in configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federation: Option<FederationConfig>,
    /// Enumerate reachable accounts/roles after authentication.
    #[serde(default)]
    pub provision_identities: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            family: ProviderFamily::Aws,
            strategy: StrategyKind::DeviceAuthorization,
            region: None,
            start_url: None,
            idp_url: None,
            scopes: Vec::new(),
            session_duration: None,
            federation: None,
            provision_identities: false,
            project_id: None,
            tenant_id: None,
        }
    }
}

/// A configured identity: a delegation step consuming an upstream credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// The provider or identity this step authenticates through.
    pub via: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Role to assume (name or full principal identifier).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assume_role: Option<String>,
    /// Service identity to impersonate (GCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// The full registry the broker resolves chains against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub identities: BTreeMap<String, IdentityConfig>,
}
