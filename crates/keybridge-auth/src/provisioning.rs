//! Identity provisioning: enumerate reachable accounts and roles after a
//! successful authentication and materialize them as identity definitions.

use async_trait::async_trait;
use keybridge_core::{
    Credential, Error, IdentityConfig, ProviderConfig, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// An account visible to the authenticated principal.
#[derive(Debug, Clone)]
pub struct DiscoveredAccount {
    pub account_id: String,
    pub account_name: Option<String>,
}

/// Paginated account/role enumeration boundary.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// One page of accounts plus the continuation token, if any.
    async fn list_accounts(
        &self,
        access_token: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<DiscoveredAccount>, Option<String>)>;

    /// One page of role names for an account.
    async fn list_roles(
        &self,
        access_token: &str,
        account_id: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)>;
}

/// Outcome of one provisioning run. Written wholesale; never merged with a
/// previous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub identities: BTreeMap<String, IdentityConfig>,
    pub account_count: usize,
    pub role_count: usize,
    pub provenance: String,
}

/// Expands the identity registry from the authenticated scope.
pub struct IdentityDiscoverer {
    directory: Arc<dyn AccountDirectory>,
}

impl IdentityDiscoverer {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    /// Enumerate accounts and roles. Returns `Ok(None)` when provisioning is
    /// disabled. An account whose roles cannot be listed is skipped; a
    /// failure listing accounts at all is fatal.
    pub async fn provision(
        &self,
        provider_name: &str,
        config: &ProviderConfig,
        credential: &Credential,
    ) -> Result<Option<ProvisioningResult>> {
        if !config.provision_identities {
            return Ok(None);
        }

        let access_token = match credential {
            Credential::Aws(creds) => creds.access_token.as_deref(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::AuthenticationFailed(format!(
                "identity provisioning for {} requires a portal access token credential",
                provider_name
            ))
        })?;

        let mut identities = BTreeMap::new();
        let mut account_count = 0usize;
        let mut role_count = 0usize;

        let mut page_token: Option<String> = None;
        loop {
            let (accounts, next) = self
                .directory
                .list_accounts(access_token, page_token.as_deref())
                .await?;

            for account in accounts {
                account_count += 1;
                match self.roles_for(access_token, &account.account_id).await {
                    Ok(roles) => {
                        for role in roles {
                            role_count += 1;
                            let name = format!("{}/{}", account.account_id, role);
                            identities.insert(
                                name,
                                IdentityConfig {
                                    via: provider_name.to_string(),
                                    account_id: Some(account.account_id.clone()),
                                    assume_role: Some(role),
                                    region: config.region.clone(),
                                    ..Default::default()
                                },
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            account = %account.account_id,
                            error = %err,
                            "Skipping account: role enumeration failed"
                        );
                    }
                }
            }

            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            provider = provider_name,
            accounts = account_count,
            roles = role_count,
            identities = identities.len(),
            "Identity provisioning complete"
        );

        Ok(Some(ProvisioningResult {
            identities,
            account_count,
            role_count,
            provenance: format!("discovered:{}", provider_name),
        }))
    }

    async fn roles_for(&self, access_token: &str, account_id: &str) -> Result<Vec<String>> {
        let mut roles = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let (page, next) = self
                .directory
                .list_roles(access_token, account_id, page_token.as_deref())
                .await?;
            roles.extend(page);
            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybridge_core::AwsCredential;
    use std::collections::HashMap;

    struct FakeDirectory {
        /// account pages keyed by page token ("" for the first page).
        account_pages: HashMap<String, (Vec<DiscoveredAccount>, Option<String>)>,
        /// roles per account; a missing entry simulates an enumeration
        /// failure for that account.
        roles: HashMap<String, Vec<String>>,
        fail_accounts: bool,
    }

    #[async_trait]
    impl AccountDirectory for FakeDirectory {
        async fn list_accounts(
            &self,
            _access_token: &str,
            page_token: Option<&str>,
        ) -> Result<(Vec<DiscoveredAccount>, Option<String>)> {
            if self.fail_accounts {
                return Err(Error::Network("directory unreachable".to_string()));
            }
            Ok(self
                .account_pages
                .get(page_token.unwrap_or(""))
                .cloned()
                .unwrap_or_default())
        }

        async fn list_roles(
            &self,
            _access_token: &str,
            account_id: &str,
            page_token: Option<&str>,
        ) -> Result<(Vec<String>, Option<String>)> {
            let roles = self.roles.get(account_id).ok_or_else(|| {
                Error::AuthenticationFailed(format!("access denied to {}", account_id))
            })?;
            // Serve roles one per page to exercise pagination.
            let index = page_token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
            let page = vec![roles[index].clone()];
            let next = (index + 1 < roles.len()).then(|| (index + 1).to_string());
            Ok((page, next))
        }
    }

    fn account(id: &str) -> DiscoveredAccount {
        DiscoveredAccount {
            account_id: id.to_string(),
            account_name: None,
        }
    }

    fn portal_credential() -> Credential {
        Credential::Aws(AwsCredential {
            access_token: Some("portal-token".to_string()),
            ..Default::default()
        })
    }

    fn enabled_config() -> ProviderConfig {
        ProviderConfig {
            provision_identities: true,
            region: Some("us-east-1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_returns_none() {
        let discoverer = IdentityDiscoverer::new(Arc::new(FakeDirectory {
            account_pages: HashMap::new(),
            roles: HashMap::new(),
            fail_accounts: false,
        }));
        let result = discoverer
            .provision("sso", &ProviderConfig::default(), &portal_credential())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_wrong_credential_family_is_an_error() {
        let discoverer = IdentityDiscoverer::new(Arc::new(FakeDirectory {
            account_pages: HashMap::new(),
            roles: HashMap::new(),
            fail_accounts: false,
        }));
        let credential = Credential::Gcp(keybridge_core::GcpCredential {
            access_token: "tok".to_string(),
            ..Default::default()
        });
        let err = discoverer
            .provision("sso", &enabled_config(), &credential)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_paginated_discovery_names_identities() {
        let mut account_pages = HashMap::new();
        account_pages.insert(
            "".to_string(),
            (vec![account("111111111111")], Some("page2".to_string())),
        );
        account_pages.insert("page2".to_string(), (vec![account("222222222222")], None));

        let mut roles = HashMap::new();
        roles.insert(
            "111111111111".to_string(),
            vec!["Admin".to_string(), "ReadOnly".to_string()],
        );
        roles.insert("222222222222".to_string(), vec!["Deploy".to_string()]);

        let discoverer = IdentityDiscoverer::new(Arc::new(FakeDirectory {
            account_pages,
            roles,
            fail_accounts: false,
        }));
        let result = discoverer
            .provision("sso", &enabled_config(), &portal_credential())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.account_count, 2);
        assert_eq!(result.role_count, 3);
        assert_eq!(result.identities.len(), 3);
        assert_eq!(result.provenance, "discovered:sso");

        let identity = result.identities.get("111111111111/Admin").unwrap();
        assert_eq!(identity.via, "sso");
        assert_eq!(identity.assume_role.as_deref(), Some("Admin"));
        assert_eq!(identity.region.as_deref(), Some("us-east-1"));
    }

    #[tokio::test]
    async fn test_role_failure_skips_account_only() {
        let mut account_pages = HashMap::new();
        account_pages.insert(
            "".to_string(),
            (vec![account("111111111111"), account("222222222222")], None),
        );
        let mut roles = HashMap::new();
        // 222… has no entry: its role listing fails.
        roles.insert("111111111111".to_string(), vec!["Admin".to_string()]);

        let discoverer = IdentityDiscoverer::new(Arc::new(FakeDirectory {
            account_pages,
            roles,
            fail_accounts: false,
        }));
        let result = discoverer
            .provision("sso", &enabled_config(), &portal_credential())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.account_count, 2);
        assert_eq!(result.role_count, 1);
        assert!(result.identities.contains_key("111111111111/Admin"));
        assert!(!result.identities.keys().any(|k| k.starts_with("222222222222")));
    }

    #[tokio::test]
    async fn test_account_enumeration_failure_is_fatal() {
        let discoverer = IdentityDiscoverer::new(Arc::new(FakeDirectory {
            account_pages: HashMap::new(),
            roles: HashMap::new(),
            fail_accounts: true,
        }));
        let err = discoverer
            .provision("sso", &enabled_config(), &portal_credential())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
