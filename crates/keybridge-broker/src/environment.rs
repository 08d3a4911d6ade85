//! Environment projection: turn a terminal credential into the variable set
//! the family's SDKs and CLIs read, and snapshot/restore the ambient state
//! around it.

use keybridge_core::Credential;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const GCP_VARS: &[&str] = &[
    "GOOGLE_CLOUD_PROJECT",
    "CLOUDSDK_CORE_PROJECT",
    "GOOGLE_CLOUD_REGION",
    "CLOUDSDK_COMPUTE_REGION",
    "CLOUDSDK_CONFIG",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GOOGLE_OAUTH_ACCESS_TOKEN",
];

pub const AWS_VARS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_PROFILE",
    "AWS_REGION",
    "AWS_DEFAULT_REGION",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_CONFIG_FILE",
];

pub const AZURE_VARS: &[&str] = &[
    "AZURE_TENANT_ID",
    "AZURE_CLIENT_ID",
    "AZURE_SUBSCRIPTION_ID",
    "AZURE_CONFIG_DIR",
    "AZURE_LOCATION",
];

/// Every variable the projector may set or clear.
pub fn known_vars() -> impl Iterator<Item = &'static str> {
    GCP_VARS
        .iter()
        .chain(AWS_VARS.iter())
        .chain(AZURE_VARS.iter())
        .copied()
}

/// File-system anchors and overrides the projection draws on, resolved by
/// the engine from configuration and the artifacts it just wrote.
#[derive(Debug, Clone, Default)]
pub struct ProjectionContext {
    pub region: Option<String>,
    pub project: Option<String>,
    pub profile: Option<String>,
    pub adc_file: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub credentials_file: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
}

/// Compute the variable map for a credential. Pure: nothing is applied to
/// the process environment here.
pub fn project(credential: &Credential, ctx: &ProjectionContext) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    match credential {
        Credential::Gcp(creds) => {
            if let Some(project) = ctx.project.as_deref().or(creds.project_id.as_deref()) {
                vars.insert("GOOGLE_CLOUD_PROJECT".to_string(), project.to_string());
                vars.insert("CLOUDSDK_CORE_PROJECT".to_string(), project.to_string());
            }
            if let Some(region) = &ctx.region {
                vars.insert("GOOGLE_CLOUD_REGION".to_string(), region.clone());
                vars.insert("CLOUDSDK_COMPUTE_REGION".to_string(), region.clone());
            }
            if let Some(dir) = &ctx.config_dir {
                vars.insert("CLOUDSDK_CONFIG".to_string(), dir.display().to_string());
            }
            // An impersonated token has no refresh token behind it. The
            // authorized-user file shape without one is rejected by several
            // SDKs, so project the raw token instead of a credentials file.
            if creds.refresh_token.is_some() {
                if let Some(path) = &ctx.adc_file {
                    vars.insert(
                        "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                        path.display().to_string(),
                    );
                }
            } else {
                vars.insert(
                    "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
                    creds.access_token.clone(),
                );
            }
        }
        Credential::Aws(creds) => {
            if let (Some(id), Some(secret)) =
                (creds.access_key_id.as_deref(), creds.secret_access_key.as_deref())
            {
                vars.insert("AWS_ACCESS_KEY_ID".to_string(), id.to_string());
                vars.insert("AWS_SECRET_ACCESS_KEY".to_string(), secret.to_string());
                if let Some(session) = &creds.session_token {
                    vars.insert("AWS_SESSION_TOKEN".to_string(), session.clone());
                }
            }
            if let Some(region) = ctx.region.as_deref().or(creds.region.as_deref()) {
                vars.insert("AWS_REGION".to_string(), region.to_string());
                vars.insert("AWS_DEFAULT_REGION".to_string(), region.to_string());
            }
            if let Some(profile) = &ctx.profile {
                vars.insert("AWS_PROFILE".to_string(), profile.clone());
            }
            if let Some(path) = &ctx.credentials_file {
                vars.insert(
                    "AWS_SHARED_CREDENTIALS_FILE".to_string(),
                    path.display().to_string(),
                );
            }
            if let Some(path) = &ctx.config_file {
                vars.insert("AWS_CONFIG_FILE".to_string(), path.display().to_string());
            }
        }
        Credential::Azure(creds) => {
            if let Some(tenant) = &creds.tenant_id {
                vars.insert("AZURE_TENANT_ID".to_string(), tenant.clone());
            }
            if let Some(subscription) = &creds.subscription_id {
                vars.insert("AZURE_SUBSCRIPTION_ID".to_string(), subscription.clone());
            }
            if let Some(location) = &creds.location {
                vars.insert("AZURE_LOCATION".to_string(), location.clone());
            }
            if let Some(dir) = &ctx.config_dir {
                vars.insert("AZURE_CONFIG_DIR".to_string(), dir.display().to_string());
            }
        }
    }
    vars
}

/// Clear every known variable, then set the given subset. Stale variables
/// from an earlier session never leak into the new one.
pub fn prepare_environment(vars: &BTreeMap<String, String>) {
    for name in known_vars() {
        // SAFETY: the process is single-threaded with respect to these
        // writes; callers serialize environment mutation.
        unsafe { std::env::remove_var(name) };
    }
    for (name, value) in vars {
        // SAFETY: as above.
        unsafe { std::env::set_var(name, value) };
    }
}

/// A verbatim copy of the known-variable state, taken before mutation.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    entries: Vec<(String, Option<String>)>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            entries: known_vars()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect(),
        }
    }

    /// Replay the captured state: previously-set variables get their old
    /// values back, previously-unset ones are removed again.
    pub fn restore(&self) {
        for (name, value) in &self.entries {
            match value {
                // SAFETY: callers serialize environment mutation.
                Some(value) => unsafe { std::env::set_var(name, value) },
                None => unsafe { std::env::remove_var(name) },
            }
        }
    }
}

/// Guard that restores the captured environment on drop, on every exit path.
pub struct ScopedEnv {
    snapshot: EnvSnapshot,
}

impl ScopedEnv {
    pub fn apply(vars: &BTreeMap<String, String>) -> Self {
        let snapshot = EnvSnapshot::capture();
        prepare_environment(vars);
        Self { snapshot }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        self.snapshot.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybridge_core::{AwsCredential, AzureCredential, GcpCredential};
    use std::sync::Mutex;

    // Process environment is global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_impersonated_gcp_projects_raw_token() {
        let credential = Credential::Gcp(GcpCredential {
            access_token: "impersonated".to_string(),
            refresh_token: None,
            project_id: Some("acme-prod".to_string()),
            ..Default::default()
        });
        let ctx = ProjectionContext {
            adc_file: Some(PathBuf::from("/tmp/adc.json")),
            ..Default::default()
        };
        let vars = project(&credential, &ctx);
        assert_eq!(vars.get("GOOGLE_OAUTH_ACCESS_TOKEN").unwrap(), "impersonated");
        assert!(!vars.contains_key("GOOGLE_APPLICATION_CREDENTIALS"));
        assert_eq!(vars.get("GOOGLE_CLOUD_PROJECT").unwrap(), "acme-prod");
    }

    #[test]
    fn test_refreshable_gcp_projects_credentials_file() {
        let credential = Credential::Gcp(GcpCredential {
            access_token: "tok".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            ..Default::default()
        });
        let ctx = ProjectionContext {
            adc_file: Some(PathBuf::from("/tmp/adc.json")),
            ..Default::default()
        };
        let vars = project(&credential, &ctx);
        assert_eq!(
            vars.get("GOOGLE_APPLICATION_CREDENTIALS").unwrap(),
            "/tmp/adc.json"
        );
        assert!(!vars.contains_key("GOOGLE_OAUTH_ACCESS_TOKEN"));
    }

    #[test]
    fn test_aws_keys_projection() {
        let credential = Credential::Aws(AwsCredential {
            access_key_id: Some("AKIATEST".to_string()),
            secret_access_key: Some("secret".to_string()),
            session_token: Some("session".to_string()),
            region: Some("eu-west-1".to_string()),
            ..Default::default()
        });
        let ctx = ProjectionContext {
            profile: Some("keybridge".to_string()),
            credentials_file: Some(PathBuf::from("/tmp/credentials")),
            ..Default::default()
        };
        let vars = project(&credential, &ctx);
        assert_eq!(vars.get("AWS_ACCESS_KEY_ID").unwrap(), "AKIATEST");
        assert_eq!(vars.get("AWS_SESSION_TOKEN").unwrap(), "session");
        assert_eq!(vars.get("AWS_DEFAULT_REGION").unwrap(), "eu-west-1");
        assert_eq!(vars.get("AWS_PROFILE").unwrap(), "keybridge");
        assert_eq!(vars.get("AWS_SHARED_CREDENTIALS_FILE").unwrap(), "/tmp/credentials");
    }

    #[test]
    fn test_aws_portal_token_projects_no_keys() {
        let credential = Credential::Aws(AwsCredential {
            access_token: Some("portal".to_string()),
            ..Default::default()
        });
        let vars = project(&credential, &ProjectionContext::default());
        assert!(!vars.contains_key("AWS_ACCESS_KEY_ID"));
        assert!(!vars.contains_key("AWS_SESSION_TOKEN"));
    }

    #[test]
    fn test_azure_projection() {
        let credential = Credential::Azure(AzureCredential {
            access_token: "tok".to_string(),
            token_type: "Bearer".to_string(),
            tenant_id: Some("tenant-1".to_string()),
            subscription_id: Some("sub-1".to_string()),
            location: Some("westeurope".to_string()),
            ..Default::default()
        });
        let vars = project(&credential, &ProjectionContext::default());
        assert_eq!(vars.get("AZURE_TENANT_ID").unwrap(), "tenant-1");
        assert_eq!(vars.get("AZURE_SUBSCRIPTION_ID").unwrap(), "sub-1");
        assert_eq!(vars.get("AZURE_LOCATION").unwrap(), "westeurope");
    }

    #[test]
    fn test_prepare_environment_clears_stale_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("AWS_PROFILE", "stale") };

        let mut vars = BTreeMap::new();
        vars.insert("AWS_REGION".to_string(), "us-east-1".to_string());
        prepare_environment(&vars);

        assert!(std::env::var("AWS_PROFILE").is_err());
        assert_eq!(std::env::var("AWS_REGION").unwrap(), "us-east-1");

        unsafe { std::env::remove_var("AWS_REGION") };
    }

    #[test]
    fn test_snapshot_round_trips_all_three_states() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("AWS_PROFILE", "before");
            std::env::remove_var("AWS_REGION");
        }

        let snapshot = EnvSnapshot::capture();
        unsafe {
            std::env::set_var("AWS_PROFILE", "changed");
            std::env::set_var("AWS_REGION", "introduced");
            std::env::remove_var("AWS_PROFILE");
        }
        snapshot.restore();

        assert_eq!(std::env::var("AWS_PROFILE").unwrap(), "before");
        assert!(std::env::var("AWS_REGION").is_err());

        unsafe { std::env::remove_var("AWS_PROFILE") };
    }

    #[test]
    fn test_scoped_env_restores_on_drop() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("AZURE_TENANT_ID", "original") };

        {
            let mut vars = BTreeMap::new();
            vars.insert("AZURE_TENANT_ID".to_string(), "scoped".to_string());
            let _scope = ScopedEnv::apply(&vars);
            assert_eq!(std::env::var("AZURE_TENANT_ID").unwrap(), "scoped");
        }

        assert_eq!(std::env::var("AZURE_TENANT_ID").unwrap(), "original");
        unsafe { std::env::remove_var("AZURE_TENANT_ID") };
    }
}
