//! The chain engine: resolves a target to its authentication chain, runs the
//! provider strategy cache-first, applies identity steps in order, persists
//! the terminal credential, and projects the environment.

use crate::environment::{self, EnvSnapshot, ProjectionContext};
use chrono::{DateTime, Utc};
use keybridge_auth::ambient::{AmbientCredentialStrategy, AmbientTokenSource};
use keybridge_auth::assertion::{
    AssertionClient, AssertionExchangeStrategy, StsClient, session_seconds,
};
use keybridge_auth::device::{DeviceAuthStrategy, DeviceFlowClient};
use keybridge_auth::federation::{FederatedExchangeStrategy, ImpersonationClient};
use keybridge_auth::provisioning::{AccountDirectory, IdentityDiscoverer, ProvisioningResult};
use keybridge_auth::strategy::{AuthStrategy, StrategyContext};
use keybridge_core::{
    AwsCredential, AzureCredential, BrokerConfig, Chain, Credential, Error, GcpCredential,
    IdentityConfig, ProviderConfig, ProviderFamily, Realm, Result, StrategyKind, fingerprint,
};
use keybridge_store::artifacts::{
    AdcCredentialFile, render_access_token, render_aws_config, render_aws_credentials,
    render_properties,
};
use keybridge_store::cache::{CachedToken, TokenCache};
use keybridge_store::files::FileStore;
use keybridge_store::paths::ArtifactScope;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADC_FILE: &str = "application_default_credentials.json";
const ACCESS_TOKEN_FILE: &str = "access_token";
const DISCOVERED_FILE: &str = "discovered_identities.json";
const AWS_PROFILE_NAME: &str = "keybridge";
const DEFAULT_IMPERSONATION_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const EXPIRATION_COMMENT: &str = "# keybridge: expiration=";

/// Constructor-injected protocol clients. Production wiring uses the HTTP
/// implementations; tests substitute fakes.
#[derive(Clone)]
pub struct ClientSet {
    pub device: Arc<dyn DeviceFlowClient>,
    pub assertion: Arc<dyn AssertionClient>,
    pub sts: Arc<dyn StsClient>,
    pub impersonation: Arc<dyn ImpersonationClient>,
    pub ambient: Arc<dyn AmbientTokenSource>,
    pub directory: Arc<dyn AccountDirectory>,
}

/// Everything a completed login produced.
#[derive(Debug)]
pub struct LoginReport {
    pub credential: Credential,
    /// Variable map for the terminal credential; apply with
    /// [`environment::prepare_environment`] or [`Broker::activate`].
    pub environment: BTreeMap<String, String>,
    pub artifacts: Vec<PathBuf>,
    pub provisioned: Option<ProvisioningResult>,
    /// A provisioning failure after a successful authentication is reported
    /// here instead of failing the login.
    pub provisioning_error: Option<String>,
}

/// Stored-session summary, assembled without any network call.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub provider: String,
    pub identity: String,
    pub family: ProviderFamily,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

pub struct Broker {
    config: BrokerConfig,
    realm: Realm,
    store: FileStore,
    cache: TokenCache,
    clients: ClientSet,
    cancel: CancellationToken,
    /// Ambient state captured by [`Broker::activate`], replayed on logout.
    snapshot: Mutex<Option<EnvSnapshot>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, store: FileStore, clients: ClientSet) -> Result<Self> {
        let realm = Realm::from_config(config.realm.as_deref())?;
        let cache = TokenCache::new(store.resolver().cache_dir(&realm));
        Ok(Self {
            config,
            realm,
            store,
            cache,
            clients,
            cancel: CancellationToken::new(),
            snapshot: Mutex::new(None),
        })
    }

    /// Cancelling the token aborts any in-flight interactive flow.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Authenticate the named target: resolve its chain, run the provider
    /// step cache-first, then each identity step in order, persist the
    /// terminal credential, and compute the environment projection.
    pub async fn login(&self, target: &str) -> Result<LoginReport> {
        let chain = Chain::resolve(&self.config, target)?;
        let provider_name = chain.provider();
        let provider = self.provider_config(provider_name)?;

        let mut credential = self.provider_step(&chain, provider_name, provider).await?;
        debug!(
            provider = provider_name,
            family = provider.family.as_str(),
            "Provider step complete"
        );

        // Provisioning consumes the base credential, before any identity
        // narrows it.
        let (provisioned, provisioning_error) = self
            .run_provisioning(provider_name, provider, &credential)
            .await;

        for identity_name in chain.identities() {
            let identity = self
                .config
                .identities
                .get(identity_name)
                .ok_or_else(|| Error::NotFound(format!("identity {}", identity_name)))?;
            credential = self
                .identity_step(identity_name, identity, credential)
                .await?;
            debug!(identity = identity_name.as_str(), "Identity step complete");
        }

        let segment = terminal_segment(&chain);
        let (artifacts, ctx) = self
            .persist(provider_name, provider, &segment, &credential)
            .await?;
        let environment = environment::project(&credential, &ctx);

        let mut report = LoginReport {
            credential,
            environment,
            artifacts,
            provisioned,
            provisioning_error,
        };

        if let Some(result) = &report.provisioned {
            match serde_json::to_vec_pretty(result) {
                Ok(bytes) => {
                    let path = self
                        .store
                        .write(
                            &self.realm,
                            provider.family,
                            provider_name,
                            ArtifactScope::Config,
                            provider_name,
                            DISCOVERED_FILE,
                            &bytes,
                        )
                        .await?;
                    report.artifacts.push(path);
                }
                Err(err) => warn!(error = %err, "Could not serialize discovered identities"),
            }
        }

        info!(
            target = target,
            provider = provider_name,
            identities = chain.identities().len(),
            "Login complete"
        );
        Ok(report)
    }

    /// Apply a login's environment to this process, remembering the prior
    /// state for [`Broker::logout`].
    pub fn activate(&self, report: &LoginReport) {
        let captured = EnvSnapshot::capture();
        environment::prepare_environment(&report.environment);
        if let Ok(mut slot) = self.snapshot.lock() {
            slot.get_or_insert(captured);
        }
    }

    /// Tear the session down: restore the environment captured by
    /// [`Broker::activate`], drop the cache entry, and delete every stored
    /// artifact for the provider. Missing targets are success.
    pub async fn logout(&self, target: &str) -> Result<()> {
        let chain = Chain::resolve(&self.config, target)?;
        let provider_name = chain.provider();
        let provider = self.provider_config(provider_name)?;

        if let Ok(mut slot) = self.snapshot.lock() {
            if let Some(snapshot) = slot.take() {
                snapshot.restore();
            }
        }

        self.cache.delete(provider_name).await;
        self.store
            .cleanup_provider(&self.realm, provider.family, provider_name)
            .await?;
        info!(target = target, provider = provider_name, "Logout complete");
        Ok(())
    }

    /// Report the stored session for a target from disk alone.
    pub async fn whoami(&self, target: &str) -> Result<SessionStatus> {
        let chain = Chain::resolve(&self.config, target)?;
        let provider_name = chain.provider();
        let provider = self.provider_config(provider_name)?;
        let segment = terminal_segment(&chain);

        let expires_at = self
            .stored_expiry(provider_name, provider.family, &segment)
            .await?;
        Ok(SessionStatus {
            provider: provider_name.to_string(),
            identity: segment,
            family: provider.family,
            expired: expires_at.map(|at| at <= Utc::now()).unwrap_or(false),
            expires_at,
        })
    }

    fn provider_config(&self, name: &str) -> Result<&ProviderConfig> {
        self.config
            .providers
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("provider {}", name)))
    }

    async fn provider_step(
        &self,
        chain: &Chain,
        provider_name: &str,
        provider: &ProviderConfig,
    ) -> Result<Credential> {
        let fp = provider_fingerprint(provider);
        if let Some(entry) = self.cache.load(provider_name, &fp).await {
            debug!(provider = provider_name, "Reusing cached provider token");
            return Ok(cached_credential(provider, entry));
        }

        let mut strategy = self.build_strategy(provider);
        let first_identity = chain
            .identities()
            .first()
            .and_then(|name| self.config.identities.get(name));
        strategy.prepare(first_identity)?;

        let ctx = StrategyContext {
            provider_name,
            config: provider,
            interactive: interactive(),
        };
        let credential = strategy.authenticate(&ctx, None).await?;

        if let (Some(token), Some(expires_at)) =
            (credential.access_token(), credential.expiration())
        {
            self.cache
                .save(
                    provider_name,
                    &CachedToken {
                        access_token: token.to_string(),
                        expires_at,
                        fingerprint: fp,
                    },
                )
                .await;
        }
        Ok(credential)
    }

    fn build_strategy(&self, provider: &ProviderConfig) -> Box<dyn AuthStrategy> {
        match provider.strategy {
            StrategyKind::DeviceAuthorization => Box::new(
                DeviceAuthStrategy::new(self.clients.device.clone())
                    .with_cancellation(self.cancel.clone()),
            ),
            StrategyKind::AssertionExchange => Box::new(AssertionExchangeStrategy::new(
                self.clients.assertion.clone(),
                self.clients.sts.clone(),
            )),
            StrategyKind::FederatedExchange => Box::new(FederatedExchangeStrategy::new(
                self.clients.impersonation.clone(),
            )),
            StrategyKind::AmbientCredential => Box::new(AmbientCredentialStrategy::new(
                self.clients.ambient.clone(),
            )),
        }
    }

    async fn run_provisioning(
        &self,
        provider_name: &str,
        provider: &ProviderConfig,
        credential: &Credential,
    ) -> (Option<ProvisioningResult>, Option<String>) {
        if !provider.provision_identities {
            return (None, None);
        }
        let discoverer = IdentityDiscoverer::new(self.clients.directory.clone());
        match discoverer.provision(provider_name, provider, credential).await {
            Ok(result) => (result, None),
            Err(err) => {
                warn!(provider = provider_name, error = %err, "Identity provisioning failed");
                (None, Some(err.to_string()))
            }
        }
    }

    async fn identity_step(
        &self,
        identity_name: &str,
        identity: &IdentityConfig,
        upstream: Credential,
    ) -> Result<Credential> {
        if let Some(service_account) = &identity.service_account {
            return self
                .impersonation_step(identity_name, identity, service_account, upstream)
                .await;
        }
        if let Some(role) = &identity.assume_role {
            return self.role_step(identity_name, identity, role, upstream).await;
        }
        // A bare identity only refines metadata.
        Ok(refine(upstream, identity))
    }

    async fn impersonation_step(
        &self,
        identity_name: &str,
        identity: &IdentityConfig,
        service_account: &str,
        upstream: Credential,
    ) -> Result<Credential> {
        let creds = match upstream {
            Credential::Gcp(creds) => creds,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "identity {} impersonates a service account but its chain yields {} credentials",
                    identity_name,
                    other.family().as_str()
                )));
            }
        };

        let scopes = if creds.scopes.is_empty() {
            vec![DEFAULT_IMPERSONATION_SCOPE.to_string()]
        } else {
            creds.scopes.clone()
        };
        let lifetime = identity
            .session_duration
            .as_deref()
            .map(|seconds| format!("{}s", seconds.trim()))
            .unwrap_or_else(|| "3600s".to_string());

        // Impersonation failure after a successful base authentication is
        // fatal: a partial fallback would act as the wrong principal.
        let token = self
            .clients
            .impersonation
            .generate_access_token(&creds.access_token, service_account, &scopes, &lifetime)
            .await?;

        let project_id = identity
            .project_id
            .clone()
            .or_else(|| project_from_service_account(service_account))
            .or(creds.project_id);
        Ok(Credential::Gcp(GcpCredential {
            access_token: token.access_token,
            refresh_token: None,
            token_expiry: Some(token.expire_time),
            project_id,
            account: Some(service_account.to_string()),
            scopes,
        }))
    }

    async fn role_step(
        &self,
        identity_name: &str,
        identity: &IdentityConfig,
        role: &str,
        upstream: Credential,
    ) -> Result<Credential> {
        let creds = match upstream {
            Credential::Aws(creds) => creds,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "identity {} assumes a role but its chain yields {} credentials",
                    identity_name,
                    other.family().as_str()
                )));
            }
        };
        let region = identity.region.as_deref().or(creds.region.as_deref());

        if let Some(portal_token) = creds.access_token.as_deref() {
            let account_id = identity.account_id.as_deref().ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "identity {} resolves a role from a portal token and must set account_id",
                    identity_name
                ))
            })?;
            return self
                .clients
                .sts
                .role_credentials(portal_token, account_id, role, region)
                .await
                .map(Credential::Aws);
        }

        if creds.has_keys() {
            let role_arn = if role.starts_with("arn:") {
                role.to_string()
            } else {
                let account_id = identity
                    .account_id
                    .as_deref()
                    .or(creds.account_id.as_deref())
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "identity {} names role {} without an account_id to qualify it",
                            identity_name, role
                        ))
                    })?;
                format!("arn:aws:iam::{}:role/{}", account_id, role)
            };
            let duration = session_seconds(identity.session_duration.as_deref());
            return self
                .clients
                .sts
                .assume_role(&creds, &role_arn, duration, region)
                .await
                .map(Credential::Aws);
        }

        Err(Error::AuthenticationFailed(format!(
            "identity {} has no upstream portal token or access keys to assume {} with",
            identity_name, role
        )))
    }

    async fn persist(
        &self,
        provider_name: &str,
        provider: &ProviderConfig,
        segment: &str,
        credential: &Credential,
    ) -> Result<(Vec<PathBuf>, ProjectionContext)> {
        let mut artifacts = Vec::new();
        let mut ctx = ProjectionContext::default();

        match credential {
            Credential::Gcp(creds) => {
                if creds.refresh_token.is_some() {
                    let adc = AdcCredentialFile::authorized_user(creds);
                    let path = self
                        .write_artifact(provider, provider_name, ArtifactScope::Adc, segment, ADC_FILE, &adc.to_json()?)
                        .await?;
                    ctx.adc_file = Some(path.clone());
                    artifacts.push(path);
                } else if let Some(federation) = &provider.federation {
                    // Token-less file shape: SDKs re-derive the credential
                    // from the federation source when they read it.
                    let adc = AdcCredentialFile::external_account(federation);
                    let path = self
                        .write_artifact(provider, provider_name, ArtifactScope::Adc, segment, ADC_FILE, &adc.to_json()?)
                        .await?;
                    artifacts.push(path);
                }

                let project = creds
                    .project_id
                    .as_deref()
                    .or(provider.project_id.as_deref());
                let properties = render_properties(project, provider.region.as_deref());
                let path = self
                    .write_artifact(provider, provider_name, ArtifactScope::Config, segment, "properties", properties.as_bytes())
                    .await?;
                ctx.config_dir = path.parent().map(PathBuf::from);
                artifacts.push(path);

                let token = render_access_token(&creds.access_token, creds.token_expiry);
                let path = self
                    .write_artifact(provider, provider_name, ArtifactScope::Config, segment, ACCESS_TOKEN_FILE, token.as_bytes())
                    .await?;
                artifacts.push(path);

                ctx.project = project.map(str::to_string);
                ctx.region = provider.region.clone();
            }
            Credential::Aws(creds) => {
                if creds.has_keys() {
                    let rendered = render_aws_credentials(AWS_PROFILE_NAME, creds);
                    let path = self
                        .write_artifact(provider, provider_name, ArtifactScope::Config, segment, "credentials", rendered.as_bytes())
                        .await?;
                    ctx.credentials_file = Some(path.clone());
                    artifacts.push(path);

                    let region = creds.region.as_deref().or(provider.region.as_deref());
                    let rendered = render_aws_config(AWS_PROFILE_NAME, region);
                    let path = self
                        .write_artifact(provider, provider_name, ArtifactScope::Config, segment, "config", rendered.as_bytes())
                        .await?;
                    ctx.config_file = Some(path.clone());
                    artifacts.push(path);

                    ctx.profile = Some(AWS_PROFILE_NAME.to_string());
                    ctx.region = region.map(str::to_string);
                } else if let Some(token) = &creds.access_token {
                    let rendered = render_access_token(token, creds.expiration);
                    let path = self
                        .write_artifact(provider, provider_name, ArtifactScope::Config, segment, ACCESS_TOKEN_FILE, rendered.as_bytes())
                        .await?;
                    artifacts.push(path);
                    ctx.region = creds.region.clone().or(provider.region.clone());
                }
            }
            Credential::Azure(creds) => {
                let rendered = render_access_token(&creds.access_token, creds.expires_at);
                let path = self
                    .write_artifact(provider, provider_name, ArtifactScope::Config, segment, ACCESS_TOKEN_FILE, rendered.as_bytes())
                    .await?;
                ctx.config_dir = path.parent().map(PathBuf::from);
                artifacts.push(path);
            }
        }

        Ok((artifacts, ctx))
    }

    async fn write_artifact(
        &self,
        provider: &ProviderConfig,
        provider_name: &str,
        scope: ArtifactScope,
        segment: &str,
        artifact: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        self.store
            .write(
                &self.realm,
                provider.family,
                provider_name,
                scope,
                segment,
                artifact,
                content,
            )
            .await
    }

    async fn stored_expiry(
        &self,
        provider_name: &str,
        family: ProviderFamily,
        segment: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        match self
            .store
            .read(&self.realm, family, provider_name, ArtifactScope::Config, segment, ACCESS_TOKEN_FILE)
            .await
        {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                return Ok(text.lines().nth(1).and_then(parse_rfc3339));
            }
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let bytes = self
            .store
            .read(&self.realm, family, provider_name, ArtifactScope::Config, segment, "credentials")
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::NotFound(format!(
                    "no stored session for {}/{}",
                    provider_name, segment
                )),
                other => other,
            })?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text
            .lines()
            .find_map(|line| line.strip_prefix(EXPIRATION_COMMENT))
            .and_then(parse_rfc3339))
    }
}

/// Interactive unless a CI indicator is set to a non-empty value.
fn interactive() -> bool {
    std::env::var("CI").map(|value| value.is_empty()).unwrap_or(true)
}

/// The on-disk identity segment for a chain's terminal step. Role names may
/// contain path characters; those are flattened.
fn terminal_segment(chain: &Chain) -> String {
    let name = chain
        .identities()
        .last()
        .map(String::as_str)
        .unwrap_or_else(|| chain.provider());
    name.replace(['/', '\\', ':'], "_")
}

fn provider_fingerprint(provider: &ProviderConfig) -> String {
    let scopes = provider.scopes.join(",");
    let audience = provider
        .federation
        .as_ref()
        .map(|federation| federation.audience.as_str())
        .unwrap_or("");
    fingerprint(&[
        provider.family.as_str(),
        strategy_label(provider.strategy),
        provider.region.as_deref().unwrap_or(""),
        provider.start_url.as_deref().unwrap_or(""),
        provider.idp_url.as_deref().unwrap_or(""),
        audience,
        &scopes,
    ])
}

fn strategy_label(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::DeviceAuthorization => "device-authorization",
        StrategyKind::AssertionExchange => "assertion-exchange",
        StrategyKind::FederatedExchange => "federated-exchange",
        StrategyKind::AmbientCredential => "ambient-credential",
    }
}

fn cached_credential(provider: &ProviderConfig, entry: CachedToken) -> Credential {
    match provider.family {
        ProviderFamily::Aws => Credential::Aws(AwsCredential {
            access_token: Some(entry.access_token),
            expiration: Some(entry.expires_at),
            region: provider.region.clone(),
            ..Default::default()
        }),
        ProviderFamily::Gcp => Credential::Gcp(GcpCredential {
            access_token: entry.access_token,
            token_expiry: Some(entry.expires_at),
            project_id: provider.project_id.clone(),
            ..Default::default()
        }),
        ProviderFamily::Azure => Credential::Azure(AzureCredential {
            access_token: entry.access_token,
            token_type: "Bearer".to_string(),
            expires_at: Some(entry.expires_at),
            tenant_id: provider.tenant_id.clone(),
            ..Default::default()
        }),
    }
}

fn refine(credential: Credential, identity: &IdentityConfig) -> Credential {
    match credential {
        Credential::Aws(mut creds) => {
            if identity.region.is_some() {
                creds.region = identity.region.clone();
            }
            if identity.account_id.is_some() {
                creds.account_id = identity.account_id.clone();
            }
            Credential::Aws(creds)
        }
        Credential::Gcp(mut creds) => {
            if identity.project_id.is_some() {
                creds.project_id = identity.project_id.clone();
            }
            Credential::Gcp(creds)
        }
        other => other,
    }
}

/// `name@PROJECT.iam.gserviceaccount.com` carries the project in its domain.
fn project_from_service_account(email: &str) -> Option<String> {
    let domain = email.split('@').nth(1)?;
    let project = domain.strip_suffix(".iam.gserviceaccount.com")?;
    (!project.is_empty()).then(|| project.to_string())
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
