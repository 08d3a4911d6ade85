//! OAuth2 Device Authorization grant.
//!
//! Register a client, start the device flow, show the user code once, then
//! poll the token endpoint until the user approves, the flow expires, or the
//! caller cancels.

use crate::strategy::{AuthStrategy, StrategyContext};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use keybridge_core::{
    AwsCredential, AzureCredential, Credential, Error, GcpCredential, ProviderFamily, Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Dynamic client registration result.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
}

/// A started device authorization.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    /// Initial poll interval in seconds.
    pub interval: i64,
    /// Lifetime of the device code in seconds.
    pub expires_in: i64,
}

/// Token returned once the user approves.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: i64,
}

/// One poll of the token endpoint. Pending and slow-down are expected
/// transient states, not errors.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Issued(IssuedToken),
    Pending,
    SlowDown,
}

/// Wire client for the device authorization endpoints.
#[async_trait]
pub trait DeviceFlowClient: Send + Sync {
    async fn register_client(&self, client_name: &str) -> Result<ClientRegistration>;

    async fn start_authorization(
        &self,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceAuthorization>;

    async fn poll_token(
        &self,
        registration: &ClientRegistration,
        authorization: &DeviceAuthorization,
    ) -> Result<PollOutcome>;
}

/// Poll interval state. Slow-down doubles the current interval every time it
/// occurs; the interval never resets within one flow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSchedule {
    interval_secs: u64,
}

impl PollSchedule {
    pub(crate) fn new(interval_secs: i64) -> Self {
        Self {
            interval_secs: interval_secs.max(1) as u64,
        }
    }

    pub(crate) fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub(crate) fn on_slow_down(&mut self) {
        self.interval_secs *= 2;
    }
}

/// Device Authorization strategy.
pub struct DeviceAuthStrategy {
    client: Arc<dyn DeviceFlowClient>,
    cancel: CancellationToken,
}

impl DeviceAuthStrategy {
    pub fn new(client: Arc<dyn DeviceFlowClient>) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a caller-supplied cancellation token; cancelling it aborts the
    /// poll loop immediately with [`Error::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn display(&self, ctx: &StrategyContext<'_>, authorization: &DeviceAuthorization) {
        if !ctx.interactive {
            debug!(
                provider = ctx.provider_name,
                "Non-interactive session; skipping verification display"
            );
            return;
        }
        let uri = authorization
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&authorization.verification_uri);
        info!(
            user_code = %authorization.user_code,
            url = %uri,
            "Open the verification URL and enter the code to approve this login"
        );
    }

    async fn wait(&self, schedule: &PollSchedule) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(schedule.interval()) => Ok(()),
        }
    }
}

#[async_trait]
impl AuthStrategy for DeviceAuthStrategy {
    fn name(&self) -> &'static str {
        "device-authorization"
    }

    async fn authenticate(
        &self,
        ctx: &StrategyContext<'_>,
        _upstream: Option<&Credential>,
    ) -> Result<Credential> {
        let start_url = ctx.config.start_url.as_deref().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "provider {} uses device authorization but has no start_url",
                ctx.provider_name
            ))
        })?;

        let registration = self.client.register_client("keybridge").await?;
        let authorization = self
            .client
            .start_authorization(&registration, start_url)
            .await?;
        self.display(ctx, &authorization);

        let mut schedule = PollSchedule::new(authorization.interval);
        // Attempt budget is fixed from the initial interval; frequent
        // slow-downs can therefore under-poll the full device-code lifetime.
        let attempts = (authorization.expires_in / authorization.interval.max(1)).max(1);

        debug!(
            provider = ctx.provider_name,
            attempts,
            interval_secs = authorization.interval,
            "Polling for device authorization"
        );

        for _ in 0..attempts {
            self.wait(&schedule).await?;
            match self.client.poll_token(&registration, &authorization).await? {
                PollOutcome::Issued(token) => {
                    if token.access_token.is_empty() {
                        break;
                    }
                    let expiration = Utc::now() + Duration::seconds(token.expires_in);
                    debug!(provider = ctx.provider_name, "Device authorization approved");
                    return Ok(token_credential(ctx, token.access_token, expiration));
                }
                PollOutcome::Pending => continue,
                PollOutcome::SlowDown => {
                    schedule.on_slow_down();
                    debug!(
                        interval_secs = schedule.interval().as_secs(),
                        "Token endpoint asked to slow down"
                    );
                }
            }
        }

        Err(Error::AuthenticationFailed(
            "authentication timed out".to_string(),
        ))
    }
}

fn token_credential(
    ctx: &StrategyContext<'_>,
    access_token: String,
    expiration: chrono::DateTime<Utc>,
) -> Credential {
    match ctx.config.family {
        ProviderFamily::Aws => Credential::Aws(AwsCredential {
            access_token: Some(access_token),
            expiration: Some(expiration),
            region: ctx.config.region.clone(),
            ..Default::default()
        }),
        ProviderFamily::Gcp => Credential::Gcp(GcpCredential {
            access_token,
            token_expiry: Some(expiration),
            project_id: ctx.config.project_id.clone(),
            ..Default::default()
        }),
        ProviderFamily::Azure => Credential::Azure(AzureCredential {
            access_token,
            token_type: "Bearer".to_string(),
            expires_at: Some(expiration),
            tenant_id: ctx.config.tenant_id.clone(),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybridge_core::ProviderConfig;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        outcomes: Mutex<VecDeque<Result<PollOutcome>>>,
        poll_times: Mutex<Vec<tokio::time::Instant>>,
        registrations: AtomicUsize,
        interval: i64,
        expires_in: i64,
    }

    impl ScriptedClient {
        fn new(outcomes: Vec<Result<PollOutcome>>, interval: i64, expires_in: i64) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                poll_times: Mutex::new(Vec::new()),
                registrations: AtomicUsize::new(0),
                interval,
                expires_in,
            }
        }
    }

    #[async_trait]
    impl DeviceFlowClient for ScriptedClient {
        async fn register_client(&self, _client_name: &str) -> Result<ClientRegistration> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(ClientRegistration {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
            })
        }

        async fn start_authorization(
            &self,
            _registration: &ClientRegistration,
            _start_url: &str,
        ) -> Result<DeviceAuthorization> {
            Ok(DeviceAuthorization {
                device_code: "device".to_string(),
                user_code: "ABCD-EFGH".to_string(),
                verification_uri: "https://device.example.com/verify".to_string(),
                verification_uri_complete: None,
                interval: self.interval,
                expires_in: self.expires_in,
            })
        }

        async fn poll_token(
            &self,
            _registration: &ClientRegistration,
            _authorization: &DeviceAuthorization,
        ) -> Result<PollOutcome> {
            self.poll_times.lock().unwrap().push(tokio::time::Instant::now());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollOutcome::Pending))
        }
    }

    fn aws_device_config() -> ProviderConfig {
        ProviderConfig {
            start_url: Some("https://corp.awsapps.com/start".to_string()),
            region: Some("us-east-1".to_string()),
            ..Default::default()
        }
    }

    fn ctx<'a>(config: &'a ProviderConfig) -> StrategyContext<'a> {
        StrategyContext {
            provider_name: "sso",
            config,
            interactive: false,
        }
    }

    #[test]
    fn test_slow_down_doubles_monotonically() {
        let mut schedule = PollSchedule::new(5);
        assert_eq!(schedule.interval().as_secs(), 5);
        schedule.on_slow_down();
        assert_eq!(schedule.interval().as_secs(), 10);
        schedule.on_slow_down();
        assert_eq!(schedule.interval().as_secs(), 20);
    }

    #[test]
    fn test_schedule_floors_nonpositive_interval() {
        assert_eq!(PollSchedule::new(0).interval().as_secs(), 1);
        assert_eq!(PollSchedule::new(-3).interval().as_secs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_slow_down_then_success() {
        let client = Arc::new(ScriptedClient::new(
            vec![
                Ok(PollOutcome::Pending),
                Ok(PollOutcome::Pending),
                Ok(PollOutcome::SlowDown),
                Ok(PollOutcome::Issued(IssuedToken {
                    access_token: "portal-token".to_string(),
                    expires_in: 3600,
                })),
            ],
            5,
            600,
        ));
        let strategy = DeviceAuthStrategy::new(client.clone());
        let config = aws_device_config();

        let credential = strategy.authenticate(&ctx(&config), None).await.unwrap();
        assert_eq!(credential.access_token(), Some("portal-token"));

        // The gap after the slow-down must be strictly larger than before.
        let times = client.poll_times.lock().unwrap();
        assert_eq!(times.len(), 4);
        let before = times[2] - times[1];
        let after = times[3] - times[2];
        assert!(after > before, "after={:?} before={:?}", after, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_polls_time_out() {
        let client = Arc::new(ScriptedClient::new(Vec::new(), 5, 10));
        let strategy = DeviceAuthStrategy::new(client.clone());
        let config = aws_device_config();

        let err = strategy.authenticate(&ctx(&config), None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(msg) if msg.contains("timed out")));
        assert_eq!(client.poll_times.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_polling() {
        let client = Arc::new(ScriptedClient::new(Vec::new(), 5, 600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let strategy = DeviceAuthStrategy::new(client).with_cancellation(cancel);
        let config = aws_device_config();

        let err = strategy.authenticate(&ctx(&config), None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_error_fails_immediately() {
        let client = Arc::new(ScriptedClient::new(
            vec![
                Ok(PollOutcome::Pending),
                Err(Error::AuthenticationFailed("access denied".to_string())),
            ],
            5,
            600,
        ));
        let strategy = DeviceAuthStrategy::new(client.clone());
        let config = aws_device_config();

        let err = strategy.authenticate(&ctx(&config), None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(msg) if msg.contains("access denied")));
        assert_eq!(client.poll_times.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_start_url_is_invalid_config() {
        let client = Arc::new(ScriptedClient::new(Vec::new(), 5, 600));
        let strategy = DeviceAuthStrategy::new(client);
        let config = ProviderConfig::default();

        let err = strategy.authenticate(&ctx(&config), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
