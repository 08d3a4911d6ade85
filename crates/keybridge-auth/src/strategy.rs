//! The common contract every authentication strategy implements.

use async_trait::async_trait;
use keybridge_core::{Credential, IdentityConfig, ProviderConfig, Result};

/// Immutable per-attempt context handed to a strategy.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    /// Name of the provider at the head of the chain.
    pub provider_name: &'a str,
    pub config: &'a ProviderConfig,
    /// False under a recognized CI indicator; suppresses user-facing display.
    pub interactive: bool,
}

/// An authentication protocol engine. Strategies turn configuration (and,
/// for identity steps, an upstream credential) into a new credential.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pre-authentication hook, run before any network call. Strategies use
    /// it to record a next-hop hint from the following identity in the
    /// chain (e.g. which role to select out of several).
    fn prepare(&mut self, _next: Option<&IdentityConfig>) -> Result<()> {
        Ok(())
    }

    async fn authenticate(
        &self,
        ctx: &StrategyContext<'_>,
        upstream: Option<&Credential>,
    ) -> Result<Credential>;
}
