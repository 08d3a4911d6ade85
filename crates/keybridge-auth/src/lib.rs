//! Authentication strategies for the credential broker.
//!
//! Each strategy implements [`AuthStrategy`] and produces a family-typed
//! credential. Network seams are trait objects so every flow can be driven
//! by fakes in tests.

pub mod ambient;
pub mod assertion;
pub mod device;
pub mod federation;
pub mod provisioning;
mod sigv4;
pub mod strategy;

pub use ambient::{AdcTokenSource, AmbientCredentialStrategy, AmbientToken, AmbientTokenSource};
pub use assertion::{
    AssertionClient, AssertionExchangeStrategy, HttpStsClient, RoleCandidate, StsClient,
};
pub use device::{
    ClientRegistration, DeviceAuthStrategy, DeviceAuthorization, DeviceFlowClient, IssuedToken,
    PollOutcome,
};
pub use federation::{
    FederatedExchangeStrategy, HttpImpersonationClient, ImpersonatedToken, ImpersonationClient,
};
pub use provisioning::{
    AccountDirectory, DiscoveredAccount, IdentityDiscoverer, ProvisioningResult,
};
pub use strategy::{AuthStrategy, StrategyContext};
