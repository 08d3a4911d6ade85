//! Core types for the Keybridge credential broker.
//!
//! Defines the credential model, the chain/realm types, the configuration
//! registries, and the shared error taxonomy used across the workspace.

pub mod chain;
pub mod config;
pub mod credential;
pub mod error;
pub mod fingerprint;
pub mod realm;

pub use chain::Chain;
pub use config::{
    BrokerConfig, FederationConfig, IdentityConfig, ProviderConfig, StrategyKind, TokenSource,
};
pub use credential::{AwsCredential, AzureCredential, Credential, GcpCredential, ProviderFamily};
pub use error::{Error, Result};
pub use fingerprint::fingerprint;
pub use realm::{DEFAULT_REALM, Realm};
