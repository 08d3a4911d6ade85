//! Realm-isolated credential storage for Keybridge.
//!
//! Three layers: the path resolver computes validated, owner-only locations;
//! the file store reads/writes/cleans credential artifacts; the token cache
//! keeps access tokens across invocations so repeated logins stay cheap.

pub mod artifacts;
pub mod cache;
pub mod files;
pub mod paths;

pub use artifacts::{
    AdcCredentialFile, render_access_token, render_aws_config, render_aws_credentials,
    render_properties,
};
pub use cache::{CachedToken, TokenCache};
pub use files::FileStore;
pub use paths::{ArtifactScope, PathResolver, validate_segment};
