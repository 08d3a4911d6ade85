//! Chain engine for the Keybridge credential broker.
//!
//! Resolves configured targets into authentication chains, executes them
//! through the strategy crate, persists artifacts through the store crate,
//! and projects the resulting credential into the environment.

pub mod engine;
pub mod environment;

pub use engine::{Broker, ClientSet, LoginReport, SessionStatus};
pub use environment::{EnvSnapshot, ProjectionContext, ScopedEnv, prepare_environment, project};
