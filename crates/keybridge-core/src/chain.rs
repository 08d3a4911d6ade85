//! Authentication chains: ordered provider → identity sequences.

use crate::config::BrokerConfig;
use crate::error::{Error, Result};

/// An ordered chain of names. The head names a provider; every following
/// element names an identity resolved against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    names: Vec<String>,
}

impl Chain {
    /// Build the chain ending at `name` by following `via` references back
    /// to a provider, then reversing. `name` may be a provider (chain of
    /// length one) or an identity.
    pub fn resolve(config: &BrokerConfig, name: &str) -> Result<Self> {
        if config.providers.contains_key(name) {
            return Ok(Chain {
                names: vec![name.to_string()],
            });
        }

        let mut names = Vec::new();
        let mut current = name.to_string();
        loop {
            let identity = config.identities.get(&current).ok_or_else(|| {
                Error::InvalidConfig(format!("unknown provider or identity: {}", current))
            })?;
            names.push(current.clone());
            if names.len() > config.identities.len() {
                return Err(Error::InvalidConfig(format!(
                    "identity chain for {} contains a cycle",
                    name
                )));
            }
            if config.providers.contains_key(&identity.via) {
                names.push(identity.via.clone());
                break;
            }
            current = identity.via.clone();
        }
        names.reverse();
        Ok(Chain { names })
    }

    /// The provider at the head of the chain.
    pub fn provider(&self) -> &str {
        &self.names[0]
    }

    /// Identity names after the provider, in resolution order.
    pub fn identities(&self) -> &[String] {
        &self.names[1..]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
