//! Realm: the namespace isolating one configuration's credential storage.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Realm used when the configuration does not name one.
pub const DEFAULT_REALM: &str = "default";

/// A validated storage namespace. Two distinct realms never share a
/// credential path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Realm(String);

impl Realm {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." {
            return Err(Error::InvalidConfig(format!(
                "invalid realm name: {:?}",
                name
            )));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(Error::InvalidConfig(format!(
                "realm name must not contain path separators: {:?}",
                name
            )));
        }
        Ok(Realm(name))
    }

    /// Build from an optional configured name, falling back to the default.
    pub fn from_config(name: Option<&str>) -> Result<Self> {
        match name {
            Some(name) => Realm::new(name),
            None => Realm::new(DEFAULT_REALM),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
