//! Realm-isolated path resolution for credential artifacts.
//!
//! Layout: `<base>/<realm>/<family>/<provider>/{adc|config}/<identity>`.
//! Directories are created owner-only; every segment is validated before it
//! is joined, so configuration can never escape its realm.

use keybridge_core::{Error, ProviderFamily, Realm, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;

/// Owner-only directory mode.
pub const DIR_MODE: u32 = 0o700;
/// Owner-only file mode.
pub const FILE_MODE: u32 = 0o600;

/// Which artifact family a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactScope {
    /// Application-default-credential style JSON files.
    Adc,
    /// CLI configuration artifacts (properties, credentials files).
    Config,
}

impl ArtifactScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactScope::Adc => "adc",
            ArtifactScope::Config => "config",
        }
    }
}

/// Reject path segments that are empty, dot-relative, or contain separators.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(Error::InvalidConfig(format!(
            "invalid path segment: {:?}",
            segment
        )));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(Error::InvalidConfig(format!(
            "path segment must not contain separators: {:?}",
            segment
        )));
    }
    Ok(())
}

/// Computes credential artifact locations under a base directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base: PathBuf,
}

impl PathResolver {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Default base directory under the user's config dir.
    pub fn default_base() -> Result<Self> {
        let dirs = directories::BaseDirs::new()
            .ok_or_else(|| Error::InvalidConfig("cannot determine home directory".to_string()))?;
        Ok(Self::new(dirs.config_dir().join("keybridge")))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Join the identity directory without touching the filesystem.
    pub fn locate(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
        scope: ArtifactScope,
        identity: &str,
    ) -> Result<PathBuf> {
        validate_segment(provider)?;
        validate_segment(identity)?;
        Ok(self
            .base
            .join(realm.as_str())
            .join(family.as_str())
            .join(provider)
            .join(scope.as_str())
            .join(identity))
    }

    /// Like [`locate`](Self::locate), but creates any missing directory
    /// component with owner-only permissions. Idempotent.
    pub fn resolve(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
        scope: ArtifactScope,
        identity: &str,
    ) -> Result<PathBuf> {
        let dir = self.locate(realm, family, provider, scope, identity)?;
        create_private_dir(&dir)?;
        Ok(dir)
    }

    /// Provider directory, for whole-provider cleanup. Not created.
    pub fn provider_dir(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
    ) -> Result<PathBuf> {
        validate_segment(provider)?;
        Ok(self
            .base
            .join(realm.as_str())
            .join(family.as_str())
            .join(provider))
    }

    /// Token-cache directory for a realm. Created on demand by the cache.
    pub fn cache_dir(&self, realm: &Realm) -> PathBuf {
        self.base.join(realm.as_str()).join("cache")
    }
}

/// Create `dir` and any missing parents, mode 0700.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir).map_err(Error::Io)
}
