//! Credential file store: owner-only artifact persistence with cleanup.

use crate::paths::{ArtifactScope, FILE_MODE, PathResolver, validate_segment};
use keybridge_core::{Error, ProviderFamily, Realm, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads and writes credential artifacts under realm-isolated paths.
#[derive(Debug, Clone)]
pub struct FileStore {
    resolver: PathResolver,
}

impl FileStore {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Write an artifact, replacing any previous content. Returns the path.
    pub async fn write(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
        scope: ArtifactScope,
        identity: &str,
        artifact: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        validate_segment(artifact)?;
        let dir = self.resolver.resolve(realm, family, provider, scope, identity)?;
        let path = dir.join(artifact);
        tokio::fs::write(&path, content).await?;
        set_private_mode(&path).await?;
        debug!(path = %path.display(), bytes = content.len(), "Wrote credential artifact");
        Ok(path)
    }

    /// Read an artifact. A missing file or directory is `NotFound`.
    pub async fn read(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
        scope: ArtifactScope,
        identity: &str,
        artifact: &str,
    ) -> Result<Vec<u8>> {
        validate_segment(artifact)?;
        let dir = self.resolver.locate(realm, family, provider, scope, identity)?;
        let path = dir.join(artifact);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            }
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Remove every artifact for one identity. Missing targets are success.
    pub async fn cleanup_identity(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
        identity: &str,
    ) -> Result<()> {
        for scope in [ArtifactScope::Adc, ArtifactScope::Config] {
            let dir = self.resolver.locate(realm, family, provider, scope, identity)?;
            remove_tolerant(&dir).await?;
        }
        Ok(())
    }

    /// Remove everything stored for a provider, cached identities included.
    pub async fn cleanup_provider(
        &self,
        realm: &Realm,
        family: ProviderFamily,
        provider: &str,
    ) -> Result<()> {
        let dir = self.resolver.provider_dir(realm, family, provider)?;
        remove_tolerant(&dir).await
    }
}

async fn remove_tolerant(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!(path = %dir.display(), "Removed credential directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Io(err)),
    }
}

async fn set_private_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
