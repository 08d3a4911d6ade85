//! Token cache: a keyed store of access tokens with expiry and fingerprint.
//!
//! The cache is an optimization, never a correctness dependency: every load
//! failure is a silent miss and every persistence failure is logged and
//! swallowed.

use crate::paths::{FILE_MODE, create_private_dir};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Minimum remaining lifetime for a cached token to be usable.
const FRESHNESS_BUFFER_MINUTES: i64 = 5;

/// A cached access token with its absolute expiry and the fingerprint of
/// the configuration that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl CachedToken {
    /// Usable iff more than the freshness buffer remains and the fingerprint
    /// matches the current request.
    pub fn is_valid(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
            && self.expires_at - Utc::now() > Duration::minutes(FRESHNESS_BUFFER_MINUTES)
    }
}

/// Filesystem-backed token cache, one JSON file per key.
#[derive(Debug, Clone)]
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let sanitized = key.replace(['/', '\\', ':'], "_");
        self.dir.join(format!("{}.json", sanitized))
    }

    /// Load the entry for `key`, validating freshness and fingerprint.
    /// Any failure degrades to a miss, forcing a fresh strategy run.
    pub async fn load(&self, key: &str, fingerprint: &str) -> Option<CachedToken> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(key, error = %err, "Token cache miss: unreadable entry");
                return None;
            }
        };
        let entry: CachedToken = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(key, error = %err, "Token cache miss: malformed entry");
                return None;
            }
        };
        if !entry.is_valid(fingerprint) {
            debug!(key, "Token cache miss: stale or fingerprint mismatch");
            return None;
        }
        debug!(key, expires_at = %entry.expires_at, "Token cache hit");
        Some(entry)
    }

    /// Persist an entry. Failures are logged and swallowed.
    pub async fn save(&self, key: &str, entry: &CachedToken) {
        if let Err(err) = self.try_save(key, entry).await {
            warn!(key, error = %err, "Failed to persist token cache entry");
        }
    }

    async fn try_save(&self, key: &str, entry: &CachedToken) -> keybridge_core::Result<()> {
        create_private_dir(&self.dir)?;
        let path = self.entry_path(key);
        let bytes = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&path, bytes).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(FILE_MODE)).await?;
        }
        Ok(())
    }

    /// Delete the entry for `key`. Missing entries and failures are ignored.
    pub async fn delete(&self, key: &str) {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(key, "Deleted token cache entry"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(key, error = %err, "Failed to delete token cache entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(expires_at: DateTime<Utc>, fingerprint: &str) -> CachedToken {
        CachedToken {
            access_token: "cached-token".to_string(),
            expires_at,
            fingerprint: fingerprint.to_string(),
        }
    }

    #[tokio::test]
    async fn test_hit_with_fresh_token() {
        let tmp = TempDir::new().unwrap();
        let cache = TokenCache::new(tmp.path().join("cache"));
        cache
            .save("sso", &entry(Utc::now() + Duration::hours(1), "fp"))
            .await;

        let hit = cache.load("sso", "fp").await.unwrap();
        assert_eq!(hit.access_token, "cached-token");
    }

    #[tokio::test]
    async fn test_miss_when_expired() {
        let tmp = TempDir::new().unwrap();
        let cache = TokenCache::new(tmp.path().join("cache"));
        cache
            .save("sso", &entry(Utc::now() - Duration::minutes(1), "fp"))
            .await;
        assert!(cache.load("sso", "fp").await.is_none());
    }

    #[tokio::test]
    async fn test_miss_inside_freshness_buffer() {
        let tmp = TempDir::new().unwrap();
        let cache = TokenCache::new(tmp.path().join("cache"));
        cache
            .save("sso", &entry(Utc::now() + Duration::minutes(4), "fp"))
            .await;
        assert!(cache.load("sso", "fp").await.is_none());
    }

    #[tokio::test]
    async fn test_miss_on_fingerprint_mismatch() {
        let tmp = TempDir::new().unwrap();
        let cache = TokenCache::new(tmp.path().join("cache"));
        cache
            .save("sso", &entry(Utc::now() + Duration::hours(1), "old-fp"))
            .await;
        assert!(cache.load("sso", "new-fp").await.is_none());
    }

    #[tokio::test]
    async fn test_miss_on_missing_file() {
        let tmp = TempDir::new().unwrap();
        let cache = TokenCache::new(tmp.path().join("cache"));
        assert!(cache.load("sso", "fp").await.is_none());
    }

    #[tokio::test]
    async fn test_miss_on_malformed_json() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sso.json"), b"{not json").unwrap();

        let cache = TokenCache::new(dir);
        assert!(cache.load("sso", "fp").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_silent() {
        let tmp = TempDir::new().unwrap();
        let cache = TokenCache::new(tmp.path().join("cache"));
        cache.delete("sso").await;
    }

    #[tokio::test]
    async fn test_save_failure_is_swallowed() {
        // Base dir is a file, so directory creation fails.
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("cache");
        std::fs::write(&blocker, b"file").unwrap();

        let cache = TokenCache::new(blocker);
        cache
            .save("sso", &entry(Utc::now() + Duration::hours(1), "fp"))
            .await;
        assert!(cache.load("sso", "fp").await.is_none());
    }
}
