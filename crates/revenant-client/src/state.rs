//! Local identity state. Holds public identity data, chain position and a short-lived recall
//! key cache. The recovery phrase and the recovery secret are never written here.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use revenant_core::keys::X25519KeyPair;
use revenant_core::{Bytes32, IdentityKeys, PublicIdentity};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use zeroize::{Zeroize, Zeroizing};

pub const STATE_VERSION: u32 = 1;
pub const DEFAULT_RECALL_TTL: Duration = Duration::hours(24);

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecallKeyCache {
    secret_hex: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl Drop for RecallKeyCache {
    fn drop(&mut self) {
        self.secret_hex.zeroize();
    }
}

impl std::fmt::Debug for RecallKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallKeyCache")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalIdentityState {
    pub version: u32,
    pub identity: PublicIdentity,
    pub last_backup_seq: Option<u64>,
    pub last_header_hash: Option<Bytes32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub restored_at: Option<OffsetDateTime>,
    pub recall_cache: Option<RecallKeyCache>,
}

impl LocalIdentityState {
    #[must_use]
    pub fn new(keys: &IdentityKeys) -> Self {
        Self {
            version: STATE_VERSION,
            identity: keys.public_identity(),
            last_backup_seq: None,
            last_header_hash: None,
            restored_at: None,
            recall_cache: None,
        }
    }

    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let state: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid identity state at {}", path.display()))?;
        if state.version != STATE_VERSION {
            return Err(anyhow!("unsupported identity state version {}", state.version));
        }
        Ok(Some(state))
    }

    /// Atomically replace the state file, readable by the owner only.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let body = Zeroizing::new(
            serde_json::to_vec_pretty(self).context("failed to encode identity state")?,
        );

        let mut file = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        restrict_permissions(file.path())?;
        file.write_all(&body).context("failed to write identity state")?;
        file.as_file().sync_all().context("failed to sync identity state")?;
        file.persist(path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        Ok(())
    }

    pub fn cache_recall_key(&mut self, keys: &IdentityKeys, now: OffsetDateTime, ttl: Duration) {
        self.recall_cache = Some(RecallKeyCache {
            secret_hex: hex::encode(*keys.recall.secret_bytes()),
            expires_at: now + ttl,
        });
    }

    /// The cached recall key, if it has not expired.
    #[must_use]
    pub fn recall_key(&self, now: OffsetDateTime) -> Option<X25519KeyPair> {
        let cache = self.recall_cache.as_ref().filter(|cache| cache.expires_at > now)?;
        let mut bytes = Zeroizing::new([0_u8; 32]);
        hex::decode_to_slice(&cache.secret_hex, &mut bytes[..]).ok()?;
        Some(X25519KeyPair::from_secret_bytes(*bytes))
    }

    /// Drop an expired recall cache; returns whether anything was removed.
    pub fn evict_expired(&mut self, now: OffsetDateTime) -> bool {
        let expired = self.recall_cache.as_ref().is_some_and(|cache| cache.expires_at <= now);
        if expired {
            self.recall_cache = None;
        }
        expired
    }

    pub fn record_backup(&mut self, backup_seq: u64, header_hash: Bytes32) {
        if self.last_backup_seq.map_or(true, |seq| backup_seq > seq) {
            self.last_backup_seq = Some(backup_seq);
            self.last_header_hash = Some(header_hash);
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use revenant_core::derive_keys;
    use tempfile::TempDir;

    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                          abandon abandon abandon about";

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    #[test]
    fn state_round_trips_without_the_phrase() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("identity.json");
        let keys = derive_keys(PHRASE)?;
        let mut state = LocalIdentityState::new(&keys);
        state.record_backup(3, Bytes32([3; 32]));
        state.record_backup(2, Bytes32([2; 32]));
        state.cache_recall_key(&keys, now(), DEFAULT_RECALL_TTL);
        state.save(&path)?;

        let loaded = LocalIdentityState::load(&path)?.ok_or_else(|| anyhow!("state missing"))?;
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_backup_seq, Some(3));

        let raw = fs::read_to_string(&path)?;
        assert!(!raw.contains("abandon"));
        assert!(!raw.contains(&hex::encode(*keys.recovery.secret_bytes())));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new()?;
        let path = dir.path().join("identity.json");
        LocalIdentityState::new(&derive_keys(PHRASE)?).save(&path)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn recall_cache_expires() -> Result<()> {
        let keys = derive_keys(PHRASE)?;
        let mut state = LocalIdentityState::new(&keys);
        state.cache_recall_key(&keys, now(), Duration::hours(1));

        let cached = state.recall_key(now()).ok_or_else(|| anyhow!("cache miss"))?;
        assert_eq!(cached.public_bytes(), keys.recall.public_bytes());
        assert!(state.recall_key(now() + Duration::hours(2)).is_none());
        assert!(!state.evict_expired(now()));
        assert!(state.evict_expired(now() + Duration::hours(2)));
        assert!(state.recall_cache.is_none());
        Ok(())
    }

    #[test]
    fn missing_state_loads_as_none() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(LocalIdentityState::load(&dir.path().join("absent.json"))?.is_none());
        Ok(())
    }
}
