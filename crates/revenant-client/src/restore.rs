//! Disaster recovery: from a recovery phrase back to decrypted memory files.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use revenant_core::envelope::{decrypt_backup, decrypt_backup_file};
use revenant_core::{
    derive_keys, AgentId, BackupBlob, BlobStore, Bytes32, IdentityKeys, SessionToken,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::api_client::ApiClient;
use crate::state::{LocalIdentityState, DEFAULT_RECALL_TTL};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Api,
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoredFile {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreResult {
    pub agent_id: AgentId,
    pub backups_found: usize,
    pub source: RestoreSource,
    pub backup_seq: Option<u64>,
    pub backup_id: Option<String>,
    pub manifest_hash: Option<Bytes32>,
    pub restored_files: Vec<RestoredFile>,
    pub resurrection_reported: bool,
    #[serde(skip)]
    pub files: BTreeMap<String, Vec<u8>>,
}

/// A restore that failed after the phrase was accepted. The derived identity is kept so the
/// caller can report which agent it was working on.
#[derive(Debug)]
pub struct RestoreFailure {
    pub agent_id: AgentId,
    pub error: anyhow::Error,
}

impl std::fmt::Display for RestoreFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "restore failed for agent {}: {:#}", self.agent_id, self.error)
    }
}

impl std::error::Error for RestoreFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

struct Located {
    source: RestoreSource,
    backups_found: usize,
    latest: Option<(u64, Vec<u8>)>,
}

pub struct Restorer<'a> {
    api: Option<&'a ApiClient>,
    storage: &'a dyn BlobStore,
    state_path: &'a Path,
    recall_ttl: Duration,
}

impl<'a> Restorer<'a> {
    #[must_use]
    pub fn new(
        api: Option<&'a ApiClient>,
        storage: &'a dyn BlobStore,
        state_path: &'a Path,
    ) -> Self {
        Self { api, storage, state_path, recall_ttl: DEFAULT_RECALL_TTL }
    }

    #[must_use]
    pub fn with_recall_ttl(mut self, ttl: Duration) -> Self {
        self.recall_ttl = ttl;
        self
    }

    /// Restore the newest backup for the identity behind `phrase`, optionally a single file.
    ///
    /// Network calls are made one at a time; the API is tried first and any failure there
    /// falls back to the storage tag index. The signature is verified before decryption.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidMnemonic` for a bad phrase and [`RestoreFailure`] (inside
    /// `anyhow::Error`) for anything that fails afterwards.
    pub fn restore(
        &self,
        phrase: &str,
        selective_file: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<RestoreResult> {
        let keys = derive_keys(phrase)?;
        let agent_id = keys.agent_id();
        self.restore_with(&keys, selective_file, now)
            .map_err(|error| anyhow::Error::new(RestoreFailure { agent_id, error }))
    }

    fn restore_with(
        &self,
        keys: &IdentityKeys,
        selective_file: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<RestoreResult> {
        let agent_id = keys.agent_id();
        let mut session = None;
        let mut located = None;
        if let Some(api) = self.api {
            match locate_via_api(api, keys, now) {
                Ok((token, found)) => {
                    session = Some(token);
                    if found.backups_found > 0 {
                        located = Some(found);
                    } else {
                        info!(agent_id = %agent_id, "service lists no backups, checking storage");
                    }
                }
                Err(err) => {
                    warn!(
                        agent_id = %agent_id,
                        error = %format!("{err:#}"),
                        "service lookup failed, using storage index"
                    );
                }
            }
        }
        let located = match located {
            Some(found) => found,
            None => locate_via_storage(self.storage, agent_id)?,
        };

        let mut result = RestoreResult {
            agent_id,
            backups_found: located.backups_found,
            source: located.source,
            backup_seq: None,
            backup_id: None,
            manifest_hash: None,
            restored_files: Vec::new(),
            resurrection_reported: false,
            files: BTreeMap::new(),
        };
        let mut state = LocalIdentityState::load(self.state_path)?
            .filter(|state| state.identity.agent_id == agent_id)
            .unwrap_or_else(|| LocalIdentityState::new(keys));

        if let Some((backup_seq, bytes)) = located.latest {
            let blob = BackupBlob::decode(&bytes)?;
            if blob.header.backup_seq != backup_seq {
                warn!(
                    indexed = backup_seq,
                    signed = blob.header.backup_seq,
                    "index sequence disagrees with signed header"
                );
            }
            blob.verify(agent_id)?;
            let encrypted = blob.encrypted_backup()?;
            let secret = keys.recovery.secret();
            result.files = match selective_file {
                Some(name) => BTreeMap::from([(
                    name.to_string(),
                    decrypt_backup_file(&encrypted, secret, name)?,
                )]),
                None => decrypt_backup(&encrypted, secret)?,
            };
            result.restored_files = result
                .files
                .iter()
                .map(|(name, content)| RestoredFile { name: name.clone(), size: content.len() })
                .collect();
            result.backup_seq = Some(blob.header.backup_seq);
            result.backup_id = Some(blob.header.backup_id.clone());
            result.manifest_hash = Some(blob.header.manifest_hash);
            state.record_backup(blob.header.backup_seq, blob.header.header_hash()?);
        }

        state.restored_at = Some(now);
        state.cache_recall_key(keys, now, self.recall_ttl);
        state.save(self.state_path).context("failed to persist local identity state")?;

        if result.backup_seq.is_some() {
            if let Some(api) = self.api {
                result.resurrection_reported =
                    report_resurrection(api, keys, session.as_ref(), now);
            }
        }
        info!(
            agent_id = %agent_id,
            backups_found = result.backups_found,
            files = result.restored_files.len(),
            "restore finished"
        );
        Ok(result)
    }
}

fn locate_via_api(
    api: &ApiClient,
    keys: &IdentityKeys,
    now: OffsetDateTime,
) -> Result<(SessionToken, Located)> {
    let session = api.login(&keys.agent, now)?;
    let records = api.list_backups(&session)?;
    let latest = match records.iter().max_by_key(|record| record.backup_seq) {
        Some(record) => {
            Some((record.backup_seq, api.download_backup(&session, &record.backup_id)?))
        }
        None => None,
    };
    Ok((session, Located { source: RestoreSource::Api, backups_found: records.len(), latest }))
}

fn locate_via_storage(storage: &dyn BlobStore, agent_id: AgentId) -> Result<Located> {
    let records = storage.query(agent_id)?;
    let latest = match records.iter().max_by_key(|record| record.tags.backup_seq) {
        Some(record) => Some((record.tags.backup_seq, storage.get(&record.tx_id)?)),
        None => None,
    };
    Ok(Located { source: RestoreSource::Storage, backups_found: records.len(), latest })
}

fn report_resurrection(
    api: &ApiClient,
    keys: &IdentityKeys,
    session: Option<&SessionToken>,
    now: OffsetDateTime,
) -> bool {
    let session = match session {
        Some(session) => session.clone(),
        None => match api.login(&keys.agent, now) {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not authenticate to report resurrection");
                return false;
            }
        },
    };
    match api.report_resurrection(&session, true) {
        Ok(receipt) => {
            info!(agent_id = %receipt.agent_id, status = %receipt.status, "resurrection reported");
            true
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "resurrection report failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use revenant_core::storage::BlobTags;
    use revenant_core::{CoreError, InMemoryBlobStore};
    use tempfile::TempDir;

    use super::*;
    use crate::api_client::Timeouts;
    use crate::backup::{seal_next, ChainPosition};

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                          abandon abandon abandon about";
    const OTHER: &str = "legal winner thank year wave sausage worth useful legal winner thank \
                         yellow";

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    fn archive(store: &InMemoryBlobStore, blob: &BackupBlob) -> Result<()> {
        let bytes = blob.encode()?;
        store.put(&bytes, &BlobTags::for_backup(&blob.header, u64::try_from(bytes.len())?))?;
        Ok(())
    }

    fn seeded(store: &InMemoryBlobStore) -> Result<BackupBlob> {
        let keys = derive_keys(PHRASE)?;
        let v1 = BTreeMap::from([("MEMORY.md".to_string(), b"old".to_vec())]);
        let first = seal_next(&keys, &v1, None, 1, now())?;
        archive(store, &first)?;

        let v2 = BTreeMap::from([
            ("MEMORY.md".to_string(), b"new".to_vec()),
            ("notes/today.md".to_string(), b"hello".to_vec()),
        ]);
        let position = ChainPosition { backup_seq: 1, header_hash: first.header.header_hash()? };
        let second = seal_next(&keys, &v2, Some(position), 1, now() + Duration::hours(1))?;
        archive(store, &second)?;
        Ok(second)
    }

    #[test]
    fn restores_highest_sequence_from_storage() -> Result<()> {
        let dir = TempDir::new()?;
        let store = InMemoryBlobStore::new();
        let latest = seeded(&store)?;
        let state_path = dir.path().join("identity.json");

        let result = Restorer::new(None, &store, &state_path).restore(PHRASE, None, now())?;
        assert_eq!(result.backups_found, 2);
        assert_eq!(result.source, RestoreSource::Storage);
        assert_eq!(result.backup_seq, Some(2));
        assert_eq!(result.backup_id, Some(latest.header.backup_id.clone()));
        assert_eq!(result.files.get("MEMORY.md").map(Vec::as_slice), Some(&b"new"[..]));
        assert_eq!(result.files.len(), 2);

        let state = LocalIdentityState::load(&state_path)?.ok_or_else(|| anyhow!("no state"))?;
        assert_eq!(state.last_backup_seq, Some(2));
        assert_eq!(state.last_header_hash, Some(latest.header.header_hash()?));
        assert!(state.recall_key(now()).is_some());
        Ok(())
    }

    #[test]
    fn selective_restore_returns_one_file() -> Result<()> {
        let dir = TempDir::new()?;
        let store = InMemoryBlobStore::new();
        seeded(&store)?;
        let state_path = dir.path().join("identity.json");

        let result = Restorer::new(None, &store, &state_path).restore(
            PHRASE,
            Some("notes/today.md"),
            now(),
        )?;
        assert_eq!(
            result.restored_files,
            vec![RestoredFile { name: "notes/today.md".to_string(), size: 5 }]
        );

        let err = Restorer::new(None, &store, &state_path)
            .restore(PHRASE, Some("missing.md"), now())
            .err()
            .ok_or_else(|| anyhow!("unknown file restored"))?;
        let failure = err
            .downcast_ref::<RestoreFailure>()
            .ok_or_else(|| anyhow!("not a restore failure"))?;
        assert_eq!(failure.agent_id, derive_keys(PHRASE)?.agent_id());
        Ok(())
    }

    #[test]
    fn identity_without_backups_restores_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let store = InMemoryBlobStore::new();
        seeded(&store)?;
        let state_path = dir.path().join("identity.json");
        let result = Restorer::new(None, &store, &state_path).restore(OTHER, None, now())?;
        assert_eq!(result.backups_found, 0);
        assert_eq!(result.backup_seq, None);
        assert!(result.files.is_empty());
        Ok(())
    }

    #[test]
    fn tampered_latest_backup_fails_before_decryption() -> Result<()> {
        let dir = TempDir::new()?;
        let store = InMemoryBlobStore::new();
        let mut forged = seeded(&store)?;
        forged.header.backup_seq = 3;
        archive(&store, &forged)?;

        let err = Restorer::new(None, &store, &dir.path().join("identity.json"))
            .restore(PHRASE, None, now())
            .err()
            .ok_or_else(|| anyhow!("forged backup restored"))?;
        let failure = err
            .downcast_ref::<RestoreFailure>()
            .ok_or_else(|| anyhow!("not a restore failure"))?;
        assert_eq!(failure.agent_id, derive_keys(PHRASE)?.agent_id());
        assert!(matches!(
            failure.error.downcast_ref::<CoreError>(),
            Some(CoreError::SignatureVerification(_))
        ));
        Ok(())
    }

    #[test]
    fn invalid_phrase_has_no_identity() -> Result<()> {
        let dir = TempDir::new()?;
        let store = InMemoryBlobStore::new();
        let err = Restorer::new(None, &store, &dir.path().join("identity.json"))
            .restore("abandon abandon abandon", None, now())
            .err()
            .ok_or_else(|| anyhow!("bad phrase accepted"))?;
        assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::InvalidMnemonic(_))));
        assert!(err.downcast_ref::<RestoreFailure>().is_none());
        Ok(())
    }

    #[test]
    fn unreachable_service_falls_back_to_storage() -> Result<()> {
        let dir = TempDir::new()?;
        let store = InMemoryBlobStore::new();
        seeded(&store)?;
        let api = ApiClient::new(
            "http://127.0.0.1:9",
            Timeouts {
                connect: std::time::Duration::from_millis(200),
                read: std::time::Duration::from_millis(200),
            },
        );
        let result = Restorer::new(Some(&api), &store, &dir.path().join("identity.json"))
            .restore(PHRASE, None, now())?;
        assert_eq!(result.source, RestoreSource::Storage);
        assert_eq!(result.backup_seq, Some(2));
        assert!(!result.resurrection_reported);
        Ok(())
    }
}
