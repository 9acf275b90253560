//! Permanent blob storage seam: content-addressed `put`/`get` plus a tag index.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backup::BackupHeader;
use crate::canonical::sha256;
use crate::error::{CoreError, CoreResult};
use crate::model::{AgentId, Bytes32};

pub const APP_NAME: &str = "Revenant";
pub const BACKUP_BLOB_TYPE: &str = "agent-backup";

pub const TAG_APP_NAME: &str = "App-Name";
pub const TAG_TYPE: &str = "Type";
pub const TAG_AGENT_ID: &str = "Agent-Id";
pub const TAG_BACKUP_SEQ: &str = "Backup-Seq";
pub const TAG_BACKUP_TIMESTAMP: &str = "Backup-Timestamp";
pub const TAG_MANIFEST_HASH: &str = "Manifest-Hash";
pub const TAG_SIZE_BYTES: &str = "Size-Bytes";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlobTags {
    pub app_name: String,
    pub blob_type: String,
    pub agent_id: AgentId,
    pub backup_seq: u64,
    pub backup_timestamp: i64,
    pub manifest_hash: Bytes32,
    pub size_bytes: u64,
}

impl BlobTags {
    #[must_use]
    pub fn for_backup(header: &BackupHeader, size_bytes: u64) -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            blob_type: BACKUP_BLOB_TYPE.to_string(),
            agent_id: header.agent_id,
            backup_seq: header.backup_seq,
            backup_timestamp: header.timestamp,
            manifest_hash: header.manifest_hash,
            size_bytes,
        }
    }

    #[must_use]
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            (TAG_APP_NAME.to_string(), self.app_name.clone()),
            (TAG_TYPE.to_string(), self.blob_type.clone()),
            (TAG_AGENT_ID.to_string(), self.agent_id.to_string()),
            (TAG_BACKUP_SEQ.to_string(), self.backup_seq.to_string()),
            (TAG_BACKUP_TIMESTAMP.to_string(), self.backup_timestamp.to_string()),
            (TAG_MANIFEST_HASH.to_string(), self.manifest_hash.to_string()),
            (TAG_SIZE_BYTES.to_string(), self.size_bytes.to_string()),
        ]
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when a required tag is missing or malformed.
    pub fn from_pairs(pairs: &[(String, String)]) -> CoreResult<Self> {
        let map = pairs.iter().cloned().collect::<BTreeMap<_, _>>();
        let get = |name: &str| {
            map.get(name)
                .map(String::as_str)
                .ok_or_else(|| CoreError::Validation(format!("missing tag {name}")))
        };
        let number = |name: &str| -> CoreResult<i64> {
            get(name)?
                .parse::<i64>()
                .map_err(|err| CoreError::Validation(format!("tag {name} is not numeric: {err}")))
        };
        let unsigned = |name: &str| -> CoreResult<u64> {
            u64::try_from(number(name)?)
                .map_err(|err| CoreError::Validation(format!("tag {name} is negative: {err}")))
        };
        Ok(Self {
            app_name: get(TAG_APP_NAME)?.to_string(),
            blob_type: get(TAG_TYPE)?.to_string(),
            agent_id: AgentId::parse(get(TAG_AGENT_ID)?)?,
            backup_seq: unsigned(TAG_BACKUP_SEQ)?,
            backup_timestamp: number(TAG_BACKUP_TIMESTAMP)?,
            manifest_hash: Bytes32::parse(get(TAG_MANIFEST_HASH)?)?,
            size_bytes: unsigned(TAG_SIZE_BYTES)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlobRecord {
    pub tx_id: String,
    pub tags: BlobTags,
}

pub trait BlobStore: Send + Sync {
    /// # Errors
    /// Returns [`CoreError::StorageUnreachable`] when the backend cannot be reached.
    fn put(&self, bytes: &[u8], tags: &BlobTags) -> CoreResult<String>;

    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown ids.
    fn get(&self, tx_id: &str) -> CoreResult<Vec<u8>>;

    /// Backup blobs for one agent, most recent first.
    ///
    /// # Errors
    /// Returns [`CoreError::StorageUnreachable`] when the index cannot be queried.
    fn query(&self, agent_id: AgentId) -> CoreResult<Vec<BlobRecord>>;
}

/// Content address used by the local stores: base64url SHA-256, 43 characters.
#[must_use]
pub fn content_id(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(sha256(bytes))
}

/// Most recent first; sequence breaks timestamp ties.
pub fn sort_by_recency(records: &mut [BlobRecord]) {
    records.sort_by(|lhs, rhs| {
        (rhs.tags.backup_timestamp, rhs.tags.backup_seq)
            .cmp(&(lhs.tags.backup_timestamp, lhs.tags.backup_seq))
    });
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, (Vec<u8>, BlobTags)>>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, bytes: &[u8], tags: &BlobTags) -> CoreResult<String> {
        let tx_id = content_id(bytes);
        self.blobs.write().insert(tx_id.clone(), (bytes.to_vec(), tags.clone()));
        Ok(tx_id)
    }

    fn get(&self, tx_id: &str) -> CoreResult<Vec<u8>> {
        self.blobs
            .read()
            .get(tx_id)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| CoreError::NotFound(format!("blob {tx_id}")))
    }

    fn query(&self, agent_id: AgentId) -> CoreResult<Vec<BlobRecord>> {
        let mut records = self
            .blobs
            .read()
            .iter()
            .filter(|(_, (_, tags))| tags.agent_id == agent_id && tags.app_name == APP_NAME)
            .map(|(tx_id, (_, tags))| BlobRecord { tx_id: tx_id.clone(), tags: tags.clone() })
            .collect::<Vec<_>>();
        sort_by_recency(&mut records);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(agent: u8, seq: u64) -> BlobTags {
        BlobTags {
            app_name: APP_NAME.to_string(),
            blob_type: BACKUP_BLOB_TYPE.to_string(),
            agent_id: AgentId([agent; 20]),
            backup_seq: seq,
            backup_timestamp: 1_700_000_000_000 + i64::try_from(seq).unwrap_or(0),
            manifest_hash: Bytes32([seq as u8; 32]),
            size_bytes: 5,
        }
    }

    #[test]
    fn query_filters_by_agent_and_sorts_newest_first() -> anyhow::Result<()> {
        let store = InMemoryBlobStore::new();
        let first = store.put(b"one", &tags(1, 1))?;
        let second = store.put(b"two", &tags(1, 2))?;
        store.put(b"other", &tags(2, 1))?;

        let records = store.query(AgentId([1; 20]))?;
        let ids = records.iter().map(|record| record.tx_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert_eq!(store.get(&first)?, b"one");
        assert!(matches!(store.get("missing"), Err(CoreError::NotFound(_))));
        assert_eq!(first.len(), 43);
        Ok(())
    }

    #[test]
    fn tags_survive_pair_encoding() -> anyhow::Result<()> {
        let original = tags(3, 7);
        let pairs = original.to_pairs();
        assert_eq!(pairs[2].0, "Agent-Id");
        assert_eq!(BlobTags::from_pairs(&pairs)?, original);
        assert!(BlobTags::from_pairs(&pairs[1..]).is_err());
        Ok(())
    }
}
