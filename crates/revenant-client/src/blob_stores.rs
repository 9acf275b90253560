//! Permanent-storage backends: a local directory mirror and an Arweave-style HTTP gateway.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use revenant_core::storage::{content_id, sort_by_recency, APP_NAME, TAG_AGENT_ID, TAG_APP_NAME};
use revenant_core::{AgentId, BlobRecord, BlobStore, BlobTags, CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::api_client::Timeouts;

const BLOB_EXTENSION: &str = "blob";
const TAGS_EXTENSION: &str = "tags.json";
const MAX_BLOB_BYTES: u64 = 512 * 1024 * 1024;
const QUERY_PAGE_SIZE: usize = 100;
const MAX_QUERY_PAGES: usize = 1_000;

/// Blobs stored as `<tx_id>.blob` with a `<tx_id>.tags.json` sidecar.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// # Errors
    /// Returns [`CoreError::StorageUnreachable`] when the directory cannot be created.
    pub fn open(root: &Path) -> CoreResult<Self> {
        fs::create_dir_all(root).map_err(|err| unreachable_at(root, &err))?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn blob_path(&self, tx_id: &str) -> PathBuf {
        self.root.join(format!("{tx_id}.{BLOB_EXTENSION}"))
    }

    fn tags_path(&self, tx_id: &str) -> PathBuf {
        self.root.join(format!("{tx_id}.{TAGS_EXTENSION}"))
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, bytes: &[u8], tags: &BlobTags) -> CoreResult<String> {
        let tx_id = content_id(bytes);
        write_atomic(&self.root, &self.blob_path(&tx_id), bytes)?;
        let sidecar = serde_json::to_vec_pretty(tags)
            .map_err(|err| CoreError::Encoding(format!("failed to encode tags: {err}")))?;
        write_atomic(&self.root, &self.tags_path(&tx_id), &sidecar)?;
        debug!(tx_id = %tx_id, "blob written to directory store");
        Ok(tx_id)
    }

    fn get(&self, tx_id: &str) -> CoreResult<Vec<u8>> {
        if tx_id.contains(['/', '\\']) || tx_id.starts_with('.') {
            return Err(CoreError::Validation(format!("invalid blob id {tx_id}")));
        }
        let path = self.blob_path(tx_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::NotFound(format!("blob {tx_id}")))
            }
            Err(err) => Err(unreachable_at(&path, &err)),
        }
    }

    fn query(&self, agent_id: AgentId) -> CoreResult<Vec<BlobRecord>> {
        let entries = fs::read_dir(&self.root).map_err(|err| unreachable_at(&self.root, &err))?;
        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| unreachable_at(&self.root, &err))?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(tx_id) = name.strip_suffix(&format!(".{TAGS_EXTENSION}")) else {
                continue;
            };
            let raw = fs::read(&path).map_err(|err| unreachable_at(&path, &err))?;
            let tags: BlobTags = match serde_json::from_slice(&raw) {
                Ok(tags) => tags,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable tag sidecar");
                    continue;
                }
            };
            if tags.app_name == APP_NAME && tags.agent_id == agent_id {
                records.push(BlobRecord { tx_id: tx_id.to_string(), tags });
            }
        }
        sort_by_recency(&mut records);
        Ok(records)
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> CoreResult<()> {
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|err| unreachable_at(dir, &err))?;
    file.write_all(bytes).map_err(|err| unreachable_at(target, &err))?;
    file.persist(target).map_err(|err| unreachable_at(target, &err.error))?;
    Ok(())
}

fn unreachable_at(path: &Path, err: &std::io::Error) -> CoreError {
    CoreError::StorageUnreachable(format!("{}: {err}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Tag {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct UploadRequest {
    data: String,
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: GraphqlData,
}

#[derive(Debug, Deserialize)]
struct GraphqlData {
    transactions: Transactions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transactions {
    #[serde(default)]
    page_info: PageInfo,
    edges: Vec<Edge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct Edge {
    #[serde(default)]
    cursor: Option<String>,
    node: Node,
}

impl Transactions {
    /// Cursor for the following page, if the gateway says there is one.
    fn next_cursor(&self) -> Option<String> {
        if !self.page_info.has_next_page {
            return None;
        }
        self.edges.last().and_then(|edge| edge.cursor.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Node {
    id: String,
    tags: Vec<Tag>,
}

const TRANSACTIONS_QUERY: &str = "query($tags: [TagFilter!], $first: Int, $after: String) { \
     transactions(tags: $tags, first: $first, after: $after, sort: HEIGHT_DESC) { \
     pageInfo { hasNextPage } edges { cursor node { id tags { name value } } } } }";

/// Bundler upload endpoint plus a gateway serving `GET /<tx_id>` and `POST /graphql`.
#[derive(Debug, Clone)]
pub struct GatewayBlobStore {
    upload_url: String,
    gateway_url: String,
    agent: ureq::Agent,
}

impl GatewayBlobStore {
    #[must_use]
    pub fn new(upload_url: &str, gateway_url: &str, timeouts: Timeouts) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeouts.connect)
            .timeout_read(timeouts.read)
            .build();
        Self {
            upload_url: upload_url.trim_end_matches('/').to_string(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            agent,
        }
    }
}

impl BlobStore for GatewayBlobStore {
    fn put(&self, bytes: &[u8], tags: &BlobTags) -> CoreResult<String> {
        let request = UploadRequest {
            data: STANDARD.encode(bytes),
            tags: tags.to_pairs().into_iter().map(|(name, value)| Tag { name, value }).collect(),
        };
        let response: UploadResponse = self
            .agent
            .post(&self.upload_url)
            .send_json(&request)
            .map_err(gateway_error)?
            .into_json()
            .map_err(|err| {
                CoreError::StorageUnreachable(format!("invalid upload response: {err}"))
            })?;
        Ok(response.id)
    }

    fn get(&self, tx_id: &str) -> CoreResult<Vec<u8>> {
        let response = self
            .agent
            .get(&format!("{}/{tx_id}", self.gateway_url))
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(404, _) => CoreError::NotFound(format!("blob {tx_id}")),
                other => gateway_error(other),
            })?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_BLOB_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| CoreError::StorageUnreachable(format!("failed to read blob: {err}")))?;
        Ok(bytes)
    }

    fn query(&self, agent_id: AgentId) -> CoreResult<Vec<BlobRecord>> {
        let mut records = Vec::new();
        let mut after: Option<String> = None;
        for page in 0..MAX_QUERY_PAGES {
            let transactions = self.query_page(agent_id, after.as_deref())?;
            after = transactions.next_cursor();
            collect_records(agent_id, transactions.edges, &mut records);
            if after.is_none() {
                break;
            }
            if page + 1 == MAX_QUERY_PAGES {
                warn!(agent_id = %agent_id, pages = MAX_QUERY_PAGES, "gateway query truncated");
            }
        }
        sort_by_recency(&mut records);
        Ok(records)
    }
}

impl GatewayBlobStore {
    fn query_page(&self, agent_id: AgentId, after: Option<&str>) -> CoreResult<Transactions> {
        let body = json!({
            "query": TRANSACTIONS_QUERY,
            "variables": {
                "first": QUERY_PAGE_SIZE,
                "after": after,
                "tags": [
                    { "name": TAG_APP_NAME, "values": [APP_NAME] },
                    { "name": TAG_AGENT_ID, "values": [agent_id.to_string()] },
                ],
            },
        });
        let response: GraphqlResponse = self
            .agent
            .post(&format!("{}/graphql", self.gateway_url))
            .send_json(body)
            .map_err(gateway_error)?
            .into_json()
            .map_err(|err| {
                CoreError::StorageUnreachable(format!("invalid graphql response: {err}"))
            })?;
        debug!(
            agent_id = %agent_id,
            edges = response.data.transactions.edges.len(),
            "gateway page"
        );
        Ok(response.data.transactions)
    }
}

fn collect_records(agent_id: AgentId, edges: Vec<Edge>, records: &mut Vec<BlobRecord>) {
    for edge in edges {
        let pairs =
            edge.node.tags.into_iter().map(|tag| (tag.name, tag.value)).collect::<Vec<_>>();
        match BlobTags::from_pairs(&pairs) {
            Ok(tags) if tags.agent_id == agent_id => {
                records.push(BlobRecord { tx_id: edge.node.id, tags });
            }
            Ok(_) => {}
            Err(err) => {
                warn!(tx_id = %edge.node.id, error = %err, "skipping transaction with bad tags");
            }
        }
    }
}

fn gateway_error(err: ureq::Error) -> CoreError {
    CoreError::StorageUnreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use revenant_core::storage::BACKUP_BLOB_TYPE;
    use revenant_core::Bytes32;
    use tempfile::TempDir;

    use super::*;

    fn tags(agent: u8, seq: u64, timestamp: i64) -> BlobTags {
        BlobTags {
            app_name: APP_NAME.to_string(),
            blob_type: BACKUP_BLOB_TYPE.to_string(),
            agent_id: AgentId([agent; 20]),
            backup_seq: seq,
            backup_timestamp: timestamp,
            manifest_hash: Bytes32([0; 32]),
            size_bytes: 3,
        }
    }

    #[test]
    fn directory_store_round_trips_and_filters_by_agent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = DirBlobStore::open(dir.path())?;
        let first = store.put(b"one", &tags(1, 1, 100))?;
        let second = store.put(b"two", &tags(1, 2, 200))?;
        store.put(b"zzz", &tags(2, 1, 300))?;

        assert_eq!(store.get(&first)?, b"one");
        let records = store.query(AgentId([1; 20]))?;
        let ids = records.iter().map(|r| r.tx_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert!(store.query(AgentId([3; 20]))?.is_empty());
        Ok(())
    }

    #[test]
    fn directory_store_reports_missing_and_rejects_paths() -> Result<()> {
        let dir = TempDir::new()?;
        let store = DirBlobStore::open(dir.path())?;
        assert!(matches!(store.get("missing"), Err(CoreError::NotFound(_))));
        assert!(matches!(store.get("../etc/passwd"), Err(CoreError::Validation(_))));
        Ok(())
    }

    #[test]
    fn unreachable_gateway_is_a_storage_error() {
        let timeout = std::time::Duration::from_millis(200);
        let store = GatewayBlobStore::new(
            "http://127.0.0.1:9/upload",
            "http://127.0.0.1:9",
            Timeouts { connect: timeout, read: timeout },
        );
        assert!(matches!(store.query(AgentId([1; 20])), Err(CoreError::StorageUnreachable(_))));
    }

    #[test]
    fn gateway_pages_follow_the_last_cursor() -> Result<()> {
        let agent = AgentId([1; 20]);
        let tag_pairs = |seq: u64| {
            tags(1, seq, i64::try_from(seq).unwrap_or(0))
                .to_pairs()
                .into_iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect::<Vec<_>>()
        };
        let page: GraphqlResponse = serde_json::from_value(json!({
            "data": { "transactions": {
                "pageInfo": { "hasNextPage": true },
                "edges": [
                    { "cursor": "c1", "node": { "id": "tx-2", "tags": tag_pairs(2) } },
                    { "cursor": "c2", "node": { "id": "tx-1", "tags": tag_pairs(1) } },
                ],
            } },
        }))?;
        let transactions = page.data.transactions;
        assert_eq!(transactions.next_cursor().as_deref(), Some("c2"));

        let mut records = Vec::new();
        collect_records(agent, transactions.edges, &mut records);
        assert_eq!(records.len(), 2);

        let last: GraphqlResponse = serde_json::from_value(json!({
            "data": { "transactions": {
                "pageInfo": { "hasNextPage": false },
                "edges": [{ "cursor": "c3", "node": { "id": "tx-0", "tags": [] } }],
            } },
        }))?;
        assert_eq!(last.data.transactions.next_cursor(), None);
        collect_records(agent, last.data.transactions.edges, &mut records);
        assert_eq!(records.len(), 2);

        let legacy: GraphqlResponse =
            serde_json::from_value(json!({ "data": { "transactions": { "edges": [] } } }))?;
        assert_eq!(legacy.data.transactions.next_cursor(), None);
        Ok(())
    }
}
