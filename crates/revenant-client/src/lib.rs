//! Agent-side plumbing: service client, storage backends, local state and restore.

pub mod anchor;
pub mod api_client;
pub mod backup;
pub mod blob_stores;
pub mod restore;
pub mod state;

pub use anchor::HttpAnchor;
pub use api_client::{ApiClient, ApiError, ResurrectionReceipt, Timeouts};
pub use backup::{collect_files, seal_next, ChainPosition};
pub use blob_stores::{DirBlobStore, GatewayBlobStore};
pub use restore::{RestoreFailure, RestoreResult, RestoreSource, RestoredFile, Restorer};
pub use state::{LocalIdentityState, RecallKeyCache, DEFAULT_RECALL_TTL, STATE_VERSION};
