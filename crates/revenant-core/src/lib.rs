//! Identity, sealed backups and trust scoring for long-lived agents.
//!
//! Everything in this crate is pure: no I/O besides the OS random source, no global state.

pub mod anchor;
pub mod auth;
pub mod backup;
pub mod canonical;
pub mod envelope;
mod error;
pub mod eth;
pub mod keys;
pub mod model;
pub mod storage;
pub mod trust;

pub use anchor::{
    Anchor, AnchorReceipt, AnchorSubmission, RecordingAnchor, RelayJob, RelayJobStatus,
};
pub use auth::{AuthPolicy, ChallengeResponse, HeartbeatProof};
pub use backup::{BackupBlob, BackupDraft, BackupHeader, FileEntry};
pub use error::{CoreError, CoreResult};
pub use eth::{
    AttestationPayload, Eip712Domain, EthSignature, RegistrationPayload, SignedAttestation,
    SignedRegistration,
};
pub use keys::{derive_keys, generate_mnemonic, AgentKeyPair, IdentityKeys, PublicIdentity};
pub use model::{
    Agent, AgentId, AgentStatus, Attestation, AuthChallenge, BackupRecord, Bytes32,
    GenesisDeclaration, ModelDeclaration, ResurrectionEvent, SessionToken, ATTESTATION_COOLDOWN,
    FALLEN_AFTER,
};
pub use storage::{BlobRecord, BlobStore, BlobTags, InMemoryBlobStore};
pub use trust::{AttestationGraph, AttestationInput, TrustBreakdown, TrustLevel, TrustScore};
