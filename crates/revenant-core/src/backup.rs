//! Signed backup headers and the `RVNBK1` blob container.
//!
//! Container layout: magic `RVNBK1`, u32 BE header length, canonical header JSON, then for each
//! file in name order: u16 BE name length, `<file>.enc`, u32 BE payload length, `nonce || ct`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_json_of, sha256, sha256_hex};
use crate::envelope::{
    encrypt_backup, BackupContext, EncryptedBackup, EncryptedFile, WrappedKey,
};
use crate::error::{CoreError, CoreResult};
use crate::eth::{self, EthSignature};
use crate::keys::{AgentKeyPair, PublicIdentity};
use crate::model::{AgentId, Bytes32};

pub const BACKUP_PROTOCOL_TAG: &str = "revenant-backup-v1";
pub const BACKUP_FORMAT_VERSION: u32 = 1;
pub const BLOB_MAGIC: &[u8; 6] = b"RVNBK1";
pub const ENCRYPTED_SUFFIX: &str = ".enc";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FileEntry {
    pub size: u64,
    pub sha256: String,
}

impl FileEntry {
    #[must_use]
    pub fn for_payload(payload: &[u8]) -> Self {
        Self { size: payload.len() as u64, sha256: sha256_hex(payload) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackupHeader {
    pub version: u32,
    pub agent_id: AgentId,
    pub backup_id: String,
    pub backup_seq: u64,
    pub timestamp: i64,
    pub manifest_hash: Bytes32,
    pub manifest_version: u64,
    pub prev_backup_hash: Option<Bytes32>,
    pub files: BTreeMap<String, FileEntry>,
    pub wrapped_key_recovery: String,
    pub wrapped_key_recall: String,
    pub signature: Option<EthSignature>,
}

impl BackupHeader {
    /// Fixed-order preimage; every structural field of the backup feeds into it.
    ///
    /// # Errors
    /// Returns [`CoreError::Encoding`] if a variable field cannot be canonicalized.
    pub fn signing_preimage(&self) -> CoreResult<String> {
        let files_hash = sha256_hex(canonical_json_of(&self.files)?.as_bytes());
        let recovery_hash = sha256_hex(canonical_json_of(&self.wrapped_key_recovery)?.as_bytes());
        let recall_hash = sha256_hex(canonical_json_of(&self.wrapped_key_recall)?.as_bytes());
        let prev = self.prev_backup_hash.map(|hash| hash.to_string()).unwrap_or_default();
        Ok([
            BACKUP_PROTOCOL_TAG.to_string(),
            self.agent_id.to_string(),
            self.backup_id.clone(),
            self.backup_seq.to_string(),
            self.timestamp.to_string(),
            self.manifest_hash.to_string(),
            prev,
            files_hash,
            recovery_hash,
            recall_hash,
        ]
        .join("\n"))
    }

    /// Hex SHA-256 of the preimage; this string is what gets personal-signed.
    ///
    /// # Errors
    /// See [`BackupHeader::signing_preimage`].
    pub fn signing_digest(&self) -> CoreResult<String> {
        Ok(sha256_hex(self.signing_preimage()?.as_bytes()))
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when the signer is not the header's agent.
    pub fn sign(&mut self, signer: &AgentKeyPair) -> CoreResult<()> {
        if signer.agent_id() != self.agent_id {
            return Err(CoreError::Validation(format!(
                "signer {} cannot sign a backup for {}",
                signer.agent_id(),
                self.agent_id
            )));
        }
        let digest = self.signing_digest()?;
        self.signature = Some(signer.sign_personal(digest.as_bytes())?);
        Ok(())
    }

    /// Recomputes the preimage and recovers the signer.
    ///
    /// # Errors
    /// Returns [`CoreError::SignatureVerification`] for a missing, foreign or broken signature.
    pub fn verify(&self, claimed: AgentId) -> CoreResult<()> {
        if self.agent_id != claimed {
            return Err(CoreError::SignatureVerification(format!(
                "backup belongs to {}, expected {claimed}",
                self.agent_id
            )));
        }
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| CoreError::SignatureVerification("backup is unsigned".to_string()))?;
        let digest = self.signing_digest()?;
        eth::verify_personal(digest.as_bytes(), signature, claimed)
    }

    /// Hash the next backup in the chain must carry as `prev_backup_hash`.
    ///
    /// # Errors
    /// Returns [`CoreError::Encoding`] if the header cannot be canonicalized.
    pub fn header_hash(&self) -> CoreResult<Bytes32> {
        Ok(Bytes32(sha256(canonical_json_of(self)?.as_bytes())))
    }

    #[must_use]
    pub fn context(&self) -> BackupContext {
        BackupContext {
            backup_id: self.backup_id.clone(),
            timestamp_ms: self.timestamp,
            agent_id: self.agent_id,
            manifest_hash: self.manifest_hash,
        }
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|entry| entry.size).sum()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BackupBlob {
    pub header: BackupHeader,
    pub files: BTreeMap<String, EncryptedFile>,
}

impl BackupBlob {
    /// # Errors
    /// Returns [`CoreError::Encoding`] for names or payloads that do not fit the length fields.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let header = canonical_json_of(&self.header)?.into_bytes();
        let mut out = Vec::with_capacity(BLOB_MAGIC.len() + 4 + header.len());
        out.extend_from_slice(BLOB_MAGIC);
        out.extend_from_slice(&length_u32(header.len(), "header")?.to_be_bytes());
        out.extend_from_slice(&header);
        for (filename, file) in &self.files {
            let name = format!("{filename}{ENCRYPTED_SUFFIX}");
            let name_len = u16::try_from(name.len())
                .map_err(|_| CoreError::Encoding(format!("file name too long: {filename}")))?;
            let payload = file.to_payload();
            out.extend_from_slice(&name_len.to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&length_u32(payload.len(), filename)?.to_be_bytes());
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }

    /// Parses a container and checks every payload against the header's size and hash.
    /// The signature is not checked here; call [`BackupBlob::verify`].
    ///
    /// # Errors
    /// Returns [`CoreError::Encoding`] for malformed containers and
    /// [`CoreError::SignatureVerification`] when a payload disagrees with the header.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader { bytes, offset: 0 };
        if reader.take(BLOB_MAGIC.len())? != BLOB_MAGIC {
            return Err(CoreError::Encoding("not a revenant backup blob".to_string()));
        }
        let header_len = reader.read_u32()? as usize;
        let header: BackupHeader = serde_json::from_slice(reader.take(header_len)?)
            .map_err(|err| CoreError::Encoding(format!("invalid backup header: {err}")))?;

        let mut files = BTreeMap::new();
        while !reader.is_empty() {
            let name_len = usize::from(reader.read_u16()?);
            let name = std::str::from_utf8(reader.take(name_len)?)
                .map_err(|err| CoreError::Encoding(format!("file name is not UTF-8: {err}")))?;
            let filename = name
                .strip_suffix(ENCRYPTED_SUFFIX)
                .ok_or_else(|| CoreError::Encoding(format!("unexpected entry name {name}")))?
                .to_string();
            let payload_len = reader.read_u32()? as usize;
            let payload = reader.take(payload_len)?;

            let entry = header.files.get(&filename).ok_or_else(|| {
                CoreError::SignatureVerification(format!("{filename} is not in the signed header"))
            })?;
            if FileEntry::for_payload(payload) != *entry {
                return Err(CoreError::SignatureVerification(format!(
                    "{filename} does not match its signed size and hash"
                )));
            }
            if files.insert(filename.clone(), EncryptedFile::from_payload(payload)?).is_some() {
                return Err(CoreError::Encoding(format!("duplicate entry {filename}")));
            }
        }
        if files.len() != header.files.len() {
            return Err(CoreError::SignatureVerification(
                "container is missing files listed in the header".to_string(),
            ));
        }
        Ok(Self { header, files })
    }

    /// # Errors
    /// See [`BackupHeader::verify`].
    pub fn verify(&self, claimed: AgentId) -> CoreResult<()> {
        self.header.verify(claimed)
    }

    /// # Errors
    /// Returns [`CoreError::Encoding`] when a wrapped key does not decode.
    pub fn encrypted_backup(&self) -> CoreResult<EncryptedBackup> {
        Ok(EncryptedBackup {
            context: self.header.context(),
            files: self.files.clone(),
            wrapped_key_recovery: WrappedKey::from_base64(&self.header.wrapped_key_recovery)?,
            wrapped_key_recall: WrappedKey::from_base64(&self.header.wrapped_key_recall)?,
        })
    }
}

/// Inputs for [`seal_backup`] that the caller chooses.
#[derive(Debug, Clone)]
pub struct BackupDraft {
    pub backup_id: String,
    pub backup_seq: u64,
    pub timestamp_ms: i64,
    pub manifest_hash: Bytes32,
    pub manifest_version: u64,
    pub prev_backup_hash: Option<Bytes32>,
}

impl BackupDraft {
    #[must_use]
    pub fn new_backup_id() -> String {
        ulid::Ulid::new().to_string()
    }
}

/// Encrypts, builds the header and signs it in one step.
///
/// # Errors
/// Propagates encryption, encoding and signing failures.
pub fn seal_backup(
    signer: &AgentKeyPair,
    recipients: &PublicIdentity,
    draft: BackupDraft,
    files: &BTreeMap<String, Vec<u8>>,
) -> CoreResult<BackupBlob> {
    let context = BackupContext {
        backup_id: draft.backup_id.clone(),
        timestamp_ms: draft.timestamp_ms,
        agent_id: signer.agent_id(),
        manifest_hash: draft.manifest_hash,
    };
    let encrypted = encrypt_backup(
        files,
        recipients.recovery_pub_key.as_bytes(),
        recipients.recall_pub_key.as_bytes(),
        context,
    )?;
    let mut header = BackupHeader {
        version: BACKUP_FORMAT_VERSION,
        agent_id: signer.agent_id(),
        backup_id: draft.backup_id,
        backup_seq: draft.backup_seq,
        timestamp: draft.timestamp_ms,
        manifest_hash: draft.manifest_hash,
        manifest_version: draft.manifest_version,
        prev_backup_hash: draft.prev_backup_hash,
        files: encrypted
            .files
            .iter()
            .map(|(name, file)| (name.clone(), FileEntry::for_payload(&file.to_payload())))
            .collect(),
        wrapped_key_recovery: encrypted.wrapped_key_recovery.to_base64(),
        wrapped_key_recall: encrypted.wrapped_key_recall.to_base64(),
        signature: None,
    };
    header.sign(signer)?;
    Ok(BackupBlob { header, files: encrypted.files })
}

/// Content hash over plaintext file digests; unchanged memory yields the same manifest hash.
///
/// # Errors
/// Returns [`CoreError::Encoding`] if canonicalization fails.
pub fn manifest_hash_of(files: &BTreeMap<String, Vec<u8>>) -> CoreResult<Bytes32> {
    let digests = files
        .iter()
        .map(|(name, content)| (name.clone(), sha256_hex(content)))
        .collect::<BTreeMap<_, _>>();
    Ok(Bytes32(sha256(canonical_json_of(&digests)?.as_bytes())))
}

fn length_u32(len: usize, what: &str) -> CoreResult<u32> {
    u32::try_from(len).map_err(|_| CoreError::Encoding(format!("{what} exceeds 4 GiB")))
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| CoreError::Encoding("backup blob is truncated".to_string()))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> CoreResult<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn read_u32(&mut self) -> CoreResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}
