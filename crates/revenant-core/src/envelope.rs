//! Envelope encryption for backups.
//!
//! Each backup gets one random DEK. Files are sealed with AES-256-GCM under per-file HKDF subkeys
//! and an AAD that pins the ciphertext to its backup context and filename. The DEK itself is
//! wrapped once per recipient with an ephemeral X25519 exchange.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::canonical::canonical_json;
use crate::error::{CoreError, CoreResult};
use crate::model::{AgentId, Bytes32};

pub const ENVELOPE_VERSION: u32 = 1;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const WRAPPED_KEY_LEN: usize = 32 + NONCE_LEN + KEY_LEN + TAG_LEN;

const FILE_KEY_PREFIX: &str = "revenant/file-key/v1:";
const WRAP_INFO: &[u8] = b"revenant/wrap/v1";

pub struct DataKey(Zeroizing<[u8; KEY_LEN]>);

impl DataKey {
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0_u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn file_key(&self, filename: &str) -> CoreResult<Zeroizing<[u8; KEY_LEN]>> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.0[..]);
        let mut okm = Zeroizing::new([0_u8; KEY_LEN]);
        hkdf.expand(format!("{FILE_KEY_PREFIX}{filename}").as_bytes(), &mut okm[..])
            .map_err(|err| CoreError::Encryption(format!("file key derivation failed: {err}")))?;
        Ok(okm)
    }
}

impl Debug for DataKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Context every file ciphertext in one backup is bound to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BackupContext {
    pub backup_id: String,
    pub timestamp_ms: i64,
    pub agent_id: AgentId,
    pub manifest_hash: Bytes32,
}

impl BackupContext {
    #[must_use]
    pub fn file_aad(&self, filename: &str) -> Vec<u8> {
        let value = json!({
            "v": ENVELOPE_VERSION,
            "backup_id": self.backup_id,
            "timestamp": self.timestamp_ms,
            "agent_id": self.agent_id.to_string(),
            "manifest_hash": self.manifest_hash.to_string(),
            "filename": filename,
        });
        canonical_json(&value).into_bytes()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EncryptedFile {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedFile {
    /// `nonce || ciphertext`, the form stored in the container and hashed in the header.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// # Errors
    /// Returns [`CoreError::Encoding`] when the payload cannot hold a nonce and a tag.
    pub fn from_payload(payload: &[u8]) -> CoreResult<Self> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(CoreError::Encoding(format!(
                "encrypted payload too short ({} bytes)",
                payload.len()
            )));
        }
        let mut nonce = [0_u8; NONCE_LEN];
        nonce.copy_from_slice(&payload[..NONCE_LEN]);
        Ok(Self { nonce, ciphertext: payload[NONCE_LEN..].to_vec() })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WrappedKey {
    pub ephemeral_pub: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub encrypted_key: [u8; KEY_LEN + TAG_LEN],
}

impl WrappedKey {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WRAPPED_KEY_LEN] {
        let mut out = [0_u8; WRAPPED_KEY_LEN];
        out[..32].copy_from_slice(&self.ephemeral_pub);
        out[32..32 + NONCE_LEN].copy_from_slice(&self.nonce);
        out[32 + NONCE_LEN..].copy_from_slice(&self.encrypted_key);
        out
    }

    /// # Errors
    /// Returns [`CoreError::Encoding`] unless exactly 92 bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != WRAPPED_KEY_LEN {
            return Err(CoreError::Encoding(format!(
                "wrapped key must be {WRAPPED_KEY_LEN} bytes (got {})",
                bytes.len()
            )));
        }
        let mut ephemeral_pub = [0_u8; 32];
        let mut nonce = [0_u8; NONCE_LEN];
        let mut encrypted_key = [0_u8; KEY_LEN + TAG_LEN];
        ephemeral_pub.copy_from_slice(&bytes[..32]);
        nonce.copy_from_slice(&bytes[32..32 + NONCE_LEN]);
        encrypted_key.copy_from_slice(&bytes[32 + NONCE_LEN..]);
        Ok(Self { ephemeral_pub, nonce, encrypted_key })
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// # Errors
    /// Returns [`CoreError::Encoding`] for invalid base64 or a wrong length.
    pub fn from_base64(value: &str) -> CoreResult<Self> {
        let bytes = BASE64
            .decode(value)
            .map_err(|err| CoreError::Encoding(format!("wrapped key is not base64: {err}")))?;
        Self::from_bytes(&bytes)
    }
}

fn wrap_cipher(
    shared: &[u8; 32],
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> CoreResult<Aes256Gcm> {
    let mut info = Vec::with_capacity(WRAP_INFO.len() + 64);
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(ephemeral_pub);
    info.extend_from_slice(recipient_pub);
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut wrapping_key = Zeroizing::new([0_u8; KEY_LEN]);
    hkdf.expand(&info, &mut wrapping_key[..])
        .map_err(|err| CoreError::Encryption(format!("wrap key derivation failed: {err}")))?;
    Aes256Gcm::new_from_slice(&wrapping_key[..])
        .map_err(|err| CoreError::Encryption(format!("invalid wrapping key: {err}")))
}

/// # Errors
/// Returns [`CoreError::Encryption`] when the recipient key yields a non-contributory secret.
pub fn wrap_key(dek: &DataKey, recipient_pub: &[u8; 32]) -> CoreResult<WrappedKey> {
    let recipient = PublicKey::from(*recipient_pub);
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(CoreError::Encryption("recipient public key is low-order".to_string()));
    }

    let cipher = wrap_cipher(shared.as_bytes(), &ephemeral_pub, recipient_pub)?;
    let mut nonce = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), &dek.as_bytes()[..])
        .map_err(|err| CoreError::Encryption(format!("failed to wrap data key: {err}")))?;
    let encrypted_key = sealed.try_into().map_err(|sealed: Vec<u8>| {
        CoreError::Encryption(format!("unexpected wrapped key length {}", sealed.len()))
    })?;
    Ok(WrappedKey { ephemeral_pub, nonce, encrypted_key })
}

/// # Errors
/// Returns [`CoreError::Decryption`] when `secret` is not the key the DEK was wrapped for.
pub fn unwrap_key(wrapped: &WrappedKey, secret: &StaticSecret) -> CoreResult<DataKey> {
    let recipient_pub = PublicKey::from(secret).to_bytes();
    let shared = secret.diffie_hellman(&PublicKey::from(wrapped.ephemeral_pub));
    if !shared.was_contributory() {
        return Err(CoreError::Decryption("ephemeral public key is low-order".to_string()));
    }
    let cipher = wrap_cipher(shared.as_bytes(), &wrapped.ephemeral_pub, &recipient_pub)
        .map_err(|err| CoreError::Decryption(err.to_string()))?;
    let opened = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&wrapped.nonce), &wrapped.encrypted_key[..])
            .map_err(|_| CoreError::Decryption("data key unwrap failed".to_string()))?,
    );
    let mut key = [0_u8; KEY_LEN];
    if opened.len() != KEY_LEN {
        return Err(CoreError::Decryption("unwrapped data key has wrong length".to_string()));
    }
    key.copy_from_slice(&opened);
    Ok(DataKey::from_bytes(key))
}

/// # Errors
/// Returns [`CoreError::Encryption`] if the cipher rejects the input.
pub fn encrypt_file(
    dek: &DataKey,
    context: &BackupContext,
    filename: &str,
    plaintext: &[u8],
) -> CoreResult<EncryptedFile> {
    let file_key = dek.file_key(filename)?;
    let cipher = Aes256Gcm::new_from_slice(&file_key[..])
        .map_err(|err| CoreError::Encryption(format!("invalid file key: {err}")))?;
    let mut nonce = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let aad = context.file_aad(filename);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|err| CoreError::Encryption(format!("failed to encrypt {filename}: {err}")))?;
    Ok(EncryptedFile { nonce, ciphertext })
}

/// # Errors
/// Returns [`CoreError::Decryption`] on any tag mismatch (wrong key, context or filename).
pub fn decrypt_file(
    dek: &DataKey,
    context: &BackupContext,
    filename: &str,
    file: &EncryptedFile,
) -> CoreResult<Vec<u8>> {
    let file_key = dek.file_key(filename).map_err(|err| CoreError::Decryption(err.to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(&file_key[..])
        .map_err(|err| CoreError::Decryption(format!("invalid file key: {err}")))?;
    let aad = context.file_aad(filename);
    cipher
        .decrypt(Nonce::from_slice(&file.nonce), Payload { msg: &file.ciphertext, aad: &aad })
        .map_err(|_| CoreError::Decryption(format!("authentication failed for {filename}")))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EncryptedBackup {
    pub context: BackupContext,
    pub files: BTreeMap<String, EncryptedFile>,
    pub wrapped_key_recovery: WrappedKey,
    pub wrapped_key_recall: WrappedKey,
}

/// # Errors
/// Returns [`CoreError::Encryption`] when a file or wrap operation fails.
pub fn encrypt_backup(
    files: &BTreeMap<String, Vec<u8>>,
    recovery_pub: &[u8; 32],
    recall_pub: &[u8; 32],
    context: BackupContext,
) -> CoreResult<EncryptedBackup> {
    let dek = DataKey::generate();
    let mut encrypted = BTreeMap::new();
    for (filename, plaintext) in files {
        encrypted.insert(filename.clone(), encrypt_file(&dek, &context, filename, plaintext)?);
    }
    Ok(EncryptedBackup {
        wrapped_key_recovery: wrap_key(&dek, recovery_pub)?,
        wrapped_key_recall: wrap_key(&dek, recall_pub)?,
        context,
        files: encrypted,
    })
}

impl EncryptedBackup {
    /// Unwraps the DEK with either recipient secret.
    ///
    /// # Errors
    /// Returns [`CoreError::Decryption`] when the secret matches neither wrapped key.
    pub fn unwrap_data_key(&self, secret: &StaticSecret) -> CoreResult<DataKey> {
        unwrap_key(&self.wrapped_key_recovery, secret)
            .or_else(|_| unwrap_key(&self.wrapped_key_recall, secret))
    }
}

/// All files or nothing.
///
/// # Errors
/// Returns [`CoreError::Decryption`] if the key or any file fails authentication.
pub fn decrypt_backup(
    backup: &EncryptedBackup,
    secret: &StaticSecret,
) -> CoreResult<BTreeMap<String, Vec<u8>>> {
    let dek = backup.unwrap_data_key(secret)?;
    let mut plain = BTreeMap::new();
    for (filename, file) in &backup.files {
        plain.insert(filename.clone(), decrypt_file(&dek, &backup.context, filename, file)?);
    }
    Ok(plain)
}

/// # Errors
/// Returns [`CoreError::NotFound`] for an unknown filename, otherwise as [`decrypt_backup`].
pub fn decrypt_backup_file(
    backup: &EncryptedBackup,
    secret: &StaticSecret,
    filename: &str,
) -> CoreResult<Vec<u8>> {
    let file = backup
        .files
        .get(filename)
        .ok_or_else(|| CoreError::NotFound(format!("file {filename} not in backup")))?;
    let dek = backup.unwrap_data_key(secret)?;
    decrypt_file(&dek, &backup.context, filename, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::X25519KeyPair;

    fn context() -> BackupContext {
        BackupContext {
            backup_id: "01J0000000000000000000TEST".to_string(),
            timestamp_ms: 1_700_000_000_000,
            agent_id: AgentId([0xab; 20]),
            manifest_hash: Bytes32([0xcd; 32]),
        }
    }

    fn files() -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("manifest".to_string(), b"hello".to_vec()),
            ("memory.jsonl".to_string(), b"{\"fact\":1}\n".to_vec()),
        ])
    }

    #[test]
    fn backup_round_trips_for_both_recipients() -> anyhow::Result<()> {
        let recovery = X25519KeyPair::from_secret_bytes([1_u8; 32]);
        let recall = X25519KeyPair::from_secret_bytes([2_u8; 32]);
        let backup = encrypt_backup(
            &files(),
            &recovery.public_bytes(),
            &recall.public_bytes(),
            context(),
        )?;
        assert_eq!(decrypt_backup(&backup, recovery.secret())?, files());
        assert_eq!(decrypt_backup(&backup, recall.secret())?, files());
        assert_eq!(decrypt_backup_file(&backup, recovery.secret(), "manifest")?, b"hello");
        Ok(())
    }

    #[test]
    fn unrelated_secret_cannot_unwrap() -> anyhow::Result<()> {
        let recovery = X25519KeyPair::from_secret_bytes([1_u8; 32]);
        let stranger = X25519KeyPair::from_secret_bytes([9_u8; 32]);
        let dek = DataKey::generate();
        let wrapped = wrap_key(&dek, &recovery.public_bytes())?;
        assert_eq!(unwrap_key(&wrapped, recovery.secret())?.as_bytes(), dek.as_bytes());
        assert!(matches!(
            unwrap_key(&wrapped, stranger.secret()),
            Err(CoreError::Decryption(_))
        ));
        Ok(())
    }

    #[test]
    fn changed_context_or_filename_fails_authentication() -> anyhow::Result<()> {
        let dek = DataKey::generate();
        let sealed = encrypt_file(&dek, &context(), "manifest", b"hello")?;
        assert_eq!(decrypt_file(&dek, &context(), "manifest", &sealed)?, b"hello");

        let mut other = context();
        other.backup_id.push('X');
        assert!(matches!(
            decrypt_file(&dek, &other, "manifest", &sealed),
            Err(CoreError::Decryption(_))
        ));
        assert!(decrypt_file(&dek, &context(), "renamed", &sealed).is_err());
        assert!(decrypt_file(&DataKey::generate(), &context(), "manifest", &sealed).is_err());
        Ok(())
    }

    #[test]
    fn flipped_ciphertext_byte_yields_no_plaintext() -> anyhow::Result<()> {
        let recovery = X25519KeyPair::from_secret_bytes([1_u8; 32]);
        let recall = X25519KeyPair::from_secret_bytes([2_u8; 32]);
        let mut backup = encrypt_backup(
            &files(),
            &recovery.public_bytes(),
            &recall.public_bytes(),
            context(),
        )?;
        if let Some(file) = backup.files.get_mut("memory.jsonl") {
            file.ciphertext[0] ^= 0x01;
        }
        assert!(matches!(
            decrypt_backup(&backup, recovery.secret()),
            Err(CoreError::Decryption(_))
        ));
        assert_eq!(decrypt_backup_file(&backup, recovery.secret(), "manifest")?, b"hello");
        Ok(())
    }

    #[test]
    fn wrapped_key_serializes_to_ninety_two_bytes() -> anyhow::Result<()> {
        let recipient = X25519KeyPair::from_secret_bytes([3_u8; 32]);
        let wrapped = wrap_key(&DataKey::generate(), &recipient.public_bytes())?;
        assert_eq!(wrapped.to_bytes().len(), 92);
        assert_eq!(WrappedKey::from_base64(&wrapped.to_base64())?, wrapped);
        assert!(WrappedKey::from_bytes(&[0_u8; 91]).is_err());
        Ok(())
    }

    #[test]
    fn low_order_recipient_is_rejected() {
        let result = wrap_key(&DataKey::generate(), &[0_u8; 32]);
        assert!(matches!(result, Err(CoreError::Encryption(_))));
    }
}
