//! secp256k1 signatures in the Ethereum conventions used by the anchor contract:
//! keccak-derived addresses, EIP-191 personal messages and EIP-712 typed data.

use std::fmt::{Display, Formatter};

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::{CoreError, CoreResult};
use crate::model::{AgentId, Bytes32};

pub const SIGNATURE_LEN: usize = 65;

const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";
const EIP712_DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const REGISTER_TYPE: &str = "Register(address agent,bytes32 manifestHash,\
     uint256 manifestVersion,bytes32 recoveryPubKey,uint256 deadline)";
const ATTEST_TYPE: &str = "Attest(address from,address about,bytes32 noteHash,uint256 deadline)";

#[must_use]
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

/// Address = last 20 bytes of keccak256 over the uncompressed point without its `0x04` tag.
#[must_use]
pub fn agent_id_from_verifying_key(key: &VerifyingKey) -> AgentId {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0_u8; 20];
    address.copy_from_slice(&hash[12..]);
    AgentId(address)
}

/// Recoverable signature `r || s || v` with `v` in `{27, 28}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String", into = "String")]
pub struct EthSignature(pub [u8; SIGNATURE_LEN]);

impl EthSignature {
    /// # Errors
    /// Returns [`CoreError::Validation`] for anything but 65 bytes of hex.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let raw = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(raw)
            .map_err(|err| CoreError::Validation(format!("signature is not hex: {err}")))?;
        let array: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CoreError::Validation(format!("signature must be 65 bytes (got {})", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

impl Display for EthSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl TryFrom<String> for EthSignature {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EthSignature> for String {
    fn from(value: EthSignature) -> Self {
        value.to_string()
    }
}

/// # Errors
/// Returns [`CoreError::Encoding`] when the signer rejects the digest.
pub fn sign_prehash(key: &SigningKey, digest: &[u8; 32]) -> CoreResult<EthSignature> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(digest)
        .map_err(|err| CoreError::Encoding(format!("failed to sign digest: {err}")))?;
    let mut out = [0_u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = 27 + recovery_id.to_byte();
    Ok(EthSignature(out))
}

/// # Errors
/// Returns [`CoreError::SignatureVerification`] when no key can be recovered.
pub fn recover_prehash(digest: &[u8; 32], signature: &EthSignature) -> CoreResult<AgentId> {
    let v = signature.0[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte).ok_or_else(|| {
        CoreError::SignatureVerification(format!("invalid recovery id {v}"))
    })?;
    let parsed = Signature::from_slice(&signature.0[..64])
        .map_err(|err| CoreError::SignatureVerification(format!("malformed signature: {err}")))?;
    let key = VerifyingKey::recover_from_prehash(digest, &parsed, recovery_id)
        .map_err(|err| CoreError::SignatureVerification(format!("recovery failed: {err}")))?;
    Ok(agent_id_from_verifying_key(&key))
}

#[must_use]
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX.as_bytes());
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// # Errors
/// Returns [`CoreError::Encoding`] when signing fails.
pub fn sign_personal(key: &SigningKey, message: &[u8]) -> CoreResult<EthSignature> {
    sign_prehash(key, &personal_message_hash(message))
}

/// # Errors
/// Returns [`CoreError::SignatureVerification`] when recovery fails.
pub fn recover_personal(message: &[u8], signature: &EthSignature) -> CoreResult<AgentId> {
    recover_prehash(&personal_message_hash(message), signature)
}

/// # Errors
/// Returns [`CoreError::SignatureVerification`] unless `claimed` produced the signature.
pub fn verify_personal(
    message: &[u8],
    signature: &EthSignature,
    claimed: AgentId,
) -> CoreResult<()> {
    let recovered = recover_personal(message, signature)?;
    if recovered != claimed {
        return Err(CoreError::SignatureVerification(format!(
            "signer {recovered} does not match claimed agent {claimed}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Eip712Domain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: AgentId,
}

impl Eip712Domain {
    #[must_use]
    pub fn separator(&self) -> [u8; 32] {
        let mut encoded = Vec::with_capacity(32 * 5);
        encoded.extend_from_slice(&keccak256(EIP712_DOMAIN_TYPE.as_bytes()));
        encoded.extend_from_slice(&keccak256(self.name.as_bytes()));
        encoded.extend_from_slice(&keccak256(self.version.as_bytes()));
        encoded.extend_from_slice(&encode_u64(self.chain_id));
        encoded.extend_from_slice(&encode_address(self.verifying_contract));
        keccak256(&encoded)
    }
}

pub trait TypedStruct {
    fn struct_hash(&self) -> [u8; 32];
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RegistrationPayload {
    pub agent_id: AgentId,
    pub manifest_hash: Bytes32,
    pub manifest_version: u64,
    pub recovery_pub_key: Bytes32,
    pub deadline: u64,
}

impl TypedStruct for RegistrationPayload {
    fn struct_hash(&self) -> [u8; 32] {
        let mut encoded = Vec::with_capacity(32 * 6);
        encoded.extend_from_slice(&keccak256(REGISTER_TYPE.as_bytes()));
        encoded.extend_from_slice(&encode_address(self.agent_id));
        encoded.extend_from_slice(self.manifest_hash.as_bytes());
        encoded.extend_from_slice(&encode_u64(self.manifest_version));
        encoded.extend_from_slice(self.recovery_pub_key.as_bytes());
        encoded.extend_from_slice(&encode_u64(self.deadline));
        keccak256(&encoded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttestationPayload {
    pub from: AgentId,
    pub about: AgentId,
    pub note_hash: Bytes32,
    pub deadline: u64,
}

impl TypedStruct for AttestationPayload {
    fn struct_hash(&self) -> [u8; 32] {
        let mut encoded = Vec::with_capacity(32 * 5);
        encoded.extend_from_slice(&keccak256(ATTEST_TYPE.as_bytes()));
        encoded.extend_from_slice(&encode_address(self.from));
        encoded.extend_from_slice(&encode_address(self.about));
        encoded.extend_from_slice(self.note_hash.as_bytes());
        encoded.extend_from_slice(&encode_u64(self.deadline));
        keccak256(&encoded)
    }
}

/// A payload together with the agent's EIP-712 signature, ready for the anchor relay.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Signed<T> {
    pub payload: T,
    pub signature: EthSignature,
}

pub type SignedRegistration = Signed<RegistrationPayload>;
pub type SignedAttestation = Signed<AttestationPayload>;

#[must_use]
pub fn typed_data_digest<T: TypedStruct>(domain: &Eip712Domain, payload: &T) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(2 + 64);
    encoded.extend_from_slice(&[0x19, 0x01]);
    encoded.extend_from_slice(&domain.separator());
    encoded.extend_from_slice(&payload.struct_hash());
    keccak256(&encoded)
}

/// # Errors
/// Returns [`CoreError::Encoding`] when signing fails.
pub fn sign_typed<T: TypedStruct + Clone>(
    key: &SigningKey,
    domain: &Eip712Domain,
    payload: &T,
) -> CoreResult<Signed<T>> {
    let signature = sign_prehash(key, &typed_data_digest(domain, payload))?;
    Ok(Signed { payload: payload.clone(), signature })
}

/// # Errors
/// Returns [`CoreError::SignatureVerification`] when the signature does not recover.
pub fn recover_typed<T: TypedStruct>(
    domain: &Eip712Domain,
    signed: &Signed<T>,
) -> CoreResult<AgentId> {
    recover_prehash(&typed_data_digest(domain, &signed.payload), &signed.signature)
}

fn encode_u64(value: u64) -> [u8; 32] {
    let mut word = [0_u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn encode_address(address: AgentId) -> [u8; 32] {
    let mut word = [0_u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}
