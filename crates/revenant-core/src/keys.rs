//! Deterministic key hierarchy: one BIP39 phrase yields the recovery, agent and recall key pairs.

use std::fmt::{Debug, Formatter};

use hkdf::Hkdf;
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CoreError, CoreResult};
use crate::eth::{self, EthSignature};
use crate::model::{AgentId, Bytes32};

pub const IDENTITY_SALT: &[u8] = b"revenant-identity-v1";
const RECOVERY_INFO: &[u8] = b"revenant/recovery-x25519/v1";
const AGENT_INFO: &[u8] = b"revenant/agent-secp256k1/v1";
const RECALL_INFO: &[u8] = b"revenant/recall-x25519/v1";

/// secp256k1 group order `n`, big-endian.
const SECP256K1_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

pub const MNEMONIC_WORDS: usize = 12;

pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Builds a pair from raw bytes, applying RFC 7748 clamping first.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(clamp_x25519(bytes));
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[must_use]
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

impl Debug for X25519KeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X25519KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

pub struct AgentKeyPair {
    signing_key: SigningKey,
    agent_id: AgentId,
}

impl AgentKeyPair {
    /// # Errors
    /// Returns [`CoreError::Validation`] when the bytes are not a valid secp256k1 scalar.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> CoreResult<Self> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|err| CoreError::Validation(format!("invalid agent secret: {err}")))?;
        let agent_id = eth::agent_id_from_verifying_key(signing_key.verifying_key());
        Ok(Self { signing_key, agent_id })
    }

    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0_u8; 32]);
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// # Errors
    /// Returns [`CoreError::Encoding`] when signing fails.
    pub fn sign_personal(&self, message: &[u8]) -> CoreResult<EthSignature> {
        eth::sign_personal(&self.signing_key, message)
    }
}

impl Debug for AgentKeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKeyPair").field("agent_id", &self.agent_id).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct IdentityKeys {
    pub recovery: X25519KeyPair,
    pub agent: AgentKeyPair,
    pub recall: X25519KeyPair,
}

impl IdentityKeys {
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent.agent_id()
    }

    #[must_use]
    pub fn public_identity(&self) -> PublicIdentity {
        PublicIdentity {
            agent_id: self.agent.agent_id(),
            recovery_pub_key: Bytes32(self.recovery.public_bytes()),
            recall_pub_key: Bytes32(self.recall.public_bytes()),
        }
    }
}

/// Everything about an identity that may be shared or stored in plaintext.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PublicIdentity {
    pub agent_id: AgentId,
    pub recovery_pub_key: Bytes32,
    pub recall_pub_key: Bytes32,
}

/// Lowercases and collapses whitespace so pasted phrases compare equal.
#[must_use]
pub fn normalize_mnemonic(phrase: &str) -> String {
    phrase.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// # Errors
/// Returns [`CoreError::InvalidMnemonic`] for unknown words, wrong length or a bad checksum.
pub fn parse_mnemonic(phrase: &str) -> CoreResult<bip39::Mnemonic> {
    let normalized = Zeroizing::new(normalize_mnemonic(phrase));
    bip39::Mnemonic::parse_in_normalized(bip39::Language::English, &normalized)
        .map_err(|err| CoreError::InvalidMnemonic(err.to_string()))
}

/// BIP39 seed with the empty passphrase.
///
/// # Errors
/// Returns [`CoreError::InvalidMnemonic`] when the phrase does not parse.
pub fn mnemonic_to_seed(phrase: &str) -> CoreResult<Zeroizing<[u8; 64]>> {
    let mnemonic = parse_mnemonic(phrase)?;
    Ok(Zeroizing::new(mnemonic.to_seed_normalized("")))
}

/// # Errors
/// Returns [`CoreError::InvalidMnemonic`] for a bad phrase.
pub fn derive_keys(phrase: &str) -> CoreResult<IdentityKeys> {
    let seed = mnemonic_to_seed(phrase)?;
    derive_from_seed(&seed)
}

/// # Errors
/// Returns [`CoreError::Encoding`] if HKDF expansion fails, which cannot happen for 32-byte
/// outputs.
pub fn derive_from_seed(seed: &[u8; 64]) -> CoreResult<IdentityKeys> {
    let hkdf = Hkdf::<Sha256>::new(Some(IDENTITY_SALT), seed);

    let recovery_bytes = expand(&hkdf, RECOVERY_INFO)?;
    let agent_bytes = expand(&hkdf, AGENT_INFO)?;
    let recall_bytes = expand(&hkdf, RECALL_INFO)?;

    let agent_scalar = Zeroizing::new(reduce_to_scalar(*agent_bytes));
    Ok(IdentityKeys {
        recovery: X25519KeyPair::from_secret_bytes(*recovery_bytes),
        agent: AgentKeyPair::from_secret_bytes(&agent_scalar)?,
        recall: X25519KeyPair::from_secret_bytes(*recall_bytes),
    })
}

fn expand(hkdf: &Hkdf<Sha256>, info: &[u8]) -> CoreResult<Zeroizing<[u8; 32]>> {
    let mut okm = Zeroizing::new([0_u8; 32]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|err| CoreError::Encoding(format!("hkdf expand failed: {err}")))?;
    Ok(okm)
}

/// A fresh 12-word phrase from 128 bits of OS entropy.
///
/// # Errors
/// Returns [`CoreError::Encoding`] if the entropy is rejected by the word-list encoder.
pub fn generate_mnemonic() -> CoreResult<Zeroizing<String>> {
    let mut entropy = [0_u8; 16];
    OsRng.fill_bytes(&mut entropy);
    let mnemonic = bip39::Mnemonic::from_entropy(&entropy)
        .map_err(|err| CoreError::Encoding(format!("failed to build mnemonic: {err}")));
    entropy.zeroize();
    Ok(Zeroizing::new(mnemonic?.to_string()))
}

#[must_use]
pub fn clamp_x25519(mut bytes: [u8; 32]) -> [u8; 32] {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    bytes
}

/// Maps any 256-bit value into `[1, n - 1]` as `(value mod (n - 1)) + 1`.
///
/// `2^256 < 2 (n - 1)`, so a single conditional subtraction is a full reduction.
#[must_use]
pub fn reduce_to_scalar(mut value: [u8; 32]) -> [u8; 32] {
    let modulus = order_minus_one();
    if value >= modulus {
        value = sub_be(&value, &modulus);
    }
    add_one_be(&mut value);
    value
}

fn order_minus_one() -> [u8; 32] {
    let mut value = SECP256K1_ORDER;
    value[31] -= 1;
    value
}

fn sub_be(lhs: &[u8; 32], rhs: &[u8; 32]) -> [u8; 32] {
    let mut out = [0_u8; 32];
    let mut borrow = 0_u8;
    for index in (0..32).rev() {
        let (partial, under_a) = lhs[index].overflowing_sub(rhs[index]);
        let (digit, under_b) = partial.overflowing_sub(borrow);
        out[index] = digit;
        borrow = u8::from(under_a || under_b);
    }
    out
}

fn add_one_be(value: &mut [u8; 32]) {
    for byte in value.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                           abandon abandon abandon about";
    const LEGAL: &str =
        "legal winner thank year wave sausage worth useful legal winner thank yellow";

    #[test]
    fn bip39_seed_matches_reference_vector() -> anyhow::Result<()> {
        let seed = mnemonic_to_seed(ABANDON)?;
        assert_eq!(
            hex::encode(seed.as_slice()),
            "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc1\
             9a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4"
        );
        Ok(())
    }

    #[test]
    fn derivation_is_deterministic_and_normalizes_input() -> anyhow::Result<()> {
        let first = derive_keys(ABANDON)?;
        let second = derive_keys(&format!("  {}\n", ABANDON.to_uppercase()))?;
        assert_eq!(first.public_identity(), second.public_identity());
        assert_eq!(*first.agent.secret_bytes(), *second.agent.secret_bytes());
        assert!(first.agent_id().to_string().starts_with("0x"));
        assert_eq!(first.agent_id().to_string().len(), 42);
        Ok(())
    }

    #[test]
    fn different_phrases_yield_unrelated_identities() -> anyhow::Result<()> {
        let lhs = derive_keys(ABANDON)?.public_identity();
        let rhs = derive_keys(LEGAL)?.public_identity();
        assert_ne!(lhs.agent_id, rhs.agent_id);
        assert_ne!(lhs.recovery_pub_key, rhs.recovery_pub_key);
        assert_ne!(lhs.recall_pub_key, rhs.recall_pub_key);
        Ok(())
    }

    #[test]
    fn three_key_pairs_are_independent() -> anyhow::Result<()> {
        let keys = derive_keys(ABANDON)?;
        assert_ne!(keys.recovery.public_bytes(), keys.recall.public_bytes());
        assert_ne!(*keys.recovery.secret_bytes(), *keys.recall.secret_bytes());
        Ok(())
    }

    #[test]
    fn bad_checksum_is_invalid_mnemonic() {
        let err = derive_keys(&"abandon ".repeat(12));
        assert!(matches!(err, Err(CoreError::InvalidMnemonic(_))));
        assert!(matches!(derive_keys("not a phrase"), Err(CoreError::InvalidMnemonic(_))));
    }

    #[test]
    fn generated_phrases_have_twelve_words_and_derive() -> anyhow::Result<()> {
        let phrase = generate_mnemonic()?;
        assert_eq!(phrase.split_whitespace().count(), MNEMONIC_WORDS);
        derive_keys(&phrase)?;
        Ok(())
    }

    #[test]
    fn scalar_reduction_edges() {
        let n_minus_one = order_minus_one();
        let mut one = [0_u8; 32];
        one[31] = 1;
        assert_eq!(reduce_to_scalar(n_minus_one), one);
        assert_eq!(reduce_to_scalar([0_u8; 32]), one);

        let mut n_minus_two = n_minus_one;
        n_minus_two[31] -= 1;
        assert_eq!(reduce_to_scalar(n_minus_two), n_minus_one);

        let top = reduce_to_scalar([0xff; 32]);
        assert!(top < SECP256K1_ORDER);
    }

    proptest! {
        #[test]
        fn reduced_scalars_are_valid_secp256k1_keys(bytes in any::<[u8; 32]>()) {
            let scalar = reduce_to_scalar(bytes);
            prop_assert!(scalar < SECP256K1_ORDER);
            prop_assert!(scalar != [0_u8; 32]);
            prop_assert!(SigningKey::from_slice(&scalar).is_ok());
        }

        #[test]
        fn x25519_secrets_are_clamped(bytes in any::<[u8; 32]>()) {
            let pair = X25519KeyPair::from_secret_bytes(bytes);
            let secret = pair.secret_bytes();
            prop_assert_eq!(secret[0] & 0b0000_0111, 0);
            prop_assert_eq!(secret[31] & 0b1000_0000, 0);
            prop_assert_eq!(secret[31] & 0b0100_0000, 0b0100_0000);
        }

        #[test]
        fn seeds_derive_the_same_identity_twice(
            seed in proptest::collection::vec(any::<u8>(), 64),
        ) {
            let mut array = [0_u8; 64];
            array.copy_from_slice(&seed);
            let lhs = derive_from_seed(&array).map_err(|err| TestCaseError::fail(err.to_string()))?;
            let rhs = derive_from_seed(&array).map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(lhs.public_identity(), rhs.public_identity());
            let secret = lhs.agent.secret_bytes();
            prop_assert!(*secret < SECP256K1_ORDER);
        }
    }
}
