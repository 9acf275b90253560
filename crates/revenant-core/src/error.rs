#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("signature verification failed: {0}")]
    SignatureVerification(String),
    #[error("auth challenge not found")]
    ChallengeNotFound,
    #[error("auth challenge expired")]
    ChallengeExpired,
    #[error("auth challenge already used")]
    ChallengeUsed,
    #[error("auth challenge is bound to {expected}, not {claimed}")]
    ChallengeAgentMismatch { expected: String, claimed: String },
    #[error("timestamp is outside the accepted clock skew window ({skew_secs}s)")]
    TimestampOutOfWindow { skew_secs: i64 },
    #[error("attestation cooldown active for another {remaining_secs}s")]
    CooldownActive { remaining_secs: i64 },
    #[error("backup sequence conflict: expected {expected}, got {got}")]
    SequenceConflict { expected: u64, got: u64 },
    #[error("storage unreachable: {0}")]
    StorageUnreachable(String),
    #[error("invalid status transition: {0}")]
    InvalidStatusTransition(String),
    #[error("anchor submission failed: {0}")]
    Anchor(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl CoreError {
    /// Cryptographic failures are never downgraded or retried.
    #[must_use]
    pub fn is_cryptographic(&self) -> bool {
        matches!(
            self,
            Self::InvalidMnemonic(_)
                | Self::Decryption(_)
                | Self::Encryption(_)
                | Self::SignatureVerification(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
