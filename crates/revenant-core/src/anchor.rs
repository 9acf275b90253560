//! On-chain anchor seam. Payloads arrive already signed by the agent; the anchor only relays.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CoreResult;
use crate::eth::{SignedAttestation, SignedRegistration};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "signed", rename_all = "snake_case")]
pub enum AnchorSubmission {
    Registration(SignedRegistration),
    Attestation(SignedAttestation),
}

impl AnchorSubmission {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registration(_) => "registration",
            Self::Attestation(_) => "attestation",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelayJobStatus {
    Pending,
    Done,
    Failed,
}

impl RelayJobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A queued anchor submission. Jobs leave `Pending` once they succeed or exhaust retries.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelayJob {
    pub id: String,
    pub submission: AnchorSubmission,
    pub attempts: u32,
    pub status: RelayJobStatus,
    pub last_error: Option<String>,
    pub tx_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnchorReceipt {
    pub tx_hash: String,
}

pub trait Anchor: Send + Sync {
    /// # Errors
    /// Returns [`crate::CoreError::Anchor`] when the submission is rejected or cannot be sent.
    fn submit(&self, submission: &AnchorSubmission) -> CoreResult<AnchorReceipt>;
}

/// Submissions kept by a [`RecordingAnchor`] before the oldest are dropped.
pub const RECORDING_ANCHOR_CAPACITY: usize = 1_024;

/// Keeps the most recent submissions in memory in place of a relay. Nothing reaches a chain.
#[derive(Debug)]
pub struct RecordingAnchor {
    capacity: usize,
    state: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    recent: VecDeque<AnchorSubmission>,
    total: u64,
}

impl Default for RecordingAnchor {
    fn default() -> Self {
        Self::with_capacity(RECORDING_ANCHOR_CAPACITY)
    }
}

impl RecordingAnchor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), state: Mutex::new(Recorded::default()) }
    }

    /// Retained submissions, oldest first.
    #[must_use]
    pub fn submissions(&self) -> Vec<AnchorSubmission> {
        self.state.lock().recent.iter().cloned().collect()
    }

    #[must_use]
    pub fn total_submitted(&self) -> u64 {
        self.state.lock().total
    }
}

impl Anchor for RecordingAnchor {
    fn submit(&self, submission: &AnchorSubmission) -> CoreResult<AnchorReceipt> {
        let mut state = self.state.lock();
        if state.recent.len() == self.capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(submission.clone());
        state.total += 1;
        Ok(AnchorReceipt { tx_hash: format!("local-{}", state.total) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::{sign_typed, Eip712Domain, RegistrationPayload};
    use crate::keys::derive_keys;
    use crate::model::{AgentId, Bytes32};

    #[test]
    fn recording_anchor_keeps_only_the_newest_submissions() -> anyhow::Result<()> {
        let keys = derive_keys(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon about",
        )?;
        let identity = keys.public_identity();
        let domain = Eip712Domain {
            name: "Revenant".to_string(),
            version: "1".to_string(),
            chain_id: 1,
            verifying_contract: AgentId([0; 20]),
        };
        let submission = |version: u64| -> anyhow::Result<AnchorSubmission> {
            Ok(AnchorSubmission::Registration(sign_typed(
                keys.agent.signing_key(),
                &domain,
                &RegistrationPayload {
                    agent_id: identity.agent_id,
                    manifest_hash: Bytes32([0; 32]),
                    manifest_version: version,
                    recovery_pub_key: identity.recovery_pub_key,
                    deadline: 1,
                },
            )?))
        };

        let anchor = RecordingAnchor::with_capacity(2);
        for version in 1..=3 {
            let receipt = anchor.submit(&submission(version)?)?;
            assert_eq!(receipt.tx_hash, format!("local-{version}"));
        }
        assert_eq!(anchor.total_submitted(), 3);
        let kept = anchor.submissions();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], submission(2)?);
        Ok(())
    }
}
