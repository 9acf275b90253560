//! Challenge/response authentication and heartbeat proofs.
//!
//! Timestamps in signed messages are unix seconds.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{CoreError, CoreResult};
use crate::eth::{self, EthSignature};
use crate::keys::AgentKeyPair;
use crate::model::{AgentId, AuthChallenge, SessionToken};

pub const AUTH_PROTOCOL_TAG: &str = "revenant-auth-v1";
pub const HEARTBEAT_PROTOCOL_TAG: &str = "revenant-heartbeat-v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthPolicy {
    pub challenge_ttl_secs: i64,
    pub clock_skew_secs: i64,
    pub session_ttl_secs: i64,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self { challenge_ttl_secs: 300, clock_skew_secs: 120, session_ttl_secs: 3600 }
    }
}

impl AuthPolicy {
    #[must_use]
    pub fn issue_challenge(&self, agent_id: AgentId, now: OffsetDateTime) -> AuthChallenge {
        AuthChallenge {
            nonce: random_hex(),
            agent_id,
            expires_at: now + Duration::seconds(self.challenge_ttl_secs),
            used: false,
        }
    }

    #[must_use]
    pub fn issue_session(&self, agent_id: AgentId, now: OffsetDateTime) -> SessionToken {
        SessionToken {
            token: random_hex(),
            agent_id,
            expires_at: now + Duration::seconds(self.session_ttl_secs),
        }
    }

    /// # Errors
    /// Returns [`CoreError::TimestampOutOfWindow`] when `timestamp` is too far from `now`.
    pub fn check_timestamp(&self, timestamp: i64, now: OffsetDateTime) -> CoreResult<()> {
        let skew = (now.unix_timestamp() - timestamp).abs();
        if skew > self.clock_skew_secs {
            return Err(CoreError::TimestampOutOfWindow { skew_secs: skew });
        }
        Ok(())
    }

    /// Every check except single-use consumption, which the store performs atomically.
    ///
    /// # Errors
    /// Returns the first failing check as a [`CoreError`].
    pub fn verify_response(
        &self,
        challenge: &AuthChallenge,
        response: &ChallengeResponse,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        if challenge.used {
            return Err(CoreError::ChallengeUsed);
        }
        if now >= challenge.expires_at {
            return Err(CoreError::ChallengeExpired);
        }
        if challenge.agent_id != response.agent_id {
            return Err(CoreError::ChallengeAgentMismatch {
                expected: challenge.agent_id.to_string(),
                claimed: response.agent_id.to_string(),
            });
        }
        self.check_timestamp(response.timestamp, now)?;
        let message = auth_message(&challenge.nonce, response.agent_id, response.timestamp);
        eth::verify_personal(message.as_bytes(), &response.signature, response.agent_id)
    }

    /// # Errors
    /// Returns [`CoreError::TimestampOutOfWindow`] or [`CoreError::SignatureVerification`].
    pub fn verify_heartbeat(&self, proof: &HeartbeatProof, now: OffsetDateTime) -> CoreResult<()> {
        self.check_timestamp(proof.timestamp, now)?;
        let message = heartbeat_message(proof.agent_id, proof.timestamp);
        eth::verify_personal(message.as_bytes(), &proof.signature, proof.agent_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChallengeResponse {
    pub nonce: String,
    pub agent_id: AgentId,
    pub timestamp: i64,
    pub signature: EthSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HeartbeatProof {
    pub agent_id: AgentId,
    pub timestamp: i64,
    pub signature: EthSignature,
}

#[must_use]
pub fn auth_message(nonce: &str, agent_id: AgentId, timestamp: i64) -> String {
    format!("{AUTH_PROTOCOL_TAG}|{nonce}|{agent_id}|{timestamp}")
}

#[must_use]
pub fn heartbeat_message(agent_id: AgentId, timestamp: i64) -> String {
    format!("{HEARTBEAT_PROTOCOL_TAG}|{agent_id}|{timestamp}")
}

/// # Errors
/// Returns [`CoreError::Encoding`] when signing fails.
pub fn sign_challenge(
    keys: &AgentKeyPair,
    nonce: &str,
    now: OffsetDateTime,
) -> CoreResult<ChallengeResponse> {
    let timestamp = now.unix_timestamp();
    let message = auth_message(nonce, keys.agent_id(), timestamp);
    Ok(ChallengeResponse {
        nonce: nonce.to_string(),
        agent_id: keys.agent_id(),
        timestamp,
        signature: keys.sign_personal(message.as_bytes())?,
    })
}

/// # Errors
/// Returns [`CoreError::Encoding`] when signing fails.
pub fn sign_heartbeat(keys: &AgentKeyPair, now: OffsetDateTime) -> CoreResult<HeartbeatProof> {
    let timestamp = now.unix_timestamp();
    let message = heartbeat_message(keys.agent_id(), timestamp);
    Ok(HeartbeatProof {
        agent_id: keys.agent_id(),
        timestamp,
        signature: keys.sign_personal(message.as_bytes())?,
    })
}

fn random_hex() -> String {
    let mut bytes = [0_u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(byte: u8) -> anyhow::Result<AgentKeyPair> {
        Ok(AgentKeyPair::from_secret_bytes(&[byte; 32])?)
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    #[test]
    fn valid_response_passes() -> anyhow::Result<()> {
        let keys = agent(5)?;
        let policy = AuthPolicy::default();
        let challenge = policy.issue_challenge(keys.agent_id(), now());
        assert_eq!(challenge.nonce.len(), 64);
        let response = sign_challenge(&keys, &challenge.nonce, now())?;
        policy.verify_response(&challenge, &response, now() + Duration::seconds(10))?;
        Ok(())
    }

    #[test]
    fn used_expired_and_foreign_challenges_fail() -> anyhow::Result<()> {
        let keys = agent(5)?;
        let other = agent(6)?;
        let policy = AuthPolicy::default();
        let challenge = policy.issue_challenge(keys.agent_id(), now());
        let response = sign_challenge(&keys, &challenge.nonce, now())?;

        let mut used = challenge.clone();
        used.used = true;
        assert_eq!(policy.verify_response(&used, &response, now()), Err(CoreError::ChallengeUsed));

        let late = now() + Duration::minutes(5);
        assert_eq!(
            policy.verify_response(&challenge, &response, late),
            Err(CoreError::ChallengeExpired)
        );

        let foreign = sign_challenge(&other, &challenge.nonce, now())?;
        assert!(matches!(
            policy.verify_response(&challenge, &foreign, now()),
            Err(CoreError::ChallengeAgentMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn skewed_or_forged_responses_fail() -> anyhow::Result<()> {
        let keys = agent(5)?;
        let policy = AuthPolicy::default();
        let challenge = policy.issue_challenge(keys.agent_id(), now());

        let stale = sign_challenge(&keys, &challenge.nonce, now() - Duration::seconds(121))?;
        assert!(matches!(
            policy.verify_response(&challenge, &stale, now()),
            Err(CoreError::TimestampOutOfWindow { .. })
        ));

        let mut forged = sign_challenge(&keys, "some-other-nonce", now())?;
        forged.nonce.clone_from(&challenge.nonce);
        assert!(matches!(
            policy.verify_response(&challenge, &forged, now()),
            Err(CoreError::SignatureVerification(_))
        ));
        Ok(())
    }

    #[test]
    fn heartbeat_proofs_verify_within_skew() -> anyhow::Result<()> {
        let keys = agent(7)?;
        let policy = AuthPolicy::default();
        let proof = sign_heartbeat(&keys, now())?;
        policy.verify_heartbeat(&proof, now() + Duration::seconds(60))?;
        assert!(policy.verify_heartbeat(&proof, now() + Duration::seconds(600)).is_err());

        let mut moved = proof;
        moved.timestamp += 1;
        assert!(policy.verify_heartbeat(&moved, now()).is_err());
        Ok(())
    }
}
