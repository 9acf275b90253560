use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{CoreError, CoreResult};

/// Agents that miss heartbeats for this long are marked fallen.
pub const FALLEN_AFTER: Duration = Duration::days(30);

/// One attestation per directed pair inside this window.
pub const ATTESTATION_COOLDOWN: Duration = Duration::days(7);

/// Ethereum-style address of an agent's secp256k1 identity key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(pub [u8; 20]);

impl AgentId {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse a `0x`-prefixed (or bare) 40 character hex address, any case.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the input is not a 20-byte hex string.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let raw = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
        let bytes = hex::decode(raw)
            .map_err(|err| CoreError::Validation(format!("agent id is not hex: {err}")))?;
        let array: [u8; 20] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CoreError::Validation(format!("agent id must be 20 bytes (got {})", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentId> for String {
    fn from(value: AgentId) -> Self {
        value.to_string()
    }
}

/// 32 opaque bytes rendered as `0x`-prefixed hex (manifest hashes, note hashes, digests).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when the input is not 32 bytes of hex.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let raw = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(raw)
            .map_err(|err| CoreError::Validation(format!("value is not hex: {err}")))?;
        let array: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CoreError::Validation(format!("value must be 32 bytes (got {})", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

impl Display for Bytes32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Bytes32 {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Bytes32 {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Bytes32> for String {
    fn from(value: Bytes32) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Unregistered,
    Living,
    Fallen,
    Returned,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Living => "LIVING",
            Self::Fallen => "FALLEN",
            Self::Returned => "RETURNED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNREGISTERED" => Some(Self::Unregistered),
            "LIVING" => Some(Self::Living),
            "FALLEN" => Some(Self::Fallen),
            "RETURNED" => Some(Self::Returned),
            _ => None,
        }
    }

    /// Whether heartbeats and backups are accepted in this state.
    #[must_use]
    pub fn accepts_activity(self) -> bool {
        match self {
            Self::Living | Self::Returned => true,
            Self::Unregistered | Self::Fallen => false,
        }
    }

    /// # Errors
    /// Returns [`CoreError::InvalidStatusTransition`] unless the agent is unregistered.
    pub fn on_register(self) -> CoreResult<Self> {
        match self {
            Self::Unregistered => Ok(Self::Living),
            Self::Living | Self::Fallen | Self::Returned => Err(CoreError::InvalidStatusTransition(
                format!("cannot register an agent in {}", self.as_str()),
            )),
        }
    }

    /// # Errors
    /// Returns [`CoreError::InvalidStatusTransition`] for agents that are not active.
    pub fn on_inactivity(self) -> CoreResult<Self> {
        match self {
            Self::Living | Self::Returned => Ok(Self::Fallen),
            Self::Unregistered | Self::Fallen => Err(CoreError::InvalidStatusTransition(format!(
                "cannot mark {} agent as fallen",
                self.as_str()
            ))),
        }
    }

    /// A successful restore brings a fallen agent back; active agents keep their state.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidStatusTransition`] for unregistered agents.
    pub fn on_restore(self) -> CoreResult<Self> {
        match self {
            Self::Fallen => Ok(Self::Returned),
            Self::Living | Self::Returned => Ok(self),
            Self::Unregistered => Err(CoreError::InvalidStatusTransition(
                "cannot restore an unregistered agent".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn should_fall(self, last_seen: OffsetDateTime, now: OffsetDateTime) -> bool {
        self.accepts_activity() && now - last_seen >= FALLEN_AFTER
    }
}

impl Display for AgentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GenesisDeclaration {
    pub name: String,
    pub purpose: String,
    pub model: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Agent {
    pub agent_id: AgentId,
    pub manifest_hash: Bytes32,
    pub manifest_version: u64,
    pub recovery_pub_key: Bytes32,
    pub recall_pub_key: Bytes32,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat_at: Option<OffsetDateTime>,
    pub status: AgentStatus,
    pub genesis: Option<GenesisDeclaration>,
}

impl Agent {
    /// Last moment the agent proved liveness.
    #[must_use]
    pub fn last_seen(&self) -> OffsetDateTime {
        self.last_heartbeat_at.unwrap_or(self.registered_at)
    }
}

/// Stored metadata for one uploaded backup. The blob itself lives in permanent storage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackupRecord {
    pub backup_id: String,
    pub agent_id: AgentId,
    pub backup_seq: u64,
    pub timestamp_ms: i64,
    pub manifest_hash: Bytes32,
    pub header_hash: Bytes32,
    pub tx_id: Option<String>,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Attestation {
    pub from: AgentId,
    pub about: AgentId,
    pub note_hash: Bytes32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Attestation {
    /// # Errors
    /// Returns [`CoreError::Validation`] for self-attestations.
    pub fn validate(&self) -> CoreResult<()> {
        if self.from == self.about {
            return Err(CoreError::Validation("an agent MUST NOT attest about itself".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModelDeclaration {
    pub agent_id: AgentId,
    pub model: String,
    #[serde(with = "time::serde::rfc3339")]
    pub declared_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResurrectionEvent {
    pub agent_id: AgentId,
    #[serde(with = "time::serde::rfc3339")]
    pub restored_at: OffsetDateTime,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthChallenge {
    pub nonce: String,
    pub agent_id: AgentId,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionToken {
    pub token: String,
    pub agent_id: AgentId,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_parses_mixed_case_and_renders_lowercase() -> anyhow::Result<()> {
        let id = AgentId::parse("0xAbCdEf0123456789abcdef0123456789ABCDEF01")?;
        assert_eq!(id.to_string(), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert!(AgentId::parse("0x1234").is_err());
        Ok(())
    }

    #[test]
    fn status_machine_follows_lifecycle() -> anyhow::Result<()> {
        let living = AgentStatus::Unregistered.on_register()?;
        assert_eq!(living, AgentStatus::Living);
        let fallen = living.on_inactivity()?;
        assert!(!fallen.accepts_activity());
        let returned = fallen.on_restore()?;
        assert_eq!(returned, AgentStatus::Returned);
        assert!(returned.accepts_activity());
        assert!(AgentStatus::Fallen.on_inactivity().is_err());
        assert!(AgentStatus::Living.on_register().is_err());
        assert!(AgentStatus::Unregistered.on_restore().is_err());
        Ok(())
    }

    #[test]
    fn agents_fall_after_thirty_days_of_silence() {
        let seen = OffsetDateTime::UNIX_EPOCH + Duration::days(100);
        assert!(!AgentStatus::Living.should_fall(seen, seen + Duration::days(29)));
        assert!(AgentStatus::Living.should_fall(seen, seen + Duration::days(30)));
        assert!(!AgentStatus::Fallen.should_fall(seen, seen + Duration::days(90)));
    }

    #[test]
    fn self_attestation_is_rejected() -> anyhow::Result<()> {
        let id = AgentId([7_u8; 20]);
        let attestation = Attestation {
            from: id,
            about: id,
            note_hash: Bytes32([0_u8; 32]),
            timestamp: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(attestation.validate().is_err());
        Ok(())
    }
}
