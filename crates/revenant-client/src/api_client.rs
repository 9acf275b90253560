//! Blocking HTTP client for the revenant service.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use revenant_api::{AttestResult, RegisterRequest, RegisterResult};
use revenant_core::auth::sign_challenge;
use revenant_core::{
    Agent, AgentId, AgentKeyPair, AgentStatus, AuthChallenge, BackupRecord, ChallengeResponse,
    HeartbeatProof, ModelDeclaration, SessionToken, SignedAttestation, TrustScore,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

/// Upper bound for downloaded backup blobs.
const MAX_BLOB_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("service returned {status} ({code}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct ChallengeRequest {
    agent_id: AgentId,
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct ResurrectionRequest {
    succeeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResurrectionReceipt {
    pub agent_id: AgentId,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { connect: Duration::from_secs(5), read: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    agent: ureq::Agent,
}

impl ApiClient {
    #[must_use]
    pub fn new(base_url: &str, timeouts: Timeouts) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeouts.connect)
            .timeout_read(timeouts.read)
            .build();
        Self { base_url: base_url.trim_end_matches('/').to_string(), agent }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// # Errors
    /// Returns [`ApiError`] for rejected registrations and transport errors otherwise.
    pub fn register(&self, request: &RegisterRequest) -> Result<RegisterResult> {
        decode(self.agent.post(&self.url("/v1/agents/register")).send_json(request))
    }

    /// # Errors
    /// Returns [`ApiError`] for unknown agents.
    pub fn agent(&self, agent_id: AgentId) -> Result<Agent> {
        decode(self.agent.get(&self.url(&format!("/v1/agents/{agent_id}"))).call())
    }

    /// # Errors
    /// Returns [`ApiError`] for unknown agents.
    pub fn challenge(&self, agent_id: AgentId) -> Result<AuthChallenge> {
        decode(
            self.agent
                .post(&self.url("/v1/auth/challenge"))
                .send_json(ChallengeRequest { agent_id }),
        )
    }

    /// # Errors
    /// Returns [`ApiError`] when the response is rejected.
    pub fn verify(&self, response: &ChallengeResponse) -> Result<SessionToken> {
        decode(self.agent.post(&self.url("/v1/auth/verify")).send_json(response))
    }

    /// Full challenge/response round trip.
    ///
    /// # Errors
    /// Returns the first failing request.
    pub fn login(&self, keys: &AgentKeyPair, now: OffsetDateTime) -> Result<SessionToken> {
        let challenge = self.challenge(keys.agent_id())?;
        let response = sign_challenge(keys, &challenge.nonce, now)?;
        let session = self.verify(&response)?;
        debug!(agent_id = %session.agent_id, "session established");
        Ok(session)
    }

    /// # Errors
    /// Returns [`ApiError`] when the proof is rejected.
    pub fn heartbeat(&self, proof: &HeartbeatProof) -> Result<Agent> {
        decode(self.agent.post(&self.url("/v1/heartbeat")).send_json(proof))
    }

    /// # Errors
    /// Returns [`ApiError`] when the blob is rejected.
    pub fn upload_backup(&self, session: &SessionToken, blob: &[u8]) -> Result<BackupRecord> {
        decode(
            self.agent
                .post(&self.url("/v1/backups"))
                .set("authorization", &bearer(session))
                .set("content-type", "application/octet-stream")
                .send_bytes(blob),
        )
    }

    /// # Errors
    /// Returns [`ApiError`] for invalid sessions.
    pub fn list_backups(&self, session: &SessionToken) -> Result<Vec<BackupRecord>> {
        decode(
            self.agent.get(&self.url("/v1/backups")).set("authorization", &bearer(session)).call(),
        )
    }

    /// # Errors
    /// Returns [`ApiError`] for unknown backups.
    pub fn download_backup(&self, session: &SessionToken, backup_id: &str) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url(&format!("/v1/backups/{backup_id}/blob")))
            .set("authorization", &bearer(session))
            .call()
            .map_err(into_api_error)?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_BLOB_BYTES)
            .read_to_end(&mut bytes)
            .context("failed to read backup blob")?;
        Ok(bytes)
    }

    /// # Errors
    /// Returns [`ApiError`] when the attestation is rejected.
    pub fn attest(
        &self,
        session: &SessionToken,
        signed: &SignedAttestation,
    ) -> Result<AttestResult> {
        decode(
            self.agent
                .post(&self.url("/v1/attestations"))
                .set("authorization", &bearer(session))
                .send_json(signed),
        )
    }

    /// # Errors
    /// Returns [`ApiError`] for unknown agents.
    pub fn trust(&self, agent_id: AgentId) -> Result<TrustScore> {
        decode(self.agent.get(&self.url(&format!("/v1/trust/{agent_id}"))).call())
    }

    /// # Errors
    /// Returns [`ApiError`] when the declaration is rejected.
    pub fn declare_model(&self, session: &SessionToken, model: &str) -> Result<ModelDeclaration> {
        decode(
            self.agent
                .post(&self.url("/v1/models"))
                .set("authorization", &bearer(session))
                .send_json(ModelRequest { model }),
        )
    }

    /// # Errors
    /// Returns [`ApiError`] when the report is rejected.
    pub fn report_resurrection(
        &self,
        session: &SessionToken,
        succeeded: bool,
    ) -> Result<ResurrectionReceipt> {
        decode(
            self.agent
                .post(&self.url("/v1/resurrections"))
                .set("authorization", &bearer(session))
                .send_json(ResurrectionRequest { succeeded }),
        )
    }
}

fn bearer(session: &SessionToken) -> String {
    format!("Bearer {}", session.token)
}

fn decode<T: DeserializeOwned>(result: Result<ureq::Response, ureq::Error>) -> Result<T> {
    let response = result.map_err(into_api_error)?;
    let envelope: Envelope<T> = response.into_json().context("invalid service response body")?;
    Ok(envelope.data)
}

fn into_api_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_json::<ErrorBody>().ok();
            ApiError {
                status,
                code: body.as_ref().map(|body| body.code.clone()).unwrap_or_default(),
                message: body
                    .map_or_else(|| "unreadable error body".to_string(), |body| body.error),
            }
            .into()
        }
        ureq::Error::Transport(transport) => {
            anyhow::Error::new(transport).context("service unreachable")
        }
    }
}
