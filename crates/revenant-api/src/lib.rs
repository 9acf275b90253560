use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use revenant_core::eth::recover_typed;
use revenant_core::storage::BlobTags;
use revenant_core::trust::{compute_trust_score, TrustInputs};
use revenant_core::{
    Agent, AgentId, AgentStatus, Anchor, AnchorSubmission, Attestation, AttestationGraph,
    AttestationInput, AuthChallenge, AuthPolicy, BackupBlob, BackupRecord, BlobStore, Bytes32,
    ChallengeResponse, CoreError, Eip712Domain, GenesisDeclaration, HeartbeatProof,
    ModelDeclaration, RelayJob, RelayJobStatus, ResurrectionEvent, SessionToken,
    SignedAttestation, SignedRegistration, TrustScore, ATTESTATION_COOLDOWN,
};
use revenant_store_sqlite::{new_job_id, IntegrityReport, SchemaStatus, SqliteStore, TrustSnapshot};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Tunables shared by every operation. Durations are whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    pub auth: AuthPolicy,
    pub attestation_cooldown_secs: i64,
    pub domain: Eip712Domain,
    pub relay_max_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            auth: AuthPolicy::default(),
            attestation_cooldown_secs: ATTESTATION_COOLDOWN.whole_seconds(),
            domain: default_domain(),
            relay_max_attempts: 5,
        }
    }
}

impl ApiConfig {
    fn cooldown(&self) -> Duration {
        Duration::seconds(self.attestation_cooldown_secs)
    }
}

/// Typed-data domain used when no deployment-specific contract is configured.
#[must_use]
pub fn default_domain() -> Eip712Domain {
    Eip712Domain {
        name: "Revenant".to_string(),
        version: "1".to_string(),
        chain_id: 8453,
        verifying_contract: AgentId([0_u8; 20]),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub current_version: i64,
    pub target_version: i64,
    pub applied_versions: Vec<i64>,
    pub up_to_date: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub registration: SignedRegistration,
    pub recall_pub_key: Bytes32,
    pub genesis: Option<GenesisDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterResult {
    pub agent: Agent,
    pub relay_job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestResult {
    pub attestation: Attestation,
    pub trust: TrustScore,
    pub relay_job_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RelaySummary {
    pub submitted: usize,
    pub retrying: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct RevenantApi {
    db_path: PathBuf,
    blob_store: Arc<dyn BlobStore>,
    config: ApiConfig,
}

impl std::fmt::Debug for RevenantApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevenantApi")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RevenantApi {
    #[must_use]
    pub fn new(db_path: PathBuf, blob_store: Arc<dyn BlobStore>, config: ApiConfig) -> Self {
        Self { db_path, blob_store, config }
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.db_path)?.schema_status()
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            current_version: after.current_version,
            target_version: after.target_version,
            applied_versions: before.pending_versions,
            up_to_date: after.pending_versions.is_empty(),
        })
    }

    /// # Errors
    /// Returns an error when an integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Register an agent from its EIP-712 signed registration and queue the anchor submission.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for expired or malformed requests,
    /// [`CoreError::SignatureVerification`] when the signer is not the registering agent and
    /// [`CoreError::InvalidStatusTransition`] when the agent already exists.
    pub fn register_agent(
        &self,
        request: RegisterRequest,
        now: OffsetDateTime,
    ) -> Result<RegisterResult> {
        let payload = &request.registration.payload;
        check_deadline(payload.deadline, now)?;
        if payload.manifest_version == 0 {
            return Err(CoreError::Validation("manifest_version starts at 1".to_string()).into());
        }
        let signer = recover_typed(&self.config.domain, &request.registration)?;
        if signer != payload.agent_id {
            return Err(CoreError::SignatureVerification(format!(
                "registration signed by {signer}, not {}",
                payload.agent_id
            ))
            .into());
        }

        let mut store = self.open_store()?;
        let current = store
            .get_agent(payload.agent_id)?
            .map_or(AgentStatus::Unregistered, |a| a.status);
        let agent = Agent {
            agent_id: payload.agent_id,
            manifest_hash: payload.manifest_hash,
            manifest_version: payload.manifest_version,
            recovery_pub_key: payload.recovery_pub_key,
            recall_pub_key: request.recall_pub_key,
            registered_at: now,
            last_heartbeat_at: None,
            status: current.on_register()?,
            genesis: request.genesis,
        };
        store.insert_agent(&agent)?;
        if let Some(model) = agent.genesis.as_ref().and_then(|genesis| genesis.model.clone()) {
            store.insert_model_declaration(&ModelDeclaration {
                agent_id: agent.agent_id,
                model,
                declared_at: now,
            })?;
        }

        let relay_job_id =
            enqueue(&mut store, AnchorSubmission::Registration(request.registration), now)?;
        info!(agent_id = %agent.agent_id, relay_job_id = %relay_job_id, "agent registered");
        Ok(RegisterResult { agent, relay_job_id })
    }

    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown agents.
    pub fn get_agent(&self, agent_id: AgentId) -> Result<Agent> {
        self.open_store()?
            .get_agent(agent_id)?
            .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id}")).into())
    }

    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown agents.
    pub fn issue_challenge(&self, agent_id: AgentId, now: OffsetDateTime) -> Result<AuthChallenge> {
        let mut store = self.open_store()?;
        if store.get_agent(agent_id)?.is_none() {
            return Err(CoreError::NotFound(format!("agent {agent_id}")).into());
        }
        let challenge = self.config.auth.issue_challenge(agent_id, now);
        store.insert_challenge(&challenge)?;
        debug!(agent_id = %agent_id, "auth challenge issued");
        Ok(challenge)
    }

    /// Check a signed challenge response, consume the nonce and open a session.
    ///
    /// # Errors
    /// Returns the first failing challenge check as a [`CoreError`].
    pub fn verify_challenge(
        &self,
        response: &ChallengeResponse,
        now: OffsetDateTime,
    ) -> Result<SessionToken> {
        let mut store = self.open_store()?;
        let policy = self.config.auth;
        let result = store.consume_challenge(&response.nonce, |challenge| {
            policy.verify_response(challenge, response, now)
        });
        if let Err(err) = &result {
            warn!(agent_id = %response.agent_id, error = %err, "challenge response rejected");
        }
        let challenge = result?;
        let session = policy.issue_session(challenge.agent_id, now);
        store.insert_session(&session)?;
        info!(agent_id = %session.agent_id, "session opened");
        Ok(session)
    }

    /// Resolve a bearer token to the agent it was issued to.
    ///
    /// # Errors
    /// Returns [`CoreError::Unauthorized`] for unknown or expired tokens.
    pub fn authenticate(&self, token: &str, now: OffsetDateTime) -> Result<AgentId> {
        match self.open_store()?.get_session(token)? {
            Some(session) if session.expires_at > now => Ok(session.agent_id),
            Some(_) => Err(CoreError::Unauthorized("session expired".to_string()).into()),
            None => Err(CoreError::Unauthorized("unknown session token".to_string()).into()),
        }
    }

    /// # Errors
    /// Returns [`CoreError::TimestampOutOfWindow`], [`CoreError::SignatureVerification`] or
    /// [`CoreError::InvalidStatusTransition`] for fallen agents.
    pub fn heartbeat(&self, proof: &HeartbeatProof, now: OffsetDateTime) -> Result<Agent> {
        self.config.auth.verify_heartbeat(proof, now)?;
        let mut store = self.open_store()?;
        store.record_heartbeat(proof.agent_id, now)?;
        debug!(agent_id = %proof.agent_id, "heartbeat recorded");
        store
            .get_agent(proof.agent_id)?
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", proof.agent_id)).into())
    }

    /// Verify and archive an encoded backup blob for `agent_id`.
    ///
    /// The sequence slot is reserved before the blob is written; a failed write or confirmation
    /// releases it.
    ///
    /// # Errors
    /// Returns [`CoreError::Unauthorized`] when the blob belongs to another agent,
    /// [`CoreError::SignatureVerification`] for bad signatures or tampered payloads,
    /// [`CoreError::SequenceConflict`] when the sequence does not extend the chain and
    /// [`CoreError::StorageUnreachable`] when permanent storage rejects the write.
    pub fn upload_backup(
        &self,
        agent_id: AgentId,
        bytes: &[u8],
        now: OffsetDateTime,
    ) -> Result<BackupRecord> {
        let blob = BackupBlob::decode(bytes)?;
        let header = &blob.header;
        if header.agent_id != agent_id {
            return Err(CoreError::Unauthorized(format!(
                "backup belongs to {}, session is for {agent_id}",
                header.agent_id
            ))
            .into());
        }
        blob.verify(agent_id)?;

        let mut store = self.open_store()?;
        let agent = store
            .get_agent(agent_id)?
            .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id}")))?;
        if !agent.status.accepts_activity() {
            return Err(CoreError::InvalidStatusTransition(format!(
                "{} agents cannot upload backups",
                agent.status
            ))
            .into());
        }

        let size_bytes = u64::try_from(bytes.len()).context("backup size overflow")?;
        let mut record = BackupRecord {
            backup_id: header.backup_id.clone(),
            agent_id,
            backup_seq: header.backup_seq,
            timestamp_ms: header.timestamp,
            manifest_hash: header.manifest_hash,
            header_hash: header.header_hash()?,
            tx_id: None,
            size_bytes,
            created_at: now,
        };
        store.insert_backup_checked(&record, header.prev_backup_hash)?;

        let tags = BlobTags::for_backup(header, size_bytes);
        let tx_id = match self.blob_store.put(bytes, &tags) {
            Ok(tx_id) => tx_id,
            Err(err) => {
                warn!(
                    agent_id = %agent_id,
                    backup_seq = record.backup_seq,
                    error = %err,
                    "blob write failed"
                );
                store.discard_pending_backup(&record.backup_id)?;
                return Err(err.into());
            }
        };
        if let Err(err) = store.set_backup_tx_id(&record.backup_id, &tx_id) {
            warn!(
                agent_id = %agent_id,
                backup_seq = record.backup_seq,
                tx_id = %tx_id,
                error = %format!("{err:#}"),
                "archived blob could not be confirmed"
            );
            if let Err(discard) = store.discard_pending_backup(&record.backup_id) {
                warn!(
                    backup_id = %record.backup_id,
                    error = %format!("{discard:#}"),
                    "reservation left for expiry"
                );
            }
            return Err(err);
        }
        record.tx_id = Some(tx_id);
        info!(
            agent_id = %agent_id,
            backup_seq = record.backup_seq,
            size_bytes,
            "backup archived"
        );
        Ok(record)
    }

    /// Archived backups in sequence order; reservations still waiting on storage are skipped.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_backups(&self, agent_id: AgentId) -> Result<Vec<BackupRecord>> {
        Ok(self
            .open_store()?
            .list_backups(agent_id)?
            .into_iter()
            .filter(|record| record.tx_id.is_some())
            .collect())
    }

    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown or unarchived backups and storage errors from
    /// the blob store.
    pub fn get_backup_blob(&self, agent_id: AgentId, backup_id: &str) -> Result<Vec<u8>> {
        let record = self
            .open_store()?
            .get_backup(backup_id)?
            .filter(|record| record.agent_id == agent_id)
            .ok_or_else(|| CoreError::NotFound(format!("backup {backup_id}")))?;
        let tx_id = record
            .tx_id
            .ok_or_else(|| CoreError::NotFound(format!("backup {backup_id} is not archived yet")))?;
        Ok(self.blob_store.get(&tx_id)?)
    }

    /// Record a signed attestation from `from`, queue its anchor submission and refresh the
    /// subject's trust score.
    ///
    /// # Errors
    /// Returns [`CoreError::Unauthorized`] when `from` did not sign the payload and
    /// [`CoreError::CooldownActive`] inside the per-pair window.
    pub fn attest(
        &self,
        from: AgentId,
        signed: SignedAttestation,
        now: OffsetDateTime,
    ) -> Result<AttestResult> {
        let payload = &signed.payload;
        if payload.from != from {
            return Err(CoreError::Unauthorized(format!(
                "attestation is from {}, session is for {from}",
                payload.from
            ))
            .into());
        }
        check_deadline(payload.deadline, now)?;
        let signer = recover_typed(&self.config.domain, &signed)?;
        if signer != from {
            return Err(
                CoreError::SignatureVerification(format!("attestation signed by {signer}")).into()
            );
        }
        let attestation = Attestation {
            from,
            about: payload.about,
            note_hash: payload.note_hash,
            timestamp: now,
        };
        attestation.validate()?;

        let mut store = self.open_store()?;
        for id in [from, attestation.about] {
            let agent = store
                .get_agent(id)?
                .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            if id == from && !agent.status.accepts_activity() {
                return Err(CoreError::InvalidStatusTransition(format!(
                    "{} agents cannot attest",
                    agent.status
                ))
                .into());
            }
        }
        store.record_attestation(&attestation, self.config.cooldown())?;
        let relay_job_id = enqueue(&mut store, AnchorSubmission::Attestation(signed), now)?;
        let trust = recompute_with_graph(&mut store, attestation.about, now)?;
        info!(
            from = %from,
            about = %attestation.about,
            score = trust.score,
            "attestation recorded"
        );
        Ok(AttestResult { attestation, trust, relay_job_id })
    }

    /// Stored trust score, computed on first access.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown agents.
    pub fn trust_score(&self, agent_id: AgentId, now: OffsetDateTime) -> Result<TrustScore> {
        let mut store = self.open_store()?;
        match store.get_trust_score(agent_id)? {
            Some(score) => Ok(score),
            None => recompute_with_graph(&mut store, agent_id, now),
        }
    }

    /// Recompute one agent's score. Without fresh attestation data the stored attestation
    /// signal is reused.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown agents.
    pub fn recompute_trust(
        &self,
        agent_id: AgentId,
        include_attestations: bool,
        now: OffsetDateTime,
    ) -> Result<TrustScore> {
        let mut store = self.open_store()?;
        if include_attestations {
            recompute_with_graph(&mut store, agent_id, now)
        } else {
            store.recompute_trust(agent_id, false, |snapshot| {
                score_snapshot(snapshot, AttestationInput::from_prior(snapshot.prior.as_ref()), now)
            })
        }
    }

    /// Propagate the full attestation graph once and return the attestation input for every
    /// registered agent. Each entry can then be applied independently.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn attestation_inputs(&self) -> Result<Vec<(AgentId, AttestationInput)>> {
        let store = self.open_store()?;
        let graph = AttestationGraph::from_attestations(&store.list_attestations()?);
        let raw_scores = graph.propagate();
        Ok(store
            .list_agents()?
            .into_iter()
            .map(|agent| {
                let input = AttestationInput::Fresh {
                    raw: raw_scores.get(&agent.agent_id).copied().unwrap_or(0.0),
                    unique_attesters: graph.unique_attesters(agent.agent_id),
                };
                (agent.agent_id, input)
            })
            .collect())
    }

    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown agents.
    pub fn apply_trust_input(
        &self,
        agent_id: AgentId,
        input: AttestationInput,
        now: OffsetDateTime,
    ) -> Result<TrustScore> {
        self.open_store()?
            .recompute_trust(agent_id, false, |snapshot| score_snapshot(snapshot, input, now))
    }

    /// Sequential batch recomputation over every agent.
    ///
    /// # Errors
    /// Returns the first per-agent failure.
    pub fn recompute_all(&self, now: OffsetDateTime) -> Result<BTreeMap<AgentId, TrustScore>> {
        let mut scores = BTreeMap::new();
        for (agent_id, input) in self.attestation_inputs()? {
            scores.insert(agent_id, self.apply_trust_input(agent_id, input, now)?);
        }
        info!(agents = scores.len(), "trust scores recomputed");
        Ok(scores)
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] for empty model names and
    /// [`CoreError::InvalidStatusTransition`] for inactive agents.
    pub fn declare_model(
        &self,
        agent_id: AgentId,
        model: &str,
        now: OffsetDateTime,
    ) -> Result<ModelDeclaration> {
        let model = model.trim();
        if model.is_empty() {
            return Err(CoreError::Validation("model must not be empty".to_string()).into());
        }
        let mut store = self.open_store()?;
        let agent = store
            .get_agent(agent_id)?
            .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id}")))?;
        if !agent.status.accepts_activity() {
            return Err(CoreError::InvalidStatusTransition(format!(
                "{} agents cannot declare models",
                agent.status
            ))
            .into());
        }
        let declaration = ModelDeclaration { agent_id, model: model.to_string(), declared_at: now };
        store.insert_model_declaration(&declaration)?;
        Ok(declaration)
    }

    /// Record a restore attempt; a successful one returns a fallen agent to service.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] or [`CoreError::InvalidStatusTransition`].
    pub fn record_resurrection(
        &self,
        agent_id: AgentId,
        succeeded: bool,
        now: OffsetDateTime,
    ) -> Result<AgentStatus> {
        let status = self.open_store()?.record_resurrection(&ResurrectionEvent {
            agent_id,
            restored_at: now,
            succeeded,
        })?;
        info!(agent_id = %agent_id, succeeded, status = %status, "resurrection recorded");
        Ok(status)
    }

    /// # Errors
    /// Returns an error when the sweep transaction fails.
    pub fn sweep_fallen(&self, now: OffsetDateTime) -> Result<Vec<AgentId>> {
        let fallen = self.open_store()?.mark_fallen(now)?;
        for agent_id in &fallen {
            warn!(agent_id = %agent_id, "agent marked fallen after missed heartbeats");
        }
        Ok(fallen)
    }

    /// # Errors
    /// Returns an error when the purge fails.
    pub fn purge_expired(&self, now: OffsetDateTime) -> Result<usize> {
        self.open_store()?.purge_expired(now)
    }

    /// Submit up to `limit` pending anchor jobs. Failures stay queued until they exhaust
    /// `relay_max_attempts`.
    ///
    /// # Errors
    /// Returns an error when job bookkeeping fails; anchor failures are recorded, not returned.
    pub fn relay_pending(&self, anchor: &dyn Anchor, limit: usize) -> Result<RelaySummary> {
        let mut store = self.open_store()?;
        let mut summary = RelaySummary::default();
        for job in store.pending_relay_jobs(limit)? {
            match anchor.submit(&job.submission) {
                Ok(receipt) => {
                    store.complete_relay_job(&job.id, &receipt.tx_hash)?;
                    summary.submitted += 1;
                    info!(
                        job_id = %job.id,
                        kind = job.submission.kind(),
                        tx_hash = %receipt.tx_hash,
                        "anchor submission confirmed"
                    );
                }
                Err(err) => {
                    let status = store.fail_relay_job(
                        &job.id,
                        &err.to_string(),
                        self.config.relay_max_attempts,
                    )?;
                    if status == RelayJobStatus::Failed {
                        summary.failed += 1;
                        tracing::error!(
                            job_id = %job.id,
                            kind = job.submission.kind(),
                            error = %err,
                            "anchor submission abandoned"
                        );
                    } else {
                        summary.retrying += 1;
                        warn!(
                            job_id = %job.id,
                            kind = job.submission.kind(),
                            error = %err,
                            "anchor submission failed, will retry"
                        );
                    }
                }
            }
        }
        Ok(summary)
    }

    /// # Errors
    /// Returns [`CoreError::NotFound`] for unknown jobs.
    pub fn relay_job(&self, id: &str) -> Result<RelayJob> {
        self.open_store()?
            .get_relay_job(id)?
            .ok_or_else(|| CoreError::NotFound(format!("relay job {id}")).into())
    }
}

fn check_deadline(deadline: u64, now: OffsetDateTime) -> Result<()> {
    let now_secs = u64::try_from(now.unix_timestamp()).unwrap_or(0);
    if deadline <= now_secs {
        return Err(
            CoreError::Validation(format!("signature deadline {deadline} has passed")).into(),
        );
    }
    Ok(())
}

fn enqueue(
    store: &mut SqliteStore,
    submission: AnchorSubmission,
    now: OffsetDateTime,
) -> Result<String> {
    let job = RelayJob {
        id: new_job_id(),
        submission,
        attempts: 0,
        status: RelayJobStatus::Pending,
        last_error: None,
        tx_hash: None,
        created_at: now,
    };
    store.enqueue_relay_job(&job)?;
    Ok(job.id)
}

fn recompute_with_graph(
    store: &mut SqliteStore,
    agent_id: AgentId,
    now: OffsetDateTime,
) -> Result<TrustScore> {
    store.recompute_trust(agent_id, true, |snapshot| {
        let graph = AttestationGraph::from_attestations(&snapshot.attestations);
        let input = AttestationInput::Fresh {
            raw: graph.raw_score(agent_id),
            unique_attesters: graph.unique_attesters(agent_id),
        };
        score_snapshot(snapshot, input, now)
    })
}

fn score_snapshot(
    snapshot: &TrustSnapshot,
    attestations: AttestationInput,
    now: OffsetDateTime,
) -> TrustScore {
    compute_trust_score(&TrustInputs {
        agent: &snapshot.agent,
        backups: &snapshot.backups,
        model_declarations: &snapshot.model_declarations,
        resurrections: &snapshot.resurrections,
        attestations,
        now,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::anyhow;
    use revenant_core::auth::{sign_challenge, sign_heartbeat};
    use revenant_core::backup::{manifest_hash_of, seal_backup};
    use revenant_core::eth::sign_typed;
    use revenant_core::{
        derive_keys, AttestationPayload, BackupDraft, CoreError, IdentityKeys, InMemoryBlobStore,
        RecordingAnchor, RegistrationPayload,
    };
    use revenant_store_sqlite::PENDING_BACKUP_TTL;
    use tempfile::TempDir;

    use super::*;

    const PHRASE_A: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                            abandon abandon abandon about";
    const PHRASE_B: &str = "legal winner thank year wave sausage worth useful legal winner \
                            thank yellow";

    struct Fixture {
        dir: TempDir,
        api: RevenantApi,
        blobs: Arc<InMemoryBlobStore>,
    }

    fn fixture() -> Result<Fixture> {
        let dir = TempDir::new()?;
        let blobs = Arc::new(InMemoryBlobStore::new());
        let api = RevenantApi::new(
            dir.path().join("revenant.sqlite3"),
            blobs.clone(),
            ApiConfig::default(),
        );
        Ok(Fixture { dir, api, blobs })
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    fn deadline() -> u64 {
        u64::try_from((now() + Duration::days(30)).unix_timestamp()).unwrap_or(u64::MAX)
    }

    fn core_error(err: &anyhow::Error) -> Option<&CoreError> {
        err.downcast_ref::<CoreError>()
    }

    fn register(api: &RevenantApi, keys: &IdentityKeys) -> Result<RegisterResult> {
        let identity = keys.public_identity();
        let registration = sign_typed(
            keys.agent.signing_key(),
            &api.config().domain,
            &RegistrationPayload {
                agent_id: identity.agent_id,
                manifest_hash: Bytes32([9; 32]),
                manifest_version: 1,
                recovery_pub_key: identity.recovery_pub_key,
                deadline: deadline(),
            },
        )?;
        api.register_agent(
            RegisterRequest {
                registration,
                recall_pub_key: identity.recall_pub_key,
                genesis: Some(GenesisDeclaration {
                    name: "scout".to_string(),
                    purpose: "field notes".to_string(),
                    model: Some("model-a".to_string()),
                    created_at: now(),
                }),
            },
            now(),
        )
    }

    fn sealed(keys: &IdentityKeys, seq: u64, prev: Option<Bytes32>) -> Result<BackupBlob> {
        let files =
            BTreeMap::from([("MEMORY.md".to_string(), format!("entry {seq}").into_bytes())]);
        Ok(seal_backup(
            &keys.agent,
            &keys.public_identity(),
            BackupDraft {
                backup_id: BackupDraft::new_backup_id(),
                backup_seq: seq,
                timestamp_ms: 1_700_000_000_000 + i64::try_from(seq)?,
                manifest_hash: manifest_hash_of(&files)?,
                manifest_version: 1,
                prev_backup_hash: prev,
            },
            &files,
        )?)
    }

    #[test]
    fn registration_requires_the_agents_own_signature() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        let other = derive_keys(PHRASE_B)?;

        let result = register(&fx.api, &keys)?;
        assert_eq!(result.agent.status, AgentStatus::Living);
        let job = fx.api.relay_job(&result.relay_job_id)?;
        assert_eq!(job.status, RelayJobStatus::Pending);

        let again = register(&fx.api, &keys).err().ok_or_else(|| anyhow!("double registration"))?;
        assert!(matches!(core_error(&again), Some(CoreError::InvalidStatusTransition(_))));

        let identity = other.public_identity();
        let forged = sign_typed(
            keys.agent.signing_key(),
            &fx.api.config().domain,
            &RegistrationPayload {
                agent_id: identity.agent_id,
                manifest_hash: Bytes32([9; 32]),
                manifest_version: 1,
                recovery_pub_key: identity.recovery_pub_key,
                deadline: deadline(),
            },
        )?;
        let err = fx
            .api
            .register_agent(
                RegisterRequest {
                    registration: forged,
                    recall_pub_key: identity.recall_pub_key,
                    genesis: None,
                },
                now(),
            )
            .err()
            .ok_or_else(|| anyhow!("forged registration accepted"))?;
        assert!(matches!(core_error(&err), Some(CoreError::SignatureVerification(_))));
        Ok(())
    }

    #[test]
    fn challenge_flow_opens_one_session() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        register(&fx.api, &keys)?;

        let challenge = fx.api.issue_challenge(keys.agent_id(), now())?;
        let response = sign_challenge(&keys.agent, &challenge.nonce, now())?;
        let session = fx.api.verify_challenge(&response, now())?;
        assert_eq!(fx.api.authenticate(&session.token, now())?, keys.agent_id());

        let replay = fx
            .api
            .verify_challenge(&response, now())
            .err()
            .ok_or_else(|| anyhow!("replay"))?;
        assert_eq!(core_error(&replay), Some(&CoreError::ChallengeUsed));

        let late = fx
            .api
            .authenticate(&session.token, now() + Duration::hours(2))
            .err()
            .ok_or_else(|| anyhow!("expired session accepted"))?;
        assert!(matches!(core_error(&late), Some(CoreError::Unauthorized(_))));

        let unknown = derive_keys(PHRASE_B)?;
        let err = fx
            .api
            .issue_challenge(unknown.agent_id(), now())
            .err()
            .ok_or_else(|| anyhow!("unknown agent"))?;
        assert!(matches!(core_error(&err), Some(CoreError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn heartbeat_is_rejected_outside_the_skew_window() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        register(&fx.api, &keys)?;

        let agent = fx.api.heartbeat(&sign_heartbeat(&keys.agent, now())?, now())?;
        assert_eq!(agent.last_heartbeat_at, Some(now()));

        let stale = sign_heartbeat(&keys.agent, now() - Duration::minutes(10))?;
        let err = fx.api.heartbeat(&stale, now()).err().ok_or_else(|| anyhow!("stale heartbeat"))?;
        assert!(matches!(core_error(&err), Some(CoreError::TimestampOutOfWindow { .. })));
        Ok(())
    }

    #[test]
    fn uploads_extend_a_verified_hash_chain() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        register(&fx.api, &keys)?;

        let first = sealed(&keys, 1, None)?;
        let record = fx.api.upload_backup(keys.agent_id(), &first.encode()?, now())?;
        assert!(record.tx_id.is_some());
        assert_eq!(fx.blobs.len(), 1);

        let conflicting = sealed(&keys, 1, None)?;
        let err = fx
            .api
            .upload_backup(keys.agent_id(), &conflicting.encode()?, now())
            .err()
            .ok_or_else(|| anyhow!("duplicate sequence accepted"))?;
        assert_eq!(core_error(&err), Some(&CoreError::SequenceConflict { expected: 2, got: 1 }));

        let second = sealed(&keys, 2, Some(first.header.header_hash()?))?;
        fx.api.upload_backup(keys.agent_id(), &second.encode()?, now())?;

        let listed = fx.api.list_backups(keys.agent_id())?;
        assert_eq!(listed.iter().map(|b| b.backup_seq).collect::<Vec<_>>(), vec![1, 2]);
        let bytes = fx.api.get_backup_blob(keys.agent_id(), &listed[1].backup_id)?;
        assert_eq!(BackupBlob::decode(&bytes)?.header, second.header);
        Ok(())
    }

    #[test]
    fn uploads_reject_foreign_and_tampered_blobs() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        let other = derive_keys(PHRASE_B)?;
        register(&fx.api, &keys)?;

        let foreign = sealed(&other, 1, None)?;
        let err = fx
            .api
            .upload_backup(keys.agent_id(), &foreign.encode()?, now())
            .err()
            .ok_or_else(|| anyhow!("foreign blob accepted"))?;
        assert!(matches!(core_error(&err), Some(CoreError::Unauthorized(_))));

        let mut tampered = sealed(&keys, 1, None)?;
        tampered.header.timestamp += 1;
        let err = fx
            .api
            .upload_backup(keys.agent_id(), &tampered.encode()?, now())
            .err()
            .ok_or_else(|| anyhow!("tampered blob accepted"))?;
        assert!(matches!(core_error(&err), Some(CoreError::SignatureVerification(_))));
        assert!(fx.blobs.is_empty());
        Ok(())
    }

    #[test]
    fn attestations_respect_cooldown_and_refresh_trust() -> Result<()> {
        let fx = fixture()?;
        let alice = derive_keys(PHRASE_A)?;
        let bob = derive_keys(PHRASE_B)?;
        register(&fx.api, &alice)?;
        register(&fx.api, &bob)?;

        let payload = AttestationPayload {
            from: alice.agent_id(),
            about: bob.agent_id(),
            note_hash: Bytes32([1; 32]),
            deadline: deadline(),
        };
        let signed = sign_typed(alice.agent.signing_key(), &fx.api.config().domain, &payload)?;
        let result = fx.api.attest(alice.agent_id(), signed.clone(), now())?;
        assert_eq!(result.trust.unique_attesters, 1);
        assert!((result.trust.breakdown.attestations - 0.03).abs() < 1e-9);

        let err = fx
            .api
            .attest(alice.agent_id(), signed.clone(), now() + Duration::days(1))
            .err()
            .ok_or_else(|| anyhow!("cooldown ignored"))?;
        assert_eq!(
            core_error(&err),
            Some(&CoreError::CooldownActive { remaining_secs: 6 * 86_400 })
        );

        let err = fx
            .api
            .attest(bob.agent_id(), signed, now())
            .err()
            .ok_or_else(|| anyhow!("impersonation accepted"))?;
        assert!(matches!(core_error(&err), Some(CoreError::Unauthorized(_))));

        let selfish = sign_typed(
            alice.agent.signing_key(),
            &fx.api.config().domain,
            &AttestationPayload { about: alice.agent_id(), ..payload },
        )?;
        let err = fx
            .api
            .attest(alice.agent_id(), selfish, now())
            .err()
            .ok_or_else(|| anyhow!("self attestation accepted"))?;
        assert!(matches!(core_error(&err), Some(CoreError::Validation(_))));
        Ok(())
    }

    #[test]
    fn batch_recompute_matches_single_agent_recompute() -> Result<()> {
        let fx = fixture()?;
        let alice = derive_keys(PHRASE_A)?;
        let bob = derive_keys(PHRASE_B)?;
        register(&fx.api, &alice)?;
        register(&fx.api, &bob)?;
        let signed = sign_typed(
            alice.agent.signing_key(),
            &fx.api.config().domain,
            &AttestationPayload {
                from: alice.agent_id(),
                about: bob.agent_id(),
                note_hash: Bytes32([1; 32]),
                deadline: deadline(),
            },
        )?;
        fx.api.attest(alice.agent_id(), signed, now())?;

        let later = now() + Duration::days(3);
        let batch = fx.api.recompute_all(later)?;
        let single = fx.api.recompute_trust(bob.agent_id(), true, later)?;
        let from_batch = batch.get(&bob.agent_id()).ok_or_else(|| anyhow!("bob missing"))?;
        assert!((from_batch.score - single.score).abs() < 1e-9);

        let reused = fx.api.recompute_trust(bob.agent_id(), false, later)?;
        assert!((reused.breakdown.attestations - single.breakdown.attestations).abs() < 1e-9);
        assert_eq!(fx.api.trust_score(alice.agent_id(), later)?.unique_attesters, 0);
        Ok(())
    }

    #[test]
    fn fallen_agents_return_after_a_reported_restore() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        register(&fx.api, &keys)?;

        let later = now() + Duration::days(31);
        assert_eq!(fx.api.sweep_fallen(later)?, vec![keys.agent_id()]);
        let err = fx
            .api
            .heartbeat(&sign_heartbeat(&keys.agent, later)?, later)
            .err()
            .ok_or_else(|| anyhow!("fallen heartbeat accepted"))?;
        assert!(matches!(core_error(&err), Some(CoreError::InvalidStatusTransition(_))));

        assert_eq!(
            fx.api.record_resurrection(keys.agent_id(), true, later)?,
            AgentStatus::Returned
        );
        fx.api.heartbeat(&sign_heartbeat(&keys.agent, later)?, later)?;
        Ok(())
    }

    #[test]
    fn restores_of_an_active_agent_earn_no_resilience() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        register(&fx.api, &keys)?;
        let before = fx.api.recompute_trust(keys.agent_id(), true, now())?;

        assert_eq!(fx.api.record_resurrection(keys.agent_id(), true, now())?, AgentStatus::Living);
        assert_eq!(fx.api.record_resurrection(keys.agent_id(), true, now())?, AgentStatus::Living);

        let after = fx.api.recompute_trust(keys.agent_id(), true, now())?;
        assert!((after.breakdown.recovery_resilience - 0.5).abs() < 1e-12);
        assert!((after.score - before.score).abs() < 1e-9);

        let later = now() + Duration::days(31);
        fx.api.sweep_fallen(later)?;
        fx.api.record_resurrection(keys.agent_id(), true, later)?;
        let returned = fx.api.recompute_trust(keys.agent_id(), true, later)?;
        assert!((returned.breakdown.recovery_resilience - 0.75).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn stranded_reservation_expires_and_the_chain_resumes() -> Result<()> {
        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        register(&fx.api, &keys)?;
        let first = sealed(&keys, 1, None)?;

        let mut store = SqliteStore::open(&fx.dir.path().join("revenant.sqlite3"))?;
        store.insert_backup_checked(
            &BackupRecord {
                backup_id: "crashed-upload".to_string(),
                agent_id: keys.agent_id(),
                backup_seq: 1,
                timestamp_ms: first.header.timestamp,
                manifest_hash: first.header.manifest_hash,
                header_hash: Bytes32([3; 32]),
                tx_id: None,
                size_bytes: 1,
                created_at: now(),
            },
            None,
        )?;
        assert!(fx.api.list_backups(keys.agent_id())?.is_empty());

        let err = fx
            .api
            .upload_backup(keys.agent_id(), &first.encode()?, now() + Duration::minutes(1))
            .err()
            .ok_or_else(|| anyhow!("in-flight reservation ignored"))?;
        assert_eq!(core_error(&err), Some(&CoreError::SequenceConflict { expected: 2, got: 1 }));

        let retry_at = now() + PENDING_BACKUP_TTL + Duration::seconds(1);
        let record = fx.api.upload_backup(keys.agent_id(), &first.encode()?, retry_at)?;
        assert_eq!(record.backup_seq, 1);
        let listed = fx.api.list_backups(keys.agent_id())?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].backup_id, first.header.backup_id);
        Ok(())
    }

    #[test]
    fn failed_confirmation_releases_the_reservation() -> Result<()> {
        struct ConfirmBlocker {
            inner: InMemoryBlobStore,
            db_path: PathBuf,
            armed: parking_lot::Mutex<bool>,
        }
        impl BlobStore for ConfirmBlocker {
            fn put(&self, bytes: &[u8], tags: &BlobTags) -> revenant_core::CoreResult<String> {
                let tx_id = self.inner.put(bytes, tags)?;
                let mut armed = self.armed.lock();
                if *armed {
                    *armed = false;
                    let conn = rusqlite::Connection::open(&self.db_path)
                        .map_err(|err| CoreError::StorageUnreachable(err.to_string()))?;
                    conn.execute_batch(
                        "CREATE TRIGGER block_confirm BEFORE UPDATE OF tx_id ON backups
                         BEGIN SELECT RAISE(ABORT, 'confirm blocked'); END;",
                    )
                    .map_err(|err| CoreError::StorageUnreachable(err.to_string()))?;
                }
                Ok(tx_id)
            }
            fn get(&self, tx_id: &str) -> revenant_core::CoreResult<Vec<u8>> {
                self.inner.get(tx_id)
            }
            fn query(
                &self,
                agent_id: AgentId,
            ) -> revenant_core::CoreResult<Vec<revenant_core::storage::BlobRecord>> {
                self.inner.query(agent_id)
            }
        }

        let dir = TempDir::new()?;
        let db_path = dir.path().join("revenant.sqlite3");
        let api = RevenantApi::new(
            db_path.clone(),
            Arc::new(ConfirmBlocker {
                inner: InMemoryBlobStore::new(),
                db_path: db_path.clone(),
                armed: parking_lot::Mutex::new(true),
            }),
            ApiConfig::default(),
        );
        let keys = derive_keys(PHRASE_A)?;
        register(&api, &keys)?;
        let first = sealed(&keys, 1, None)?;

        assert!(api.upload_backup(keys.agent_id(), &first.encode()?, now()).is_err());
        assert!(SqliteStore::open(&db_path)?.latest_backup(keys.agent_id())?.is_none());

        rusqlite::Connection::open(&db_path)?.execute_batch("DROP TRIGGER block_confirm;")?;
        let record = api.upload_backup(keys.agent_id(), &first.encode()?, now())?;
        assert_eq!(record.backup_seq, 1);
        assert!(record.tx_id.is_some());
        Ok(())
    }

    #[test]
    fn relay_retries_then_confirms() -> Result<()> {
        struct FlakyAnchor {
            inner: RecordingAnchor,
            failures: parking_lot::Mutex<u32>,
        }
        impl Anchor for FlakyAnchor {
            fn submit(
                &self,
                submission: &AnchorSubmission,
            ) -> revenant_core::CoreResult<revenant_core::AnchorReceipt> {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(CoreError::Anchor("relay offline".to_string()));
                }
                self.inner.submit(submission)
            }
        }

        let fx = fixture()?;
        let keys = derive_keys(PHRASE_A)?;
        let job_id = register(&fx.api, &keys)?.relay_job_id;
        let anchor = FlakyAnchor {
            inner: RecordingAnchor::new(),
            failures: parking_lot::Mutex::new(1),
        };

        let first = fx.api.relay_pending(&anchor, 10)?;
        assert_eq!(first, RelaySummary { submitted: 0, retrying: 1, failed: 0 });
        let second = fx.api.relay_pending(&anchor, 10)?;
        assert_eq!(second.submitted, 1);

        let job = fx.api.relay_job(&job_id)?;
        assert_eq!(job.status, RelayJobStatus::Done);
        assert_eq!(job.attempts, 2);
        assert_eq!(anchor.inner.submissions().len(), 1);
        Ok(())
    }
}
