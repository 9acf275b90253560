use std::path::Path;

use anyhow::{anyhow, Context, Result};
use revenant_core::trust::{TrustBreakdown, TrustLevel, TrustScore};
use revenant_core::{
    Agent, AgentId, AgentStatus, AnchorSubmission, Attestation, AuthChallenge, BackupRecord,
    Bytes32, CoreError, ModelDeclaration, RelayJob, RelayJobStatus, ResurrectionEvent,
    SessionToken,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

const LATEST_SCHEMA_VERSION: i64 = 2;

/// How long a backup reservation may wait for its blob before it no longer holds the slot.
pub const PENDING_BACKUP_TTL: Duration = Duration::minutes(15);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS agents (
  agent_id TEXT PRIMARY KEY,
  manifest_hash TEXT NOT NULL,
  manifest_version INTEGER NOT NULL CHECK (manifest_version >= 1),
  recovery_pub_key TEXT NOT NULL,
  recall_pub_key TEXT NOT NULL,
  registered_at TEXT NOT NULL,
  last_heartbeat_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('UNREGISTERED','LIVING','FALLEN','RETURNED')),
  genesis_json TEXT
);

CREATE TABLE IF NOT EXISTS backups (
  backup_id TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  backup_seq INTEGER NOT NULL CHECK (backup_seq >= 1),
  timestamp_ms INTEGER NOT NULL,
  manifest_hash TEXT NOT NULL,
  header_hash TEXT NOT NULL,
  tx_id TEXT,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  created_at TEXT NOT NULL,
  UNIQUE(agent_id, backup_seq),
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS auth_challenges (
  nonce TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  expires_unix INTEGER NOT NULL,
  used INTEGER NOT NULL DEFAULT 0 CHECK (used IN (0, 1))
);

CREATE TABLE IF NOT EXISTS attestations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  from_agent TEXT NOT NULL,
  about_agent TEXT NOT NULL,
  note_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  CHECK (from_agent <> about_agent),
  FOREIGN KEY (from_agent) REFERENCES agents(agent_id),
  FOREIGN KEY (about_agent) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS trust_scores (
  agent_id TEXT PRIMARY KEY,
  score REAL NOT NULL,
  level TEXT NOT NULL CHECK (level IN ('UNVERIFIED','VERIFIED','ESTABLISHED','PILLAR')),
  unique_attesters INTEGER NOT NULL,
  breakdown_json TEXT NOT NULL,
  computed_at TEXT NOT NULL,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS model_declarations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent_id TEXT NOT NULL,
  model TEXT NOT NULL,
  declared_at TEXT NOT NULL,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS resurrections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent_id TEXT NOT NULL,
  restored_at TEXT NOT NULL,
  succeeded INTEGER NOT NULL CHECK (succeeded IN (0, 1)),
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE INDEX IF NOT EXISTS idx_backups_agent_seq ON backups(agent_id, backup_seq);
CREATE INDEX IF NOT EXISTS idx_attestations_pair ON attestations(from_agent, about_agent);
CREATE INDEX IF NOT EXISTS idx_attestations_about ON attestations(about_agent);
CREATE INDEX IF NOT EXISTS idx_model_declarations_agent ON model_declarations(agent_id);
CREATE INDEX IF NOT EXISTS idx_resurrections_agent ON resurrections(agent_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
  token TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  expires_unix INTEGER NOT NULL,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS relay_jobs (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('registration','attestation')),
  payload_json TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL CHECK (status IN ('pending','done','failed')),
  last_error TEXT,
  tx_hash TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_unix);
CREATE INDEX IF NOT EXISTS idx_relay_jobs_status ON relay_jobs(status, created_at);
";

const AGENT_COLUMNS: &str = "agent_id, manifest_hash, manifest_version, recovery_pub_key, \
     recall_pub_key, registered_at, last_heartbeat_at, status, genesis_json";
const BACKUP_COLUMNS: &str = "backup_id, agent_id, backup_seq, timestamp_ms, manifest_hash, \
     header_hash, tx_id, size_bytes, created_at";
const RELAY_JOB_COLUMNS: &str =
    "id, payload_json, attempts, status, last_error, tx_hash, created_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Consistent read of everything one agent's trust score depends on.
#[derive(Debug, Clone)]
pub struct TrustSnapshot {
    pub agent: Agent,
    /// Archived backups only; reservations still waiting on storage are left out.
    pub backups: Vec<BackupRecord>,
    pub model_declarations: Vec<ModelDeclaration>,
    pub resurrections: Vec<ResurrectionEvent>,
    /// Full attestation set; empty when the caller asked to reuse the prior breakdown.
    pub attestations: Vec<Attestation>,
    pub prior: Option<TrustScore>,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version < target {
                self.with_transaction(|tx| {
                    tx.execute_batch(sql)
                        .with_context(|| format!("failed to apply migration v{target}"))?;
                    record_schema_version(tx, target)
                })?;
            }
        }
        Ok(())
    }

    /// Run `f` inside an immediate (write-locking) transaction and commit on success.
    ///
    /// # Errors
    /// Returns the closure's error, or an error when the transaction cannot start or commit.
    pub fn with_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start immediate transaction")?;
        let value = f(&tx)?;
        tx.commit().context("failed to commit transaction")?;
        Ok(value)
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    // ---- agents -------------------------------------------------------------------------

    /// # Errors
    /// Returns an error when the agent already exists or the insert fails.
    pub fn insert_agent(&mut self, agent: &Agent) -> Result<()> {
        let genesis_json = agent
            .genesis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize genesis declaration")?;
        self.conn
            .execute(
                "INSERT INTO agents(
                    agent_id, manifest_hash, manifest_version, recovery_pub_key,
                    recall_pub_key, registered_at, last_heartbeat_at, status, genesis_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    agent.agent_id.to_string(),
                    agent.manifest_hash.to_string(),
                    to_i64(agent.manifest_version, "manifest_version")?,
                    agent.recovery_pub_key.to_string(),
                    agent.recall_pub_key.to_string(),
                    rfc3339(agent.registered_at)?,
                    agent.last_heartbeat_at.map(rfc3339).transpose()?,
                    agent.status.as_str(),
                    genesis_json,
                ],
            )
            .with_context(|| format!("failed to insert agent {}", agent.agent_id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        load_agent(&self.conn, agent_id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY registered_at, agent_id"
        ))?;
        let mut rows = stmt.query([])?;
        let mut agents = Vec::new();
        while let Some(row) = rows.next()? {
            agents.push(agent_from_row(row)?);
        }
        Ok(agents)
    }

    /// Record a verified heartbeat. Only agents whose status accepts activity are updated.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] or [`CoreError::InvalidStatusTransition`] (as
    /// `anyhow::Error`) when the agent cannot take a heartbeat.
    pub fn record_heartbeat(&mut self, agent_id: AgentId, at: OffsetDateTime) -> Result<()> {
        self.with_transaction(|tx| {
            let agent = require_agent(tx, agent_id)?;
            if !agent.status.accepts_activity() {
                return Err(CoreError::InvalidStatusTransition(format!(
                    "{} agents cannot send heartbeats",
                    agent.status
                ))
                .into());
            }
            tx.execute(
                "UPDATE agents SET last_heartbeat_at = ?2 WHERE agent_id = ?1",
                params![agent_id.to_string(), rfc3339(at)?],
            )
            .context("failed to record heartbeat")?;
            Ok(())
        })
    }

    /// Move every active agent silent for 30 days to `FALLEN`.
    ///
    /// # Errors
    /// Returns an error when the sweep transaction fails.
    pub fn mark_fallen(&mut self, now: OffsetDateTime) -> Result<Vec<AgentId>> {
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE status IN ('LIVING','RETURNED')"
            ))?;
            let mut rows = stmt.query([])?;
            let mut fallen = Vec::new();
            while let Some(row) = rows.next()? {
                let agent = agent_from_row(row)?;
                if agent.status.should_fall(agent.last_seen(), now) {
                    fallen.push((agent.agent_id, agent.status.on_inactivity()?));
                }
            }
            drop(rows);
            drop(stmt);

            for (agent_id, status) in &fallen {
                tx.execute(
                    "UPDATE agents SET status = ?2 WHERE agent_id = ?1",
                    params![agent_id.to_string(), status.as_str()],
                )
                .with_context(|| format!("failed to mark {agent_id} as fallen"))?;
            }
            Ok(fallen.into_iter().map(|(agent_id, _)| agent_id).collect())
        })
    }

    // ---- backups ------------------------------------------------------------------------

    /// Atomically check that `record` extends the agent's chain and insert it without a `tx_id`.
    ///
    /// The sequence must be exactly one past the latest stored backup and
    /// `prev_backup_hash` must equal that backup's header hash (`None` for the first backup).
    /// Reservations older than [`PENDING_BACKUP_TTL`] (measured from `record.created_at`) are
    /// released first; younger ones still hold their slot.
    ///
    /// # Errors
    /// Returns [`CoreError::SequenceConflict`] or [`CoreError::Validation`] (as `anyhow::Error`)
    /// when the chain would break.
    pub fn insert_backup_checked(
        &mut self,
        record: &BackupRecord,
        prev_backup_hash: Option<Bytes32>,
    ) -> Result<()> {
        self.with_transaction(|tx| {
            delete_stale_pending_backups(
                tx,
                Some(record.agent_id),
                record.created_at - PENDING_BACKUP_TTL,
            )?;
            let latest = load_latest_backup(tx, record.agent_id)?;
            let expected = latest.as_ref().map_or(1, |backup| backup.backup_seq + 1);
            if record.backup_seq != expected {
                return Err(CoreError::SequenceConflict { expected, got: record.backup_seq }.into());
            }
            let expected_prev = latest.map(|backup| backup.header_hash);
            if prev_backup_hash != expected_prev {
                return Err(CoreError::Validation(format!(
                    "prev_backup_hash must reference the previous backup header ({})",
                    expected_prev.map_or_else(|| "none".to_string(), |hash| hash.to_string())
                ))
                .into());
            }
            insert_backup_row(tx, record)
        })
    }

    /// # Errors
    /// Returns an error when the backup is unknown or the update fails.
    pub fn set_backup_tx_id(&mut self, backup_id: &str, tx_id: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE backups SET tx_id = ?2 WHERE backup_id = ?1",
                params![backup_id, tx_id],
            )
            .context("failed to record backup tx id")?;
        if updated != 1 {
            return Err(CoreError::NotFound(format!("backup {backup_id}")).into());
        }
        Ok(())
    }

    /// Remove a reserved backup whose blob never reached storage.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn discard_pending_backup(&mut self, backup_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM backups WHERE backup_id = ?1 AND tx_id IS NULL",
                params![backup_id],
            )
            .context("failed to discard pending backup")?;
        Ok(deleted == 1)
    }

    /// Backups ordered by sequence.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_backups(&self, agent_id: AgentId) -> Result<Vec<BackupRecord>> {
        load_backups(&self.conn, agent_id)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE backup_id = ?1"))?;
        let mut rows = stmt.query(params![backup_id])?;
        rows.next()?.map(backup_from_row).transpose()
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn latest_backup(&self, agent_id: AgentId) -> Result<Option<BackupRecord>> {
        load_latest_backup(&self.conn, agent_id)
    }

    // ---- auth ---------------------------------------------------------------------------

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_challenge(&mut self, challenge: &AuthChallenge) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO auth_challenges(nonce, agent_id, expires_at, expires_unix, used)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    challenge.nonce,
                    challenge.agent_id.to_string(),
                    rfc3339(challenge.expires_at)?,
                    challenge.expires_at.unix_timestamp(),
                    i64::from(challenge.used),
                ],
            )
            .context("failed to insert auth challenge")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_challenge(&self, nonce: &str) -> Result<Option<AuthChallenge>> {
        load_challenge(&self.conn, nonce)
    }

    /// Check and consume a challenge in one write transaction.
    ///
    /// `verify` sees the stored challenge and runs every non-atomic check; the nonce is marked
    /// used only if it returns `Ok`. Two concurrent callers can never both succeed.
    ///
    /// # Errors
    /// Returns [`CoreError::ChallengeNotFound`], [`CoreError::ChallengeUsed`] or the verifier's
    /// error, each wrapped in `anyhow::Error`.
    pub fn consume_challenge<F>(&mut self, nonce: &str, verify: F) -> Result<AuthChallenge>
    where
        F: FnOnce(&AuthChallenge) -> Result<(), CoreError>,
    {
        self.with_transaction(|tx| {
            let challenge = load_challenge(tx, nonce)?.ok_or(CoreError::ChallengeNotFound)?;
            verify(&challenge)?;
            let updated = tx
                .execute(
                    "UPDATE auth_challenges SET used = 1 WHERE nonce = ?1 AND used = 0",
                    params![nonce],
                )
                .context("failed to mark challenge used")?;
            if updated != 1 {
                return Err(CoreError::ChallengeUsed.into());
            }
            Ok(AuthChallenge { used: true, ..challenge })
        })
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_session(&mut self, session: &SessionToken) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions(token, agent_id, expires_at, expires_unix)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.token,
                    session.agent_id.to_string(),
                    rfc3339(session.expires_at)?,
                    session.expires_at.unix_timestamp(),
                ],
            )
            .context("failed to insert session")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_session(&self, token: &str) -> Result<Option<SessionToken>> {
        let row = self
            .conn
            .query_row(
                "SELECT token, agent_id, expires_at FROM sessions WHERE token = ?1",
                params![token],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to load session")?;
        row.map(|(token, agent_id, expires_at)| {
            Ok(SessionToken {
                token,
                agent_id: AgentId::parse(&agent_id)?,
                expires_at: parse_rfc3339(&expires_at)?,
            })
        })
        .transpose()
    }

    /// Delete expired sessions, challenges and abandoned backup reservations; returns how many
    /// rows went away.
    ///
    /// # Errors
    /// Returns an error when any delete fails.
    pub fn purge_expired(&mut self, now: OffsetDateTime) -> Result<usize> {
        let cutoff = now.unix_timestamp();
        self.with_transaction(|tx| {
            let sessions = tx
                .execute("DELETE FROM sessions WHERE expires_unix <= ?1", params![cutoff])
                .context("failed to purge sessions")?;
            let challenges = tx
                .execute("DELETE FROM auth_challenges WHERE expires_unix <= ?1", params![cutoff])
                .context("failed to purge challenges")?;
            let reservations = delete_stale_pending_backups(tx, None, now - PENDING_BACKUP_TTL)?;
            Ok(sessions + challenges + reservations)
        })
    }

    // ---- attestations -------------------------------------------------------------------

    /// Insert an attestation unless the same directed pair attested within `cooldown`.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for self-attestation and [`CoreError::CooldownActive`]
    /// inside the window, both wrapped in `anyhow::Error`.
    pub fn record_attestation(
        &mut self,
        attestation: &Attestation,
        cooldown: Duration,
    ) -> Result<()> {
        attestation.validate()?;
        self.with_transaction(|tx| {
            let last: Option<String> = tx
                .query_row(
                    "SELECT created_at FROM attestations
                     WHERE from_agent = ?1 AND about_agent = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![attestation.from.to_string(), attestation.about.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to query attestation cooldown")?;
            if let Some(last) = last {
                let elapsed = attestation.timestamp - parse_rfc3339(&last)?;
                if elapsed < cooldown {
                    return Err(CoreError::CooldownActive {
                        remaining_secs: (cooldown - elapsed).whole_seconds(),
                    }
                    .into());
                }
            }
            tx.execute(
                "INSERT INTO attestations(from_agent, about_agent, note_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    attestation.from.to_string(),
                    attestation.about.to_string(),
                    attestation.note_hash.to_string(),
                    rfc3339(attestation.timestamp)?,
                ],
            )
            .context("failed to insert attestation")?;
            Ok(())
        })
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_attestations(&self) -> Result<Vec<Attestation>> {
        load_attestations(&self.conn)
    }

    // ---- trust --------------------------------------------------------------------------

    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn upsert_trust_score(&mut self, score: &TrustScore) -> Result<()> {
        upsert_trust_row(&self.conn, score)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_trust_score(&self, agent_id: AgentId) -> Result<Option<TrustScore>> {
        load_trust_score(&self.conn, agent_id)
    }

    /// Snapshot-read, compute and upsert one agent's score under a single write lock, so two
    /// recomputations of the same agent cannot lose each other's update.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] (as `anyhow::Error`) for unknown agents.
    pub fn recompute_trust<F>(
        &mut self,
        agent_id: AgentId,
        include_attestations: bool,
        compute: F,
    ) -> Result<TrustScore>
    where
        F: FnOnce(&TrustSnapshot) -> TrustScore,
    {
        self.with_transaction(|tx| {
            let snapshot = TrustSnapshot {
                agent: require_agent(tx, agent_id)?,
                backups: load_backups(tx, agent_id)?
                    .into_iter()
                    .filter(|backup| backup.tx_id.is_some())
                    .collect(),
                model_declarations: load_model_declarations(tx, agent_id)?,
                resurrections: load_resurrections(tx, agent_id)?,
                attestations: if include_attestations {
                    load_attestations(tx)?
                } else {
                    Vec::new()
                },
                prior: load_trust_score(tx, agent_id)?,
            };
            let score = compute(&snapshot);
            upsert_trust_row(tx, &score)?;
            Ok(score)
        })
    }

    // ---- model declarations and resurrections -------------------------------------------

    /// # Errors
    /// Returns an error when the agent is unknown or the insert fails.
    pub fn insert_model_declaration(&mut self, declaration: &ModelDeclaration) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO model_declarations(agent_id, model, declared_at) VALUES (?1, ?2, ?3)",
                params![
                    declaration.agent_id.to_string(),
                    declaration.model,
                    rfc3339(declaration.declared_at)?,
                ],
            )
            .context("failed to insert model declaration")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_model_declarations(&self, agent_id: AgentId) -> Result<Vec<ModelDeclaration>> {
        load_model_declarations(&self.conn, agent_id)
    }

    /// Store a restore report and, when it succeeded, apply the restore transition.
    ///
    /// A successful restore is only a resurrection when it moves a fallen agent back to
    /// `RETURNED`; for an active agent nothing is stored and the status is returned unchanged.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] or [`CoreError::InvalidStatusTransition`] (as
    /// `anyhow::Error`).
    pub fn record_resurrection(&mut self, event: &ResurrectionEvent) -> Result<AgentStatus> {
        self.with_transaction(|tx| {
            let agent = require_agent(tx, event.agent_id)?;
            let status = if event.succeeded { agent.status.on_restore()? } else { agent.status };
            if event.succeeded && status == agent.status {
                return Ok(status);
            }
            tx.execute(
                "INSERT INTO resurrections(agent_id, restored_at, succeeded) VALUES (?1, ?2, ?3)",
                params![
                    event.agent_id.to_string(),
                    rfc3339(event.restored_at)?,
                    i64::from(event.succeeded),
                ],
            )
            .context("failed to insert resurrection")?;
            if status != agent.status {
                tx.execute(
                    "UPDATE agents SET status = ?2, last_heartbeat_at = ?3 WHERE agent_id = ?1",
                    params![
                        event.agent_id.to_string(),
                        status.as_str(),
                        rfc3339(event.restored_at)?,
                    ],
                )
                .context("failed to update agent status")?;
            }
            Ok(status)
        })
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_resurrections(&self, agent_id: AgentId) -> Result<Vec<ResurrectionEvent>> {
        load_resurrections(&self.conn, agent_id)
    }

    // ---- relay jobs ---------------------------------------------------------------------

    /// # Errors
    /// Returns an error when the payload cannot be serialized or the insert fails.
    pub fn enqueue_relay_job(&mut self, job: &RelayJob) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO relay_jobs(id, kind, payload_json, attempts, status, last_error,
                                        tx_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id,
                    job.submission.kind(),
                    serde_json::to_string(&job.submission)
                        .context("failed to serialize relay payload")?,
                    i64::from(job.attempts),
                    job.status.as_str(),
                    job.last_error,
                    job.tx_hash,
                    rfc3339(job.created_at)?,
                ],
            )
            .context("failed to enqueue relay job")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_relay_job(&self, id: &str) -> Result<Option<RelayJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RELAY_JOB_COLUMNS} FROM relay_jobs WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        rows.next()?.map(relay_job_from_row).transpose()
    }

    /// Oldest pending jobs first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn pending_relay_jobs(&self, limit: usize) -> Result<Vec<RelayJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RELAY_JOB_COLUMNS} FROM relay_jobs
             WHERE status = 'pending' ORDER BY created_at, id LIMIT ?1"
        ))?;
        let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(relay_job_from_row(row)?);
        }
        Ok(jobs)
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn complete_relay_job(&mut self, id: &str, tx_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE relay_jobs SET status = 'done', attempts = attempts + 1, tx_hash = ?2,
                        last_error = NULL
                 WHERE id = ?1",
                params![id, tx_hash],
            )
            .context("failed to complete relay job")?;
        Ok(())
    }

    /// Count a failed attempt; the job is parked as `failed` after `max_attempts`.
    ///
    /// # Errors
    /// Returns an error when the job is unknown or the update fails.
    pub fn fail_relay_job(
        &mut self,
        id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<RelayJobStatus> {
        self.with_transaction(|tx| {
            let attempts: i64 = tx
                .query_row("SELECT attempts FROM relay_jobs WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .context("failed to load relay job")?
                .ok_or_else(|| CoreError::NotFound(format!("relay job {id}")))?;
            let attempts = attempts + 1;
            let status = if attempts >= i64::from(max_attempts) {
                RelayJobStatus::Failed
            } else {
                RelayJobStatus::Pending
            };
            tx.execute(
                "UPDATE relay_jobs SET attempts = ?2, status = ?3, last_error = ?4 WHERE id = ?1",
                params![id, attempts, status.as_str(), error],
            )
            .context("failed to record relay job failure")?;
            Ok(status)
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn load_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<Agent>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"))?;
    let mut rows = stmt.query(params![agent_id.to_string()])?;
    rows.next()?.map(agent_from_row).transpose()
}

fn require_agent(conn: &Connection, agent_id: AgentId) -> Result<Agent> {
    load_agent(conn, agent_id)?
        .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id}")).into())
}

fn agent_from_row(row: &Row<'_>) -> Result<Agent> {
    let agent_id: String = row.get(0)?;
    let manifest_hash: String = row.get(1)?;
    let manifest_version: i64 = row.get(2)?;
    let recovery_pub_key: String = row.get(3)?;
    let recall_pub_key: String = row.get(4)?;
    let registered_at: String = row.get(5)?;
    let last_heartbeat_at: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    let genesis_json: Option<String> = row.get(8)?;

    Ok(Agent {
        agent_id: AgentId::parse(&agent_id)?,
        manifest_hash: Bytes32::parse(&manifest_hash)?,
        manifest_version: to_u64(manifest_version, "manifest_version")?,
        recovery_pub_key: Bytes32::parse(&recovery_pub_key)?,
        recall_pub_key: Bytes32::parse(&recall_pub_key)?,
        registered_at: parse_rfc3339(&registered_at)?,
        last_heartbeat_at: last_heartbeat_at.as_deref().map(parse_rfc3339).transpose()?,
        status: AgentStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown agent status: {status}"))?,
        genesis: genesis_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("invalid genesis_json")?,
    })
}

fn insert_backup_row(conn: &Connection, record: &BackupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO backups(
            backup_id, agent_id, backup_seq, timestamp_ms, manifest_hash,
            header_hash, tx_id, size_bytes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.backup_id,
            record.agent_id.to_string(),
            to_i64(record.backup_seq, "backup_seq")?,
            record.timestamp_ms,
            record.manifest_hash.to_string(),
            record.header_hash.to_string(),
            record.tx_id,
            to_i64(record.size_bytes, "size_bytes")?,
            rfc3339(record.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert backup {}", record.backup_id))?;
    Ok(())
}

/// Drop reservations created before `cutoff`, for one agent or for all of them.
fn delete_stale_pending_backups(
    conn: &Connection,
    agent_id: Option<AgentId>,
    cutoff: OffsetDateTime,
) -> Result<usize> {
    let stale = {
        let mut stmt = conn.prepare(
            "SELECT backup_id, created_at FROM backups
             WHERE tx_id IS NULL AND (?1 IS NULL OR agent_id = ?1)",
        )?;
        let mut rows = stmt.query(params![agent_id.map(|id| id.to_string())])?;
        let mut stale = Vec::new();
        while let Some(row) = rows.next()? {
            let backup_id: String = row.get(0)?;
            let created_at: String = row.get(1)?;
            if parse_rfc3339(&created_at)? < cutoff {
                stale.push(backup_id);
            }
        }
        stale
    };
    for backup_id in &stale {
        conn.execute(
            "DELETE FROM backups WHERE backup_id = ?1 AND tx_id IS NULL",
            params![backup_id],
        )
        .with_context(|| format!("failed to release stale backup reservation {backup_id}"))?;
    }
    Ok(stale.len())
}

fn load_backups(conn: &Connection, agent_id: AgentId) -> Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups WHERE agent_id = ?1 ORDER BY backup_seq ASC"
    ))?;
    let mut rows = stmt.query(params![agent_id.to_string()])?;
    let mut backups = Vec::new();
    while let Some(row) = rows.next()? {
        backups.push(backup_from_row(row)?);
    }
    Ok(backups)
}

fn load_latest_backup(conn: &Connection, agent_id: AgentId) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups WHERE agent_id = ?1 ORDER BY backup_seq DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query(params![agent_id.to_string()])?;
    rows.next()?.map(backup_from_row).transpose()
}

fn backup_from_row(row: &Row<'_>) -> Result<BackupRecord> {
    let agent_id: String = row.get(1)?;
    let backup_seq: i64 = row.get(2)?;
    let manifest_hash: String = row.get(4)?;
    let header_hash: String = row.get(5)?;
    let size_bytes: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(BackupRecord {
        backup_id: row.get(0)?,
        agent_id: AgentId::parse(&agent_id)?,
        backup_seq: to_u64(backup_seq, "backup_seq")?,
        timestamp_ms: row.get(3)?,
        manifest_hash: Bytes32::parse(&manifest_hash)?,
        header_hash: Bytes32::parse(&header_hash)?,
        tx_id: row.get(6)?,
        size_bytes: to_u64(size_bytes, "size_bytes")?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn load_challenge(conn: &Connection, nonce: &str) -> Result<Option<AuthChallenge>> {
    let row = conn
        .query_row(
            "SELECT nonce, agent_id, expires_at, used FROM auth_challenges WHERE nonce = ?1",
            params![nonce],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to load auth challenge")?;
    row.map(|(nonce, agent_id, expires_at, used)| {
        Ok(AuthChallenge {
            nonce,
            agent_id: AgentId::parse(&agent_id)?,
            expires_at: parse_rfc3339(&expires_at)?,
            used: used != 0,
        })
    })
    .transpose()
}

fn load_attestations(conn: &Connection) -> Result<Vec<Attestation>> {
    let mut stmt = conn.prepare(
        "SELECT from_agent, about_agent, note_hash, created_at FROM attestations ORDER BY id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut attestations = Vec::new();
    while let Some(row) = rows.next()? {
        let from: String = row.get(0)?;
        let about: String = row.get(1)?;
        let note_hash: String = row.get(2)?;
        let created_at: String = row.get(3)?;
        attestations.push(Attestation {
            from: AgentId::parse(&from)?,
            about: AgentId::parse(&about)?,
            note_hash: Bytes32::parse(&note_hash)?,
            timestamp: parse_rfc3339(&created_at)?,
        });
    }
    Ok(attestations)
}

fn upsert_trust_row(conn: &Connection, score: &TrustScore) -> Result<()> {
    conn.execute(
        "INSERT INTO trust_scores(
           agent_id, score, level, unique_attesters, breakdown_json, computed_at
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(agent_id) DO UPDATE SET
           score = excluded.score,
           level = excluded.level,
           unique_attesters = excluded.unique_attesters,
           breakdown_json = excluded.breakdown_json,
           computed_at = excluded.computed_at",
        params![
            score.agent_id.to_string(),
            score.score,
            score.level.as_str(),
            i64::try_from(score.unique_attesters).context("unique_attesters overflow")?,
            serde_json::to_string(&score.breakdown).context("failed to serialize breakdown")?,
            rfc3339(score.computed_at)?,
        ],
    )
    .with_context(|| format!("failed to upsert trust score for {}", score.agent_id))?;
    Ok(())
}

fn load_trust_score(conn: &Connection, agent_id: AgentId) -> Result<Option<TrustScore>> {
    let row = conn
        .query_row(
            "SELECT score, level, unique_attesters, breakdown_json, computed_at
             FROM trust_scores WHERE agent_id = ?1",
            params![agent_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .context("failed to load trust score")?;
    row.map(|(score, level, unique_attesters, breakdown_json, computed_at)| {
        let breakdown: TrustBreakdown =
            serde_json::from_str(&breakdown_json).context("invalid breakdown_json")?;
        Ok(TrustScore {
            agent_id,
            score,
            level: TrustLevel::parse(&level)
                .ok_or_else(|| anyhow!("unknown trust level: {level}"))?,
            unique_attesters: usize::try_from(unique_attesters)
                .context("unique_attesters is negative")?,
            breakdown,
            computed_at: parse_rfc3339(&computed_at)?,
        })
    })
    .transpose()
}

fn load_model_declarations(conn: &Connection, agent_id: AgentId) -> Result<Vec<ModelDeclaration>> {
    let mut stmt = conn.prepare(
        "SELECT model, declared_at FROM model_declarations WHERE agent_id = ?1 ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(params![agent_id.to_string()])?;
    let mut declarations = Vec::new();
    while let Some(row) = rows.next()? {
        let declared_at: String = row.get(1)?;
        declarations.push(ModelDeclaration {
            agent_id,
            model: row.get(0)?,
            declared_at: parse_rfc3339(&declared_at)?,
        });
    }
    Ok(declarations)
}

fn load_resurrections(conn: &Connection, agent_id: AgentId) -> Result<Vec<ResurrectionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT restored_at, succeeded FROM resurrections WHERE agent_id = ?1 ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(params![agent_id.to_string()])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        let restored_at: String = row.get(0)?;
        let succeeded: i64 = row.get(1)?;
        events.push(ResurrectionEvent {
            agent_id,
            restored_at: parse_rfc3339(&restored_at)?,
            succeeded: succeeded != 0,
        });
    }
    Ok(events)
}

fn relay_job_from_row(row: &Row<'_>) -> Result<RelayJob> {
    let payload_json: String = row.get(1)?;
    let attempts: i64 = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let submission: AnchorSubmission =
        serde_json::from_str(&payload_json).context("invalid relay payload_json")?;
    Ok(RelayJob {
        id: row.get(0)?,
        submission,
        attempts: u32::try_from(attempts).context("relay attempts out of range")?,
        status: RelayJobStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown relay job status: {status}"))?,
        last_error: row.get(4)?,
        tx_hash: row.get(5)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{field} does not fit in INTEGER"))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("{field} is negative"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// Fresh ULID for relay job ids.
#[must_use]
pub fn new_job_id() -> String {
    ulid::Ulid::new().to_string()
}
