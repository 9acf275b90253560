mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Result;
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use revenant_api::{
    AttestResult, MigrateResult, RegisterRequest, RegisterResult, RevenantApi, API_CONTRACT_VERSION,
};
use revenant_core::{
    Agent, AgentId, AgentStatus, AuthChallenge, BackupRecord, ChallengeResponse, CoreError,
    HeartbeatProof, ModelDeclaration, RelayJob, SessionToken, SignedAttestation, TrustScore,
};
use revenant_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, ServiceConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: RevenantApi,
    relay_notify: Arc<Notify>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct ChallengeRequest {
    agent_id: AgentId,
}

#[derive(Debug, Clone, Deserialize)]
struct RecomputeRequest {
    #[serde(default = "default_true")]
    include_attestations: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelRequest {
    model: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ResurrectionRequest {
    succeeded: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ResurrectionReceipt {
    agent_id: AgentId,
    status: AgentStatus,
}

fn default_true() -> bool {
    true
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: message.into(),
        }
    }

    /// Domain failures keep their meaning at the HTTP edge; anything else is internal.
    fn from_anyhow(err: &anyhow::Error) -> Self {
        let Some(core) = err.downcast_ref::<CoreError>() else {
            error!(error = %format!("{err:#}"), "request failed");
            return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{err:#}"));
        };
        let (status, code) = match core {
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::ChallengeNotFound => (StatusCode::NOT_FOUND, "challenge_not_found"),
            CoreError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            CoreError::SignatureVerification(_) => {
                (StatusCode::UNAUTHORIZED, "signature_verification")
            }
            CoreError::ChallengeExpired => (StatusCode::UNAUTHORIZED, "challenge_expired"),
            CoreError::ChallengeUsed => (StatusCode::UNAUTHORIZED, "challenge_used"),
            CoreError::ChallengeAgentMismatch { .. } => {
                (StatusCode::UNAUTHORIZED, "challenge_agent_mismatch")
            }
            CoreError::TimestampOutOfWindow { .. } => {
                (StatusCode::UNAUTHORIZED, "timestamp_out_of_window")
            }
            CoreError::CooldownActive { .. } => (StatusCode::TOO_MANY_REQUESTS, "cooldown_active"),
            CoreError::SequenceConflict { .. } => (StatusCode::CONFLICT, "sequence_conflict"),
            CoreError::InvalidStatusTransition(_) => {
                (StatusCode::CONFLICT, "invalid_status_transition")
            }
            CoreError::StorageUnreachable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_unreachable")
            }
            CoreError::Anchor(_) => (StatusCode::BAD_GATEWAY, "anchor"),
            CoreError::InvalidMnemonic(_) => (StatusCode::BAD_REQUEST, "invalid_mnemonic"),
            CoreError::Decryption(_) => (StatusCode::BAD_REQUEST, "decryption"),
            CoreError::Encryption(_) => (StatusCode::BAD_REQUEST, "encryption"),
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            CoreError::Encoding(_) => (StatusCode::BAD_REQUEST, "encoding"),
        };
        Self::new(status, code, core.to_string())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

/// Store calls are synchronous `SQLite` and HTTP work; keep them off the async workers.
async fn blocking<T, F>(task: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result.map_err(|err| ServiceError::from_anyhow(&err)),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("request task failed: {err}"),
        )),
    }
}

fn parse_agent_id(value: &str) -> Result<AgentId, ServiceError> {
    AgentId::parse(value).map_err(|err| ServiceError::from_anyhow(&err.into()))
}

/// The agent behind a valid `Authorization: Bearer` session token.
#[derive(Debug, Clone, Copy)]
struct Authenticated(AgentId);

#[async_trait]
impl FromRequestParts<ServiceState> for Authenticated {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ServiceError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token")
            })?;
        let api = state.api.clone();
        let agent_id = blocking(move || api.authenticate(&token, OffsetDateTime::now_utc())).await?;
        Ok(Self(agent_id))
    }
}

fn app(state: ServiceState, max_backup_bytes: usize) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/agents/register", post(agent_register))
        .route("/v1/agents/:agent_id", get(agent_show))
        .route("/v1/auth/challenge", post(auth_challenge))
        .route("/v1/auth/verify", post(auth_verify))
        .route("/v1/heartbeat", post(heartbeat))
        .route(
            "/v1/backups",
            get(backup_list)
                .post(backup_upload)
                .layer(DefaultBodyLimit::max(max_backup_bytes)),
        )
        .route("/v1/backups/:backup_id/blob", get(backup_blob))
        .route("/v1/attestations", post(attest))
        .route("/v1/trust/:agent_id", get(trust_show))
        .route("/v1/trust/:agent_id/recompute", post(trust_recompute))
        .route("/v1/models", post(model_declare))
        .route("/v1/resurrections", post(resurrection_report))
        .route("/v1/relay/jobs/:job_id", get(relay_job_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::resolve(Args::parse())?;
    let anchor = config.anchor()?;
    let api = RevenantApi::new(config.db.clone(), config.blob_store()?, config.api.clone());
    let migrated = {
        let api = api.clone();
        tokio::task::spawn_blocking(move || api.migrate()).await??
    };
    info!(schema_version = migrated.current_version, db = %config.db.display(), "database ready");

    let state = ServiceState { api: api.clone(), relay_notify: Arc::new(Notify::new()) };
    let _relay =
        jobs::spawn_relay_worker(api.clone(), anchor, state.relay_notify.clone(), config.jobs);
    let _maintenance = jobs::spawn_maintenance(api, config.jobs);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, "revenant service listening");
    axum::serve(listener, app(state, config.max_backup_bytes)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    let status = blocking(move || state.api.schema_status()).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(State(state): State<ServiceState>) -> ServiceResult<MigrateResult> {
    let result = blocking(move || state.api.migrate()).await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(State(state): State<ServiceState>) -> ServiceResult<IntegrityReport> {
    let report = blocking(move || state.api.integrity_check()).await?;
    Ok(Json(envelope(report)))
}

async fn agent_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterRequest>,
) -> ServiceResult<RegisterResult> {
    let api = state.api.clone();
    let result = blocking(move || api.register_agent(request, OffsetDateTime::now_utc())).await?;
    state.relay_notify.notify_one();
    Ok(Json(envelope(result)))
}

async fn agent_show(
    State(state): State<ServiceState>,
    Path(agent_id): Path<String>,
) -> ServiceResult<Agent> {
    let agent_id = parse_agent_id(&agent_id)?;
    let agent = blocking(move || state.api.get_agent(agent_id)).await?;
    Ok(Json(envelope(agent)))
}

async fn auth_challenge(
    State(state): State<ServiceState>,
    Json(request): Json<ChallengeRequest>,
) -> ServiceResult<AuthChallenge> {
    let challenge = blocking(move || {
        state.api.issue_challenge(request.agent_id, OffsetDateTime::now_utc())
    })
    .await?;
    Ok(Json(envelope(challenge)))
}

async fn auth_verify(
    State(state): State<ServiceState>,
    Json(response): Json<ChallengeResponse>,
) -> ServiceResult<SessionToken> {
    let session =
        blocking(move || state.api.verify_challenge(&response, OffsetDateTime::now_utc())).await?;
    Ok(Json(envelope(session)))
}

async fn heartbeat(
    State(state): State<ServiceState>,
    Json(proof): Json<HeartbeatProof>,
) -> ServiceResult<Agent> {
    let agent = blocking(move || state.api.heartbeat(&proof, OffsetDateTime::now_utc())).await?;
    Ok(Json(envelope(agent)))
}

async fn backup_upload(
    State(state): State<ServiceState>,
    Authenticated(agent_id): Authenticated,
    body: Bytes,
) -> ServiceResult<BackupRecord> {
    let record = blocking(move || {
        state.api.upload_backup(agent_id, &body, OffsetDateTime::now_utc())
    })
    .await?;
    Ok(Json(envelope(record)))
}

async fn backup_list(
    State(state): State<ServiceState>,
    Authenticated(agent_id): Authenticated,
) -> ServiceResult<Vec<BackupRecord>> {
    let records = blocking(move || state.api.list_backups(agent_id)).await?;
    Ok(Json(envelope(records)))
}

async fn backup_blob(
    State(state): State<ServiceState>,
    Authenticated(agent_id): Authenticated,
    Path(backup_id): Path<String>,
) -> Result<Response, ServiceError> {
    let bytes = blocking(move || state.api.get_backup_blob(agent_id, &backup_id)).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

async fn attest(
    State(state): State<ServiceState>,
    Authenticated(agent_id): Authenticated,
    Json(signed): Json<SignedAttestation>,
) -> ServiceResult<AttestResult> {
    let api = state.api.clone();
    let result = blocking(move || api.attest(agent_id, signed, OffsetDateTime::now_utc())).await?;
    state.relay_notify.notify_one();
    Ok(Json(envelope(result)))
}

async fn trust_show(
    State(state): State<ServiceState>,
    Path(agent_id): Path<String>,
) -> ServiceResult<TrustScore> {
    let agent_id = parse_agent_id(&agent_id)?;
    let score = blocking(move || state.api.trust_score(agent_id, OffsetDateTime::now_utc())).await?;
    Ok(Json(envelope(score)))
}

async fn trust_recompute(
    State(state): State<ServiceState>,
    Path(agent_id): Path<String>,
    Json(request): Json<RecomputeRequest>,
) -> ServiceResult<TrustScore> {
    let agent_id = parse_agent_id(&agent_id)?;
    let score = blocking(move || {
        state.api.recompute_trust(agent_id, request.include_attestations, OffsetDateTime::now_utc())
    })
    .await?;
    Ok(Json(envelope(score)))
}

async fn model_declare(
    State(state): State<ServiceState>,
    Authenticated(agent_id): Authenticated,
    Json(request): Json<ModelRequest>,
) -> ServiceResult<ModelDeclaration> {
    let declaration = blocking(move || {
        state.api.declare_model(agent_id, &request.model, OffsetDateTime::now_utc())
    })
    .await?;
    Ok(Json(envelope(declaration)))
}

async fn resurrection_report(
    State(state): State<ServiceState>,
    Authenticated(agent_id): Authenticated,
    Json(request): Json<ResurrectionRequest>,
) -> ServiceResult<ResurrectionReceipt> {
    let status = blocking(move || {
        state.api.record_resurrection(agent_id, request.succeeded, OffsetDateTime::now_utc())
    })
    .await?;
    Ok(Json(envelope(ResurrectionReceipt { agent_id, status })))
}

async fn relay_job_show(
    State(state): State<ServiceState>,
    Path(job_id): Path<String>,
) -> ServiceResult<RelayJob> {
    let job = blocking(move || state.api.relay_job(&job_id)).await?;
    Ok(Json(envelope(job)))
}
