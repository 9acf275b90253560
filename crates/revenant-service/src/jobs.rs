//! Background work: anchor relay, fallen sweep and batch trust recomputation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use revenant_api::{RelaySummary, RevenantApi};
use revenant_core::Anchor;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::JobConfig;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TrustBatchSummary {
    pub updated: usize,
    pub failed: usize,
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| anyhow!("blocking task failed: {err}"))?
}

/// Drain one batch of queued anchor submissions.
///
/// # Errors
/// Returns an error when relay bookkeeping fails.
pub async fn relay_once(
    api: RevenantApi,
    anchor: Arc<dyn Anchor>,
    batch: usize,
) -> Result<RelaySummary> {
    blocking(move || api.relay_pending(anchor.as_ref(), batch)).await
}

/// Mark silent agents fallen and drop expired challenges and sessions.
///
/// # Errors
/// Returns an error when either store update fails.
pub async fn sweep_once(api: RevenantApi, now: OffsetDateTime) -> Result<(usize, usize)> {
    blocking(move || Ok((api.sweep_fallen(now)?.len(), api.purge_expired(now)?))).await
}

/// Propagate the attestation graph once, then rescore agents in parallel with at most
/// `concurrency` store writers in flight.
///
/// # Errors
/// Returns an error when the attestation graph cannot be read; per-agent failures are counted.
pub async fn recompute_trust_batch(
    api: RevenantApi,
    now: OffsetDateTime,
    concurrency: usize,
) -> Result<TrustBatchSummary> {
    let graph_api = api.clone();
    let inputs = blocking(move || graph_api.attestation_inputs()).await?;
    let limit = concurrency.max(1);
    let mut summary = TrustBatchSummary::default();
    let mut in_flight = JoinSet::new();

    for (agent_id, input) in inputs {
        while in_flight.len() >= limit {
            record_outcome(in_flight.join_next().await, &mut summary);
        }
        let api = api.clone();
        in_flight.spawn_blocking(move || (agent_id, api.apply_trust_input(agent_id, input, now)));
    }
    while !in_flight.is_empty() {
        record_outcome(in_flight.join_next().await, &mut summary);
    }
    info!(updated = summary.updated, failed = summary.failed, "batch trust recomputation finished");
    Ok(summary)
}

type TrustOutcome = (revenant_core::AgentId, Result<revenant_core::TrustScore>);

fn record_outcome(
    joined: Option<Result<TrustOutcome, tokio::task::JoinError>>,
    summary: &mut TrustBatchSummary,
) {
    match joined {
        Some(Ok((_, Ok(_)))) => summary.updated += 1,
        Some(Ok((agent_id, Err(err)))) => {
            summary.failed += 1;
            warn!(agent_id = %agent_id, error = %format!("{err:#}"), "trust recomputation failed");
        }
        Some(Err(err)) => {
            summary.failed += 1;
            error!(error = %err, "trust recomputation task panicked");
        }
        None => {}
    }
}

/// Relay worker: runs on every tick and whenever new submissions are queued.
#[must_use]
pub fn spawn_relay_worker(
    api: RevenantApi,
    anchor: Arc<dyn Anchor>,
    notify: Arc<Notify>,
    jobs: JobConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(jobs.relay_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = notify.notified() => {}
            }
            match relay_once(api.clone(), anchor.clone(), jobs.relay_batch).await {
                Ok(summary) if summary == RelaySummary::default() => debug!("relay queue empty"),
                Ok(summary) => info!(
                    submitted = summary.submitted,
                    retrying = summary.retrying,
                    failed = summary.failed,
                    "relay batch processed"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "relay batch failed"),
            }
        }
    })
}

#[must_use]
pub fn spawn_maintenance(api: RevenantApi, jobs: JobConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(Duration::from_secs(jobs.sweep_interval_secs.max(1)));
        let mut trust = tokio::time::interval(Duration::from_secs(jobs.trust_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    match sweep_once(api.clone(), OffsetDateTime::now_utc()).await {
                        Ok((fallen, purged)) => {
                            debug!(fallen, purged, "maintenance sweep finished");
                        }
                        Err(err) => error!(error = %format!("{err:#}"), "maintenance sweep failed"),
                    }
                }
                _ = trust.tick() => {
                    let now = OffsetDateTime::now_utc();
                    let batch = recompute_trust_batch(api.clone(), now, jobs.trust_concurrency);
                    if let Err(err) = batch.await {
                        error!(error = %format!("{err:#}"), "batch trust recomputation failed");
                    }
                }
            }
        }
    })
}
