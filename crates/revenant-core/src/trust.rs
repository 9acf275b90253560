//! Six-signal trust scoring with iterative attestation propagation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::model::{
    Agent, AgentId, Attestation, BackupRecord, ModelDeclaration, ResurrectionEvent,
};

pub const PROPAGATION_PASSES: usize = 3;
pub const PROPAGATION_FACTOR: f64 = 0.1;
pub const MUTUAL_EDGE_WEIGHT: f64 = 0.5;
pub const BASE_SCORE: f64 = 1.0;
pub const ATTESTATION_RAW_SCALE: f64 = 10.0;
pub const SCORE_SCALE: f64 = 150.0;

const SECONDS_PER_DAY: f64 = 86_400.0;
const DAYS_PER_MONTH: f64 = 30.0;
const MAX_BACKUP_GAP: Duration = Duration::days(7);
const BACKUP_GAP_PENALTY: f64 = 0.1;
const NEUTRAL_MODEL_STABILITY: f64 = 0.5;
const RESURRECTION_WINDOW: Duration = Duration::days(30);
const RESURRECTIONS_TOLERATED: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalWeights {
    pub age: f64,
    pub backup_consistency: f64,
    pub attestations: f64,
    pub model_stability: f64,
    pub genesis_completeness: f64,
    pub recovery_resilience: f64,
}

pub const WEIGHTS: SignalWeights = SignalWeights {
    age: 0.20,
    backup_consistency: 0.25,
    attestations: 0.30,
    model_stability: 0.10,
    genesis_completeness: 0.05,
    recovery_resilience: 0.10,
};

impl SignalWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.age
            + self.backup_consistency
            + self.attestations
            + self.model_stability
            + self.genesis_completeness
            + self.recovery_resilience
    }
}

/// Normalized signals, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TrustBreakdown {
    pub age: f64,
    pub backup_consistency: f64,
    pub attestations: f64,
    pub model_stability: f64,
    pub genesis_completeness: f64,
    pub recovery_resilience: f64,
}

impl TrustBreakdown {
    #[must_use]
    pub fn weighted_sum(&self, weights: &SignalWeights) -> f64 {
        self.age * weights.age
            + self.backup_consistency * weights.backup_consistency
            + self.attestations * weights.attestations
            + self.model_stability * weights.model_stability
            + self.genesis_completeness * weights.genesis_completeness
            + self.recovery_resilience * weights.recovery_resilience
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        self.weighted_sum(&WEIGHTS) * SCORE_SCALE
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    Unverified,
    Verified,
    Established,
    Pillar,
}

impl TrustLevel {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score < 20.0 {
            Self::Unverified
        } else if score < 50.0 {
            Self::Verified
        } else if score < 100.0 {
            Self::Established
        } else {
            Self::Pillar
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNVERIFIED" => Some(Self::Unverified),
            "VERIFIED" => Some(Self::Verified),
            "ESTABLISHED" => Some(Self::Established),
            "PILLAR" => Some(Self::Pillar),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "UNVERIFIED",
            Self::Verified => "VERIFIED",
            Self::Established => "ESTABLISHED",
            Self::Pillar => "PILLAR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustScore {
    pub agent_id: AgentId,
    pub score: f64,
    pub level: TrustLevel,
    pub unique_attesters: usize,
    pub breakdown: TrustBreakdown,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// Deduplicated directed attestation edges. Self edges never enter the graph.
#[derive(Debug, Clone, Default)]
pub struct AttestationGraph {
    attesters: BTreeMap<AgentId, BTreeSet<AgentId>>,
}

impl AttestationGraph {
    #[must_use]
    pub fn from_attestations(attestations: &[Attestation]) -> Self {
        let mut graph = Self::default();
        for attestation in attestations {
            graph.add_edge(attestation.from, attestation.about);
        }
        graph
    }

    pub fn add_edge(&mut self, from: AgentId, about: AgentId) {
        if from != about {
            self.attesters.entry(about).or_default().insert(from);
        }
    }

    #[must_use]
    pub fn unique_attesters(&self, about: AgentId) -> usize {
        self.attesters.get(&about).map_or(0, BTreeSet::len)
    }

    fn is_mutual(&self, from: AgentId, about: AgentId) -> bool {
        self.attesters.get(&from).is_some_and(|set| set.contains(&about))
    }

    fn nodes(&self) -> BTreeSet<AgentId> {
        let mut nodes = BTreeSet::new();
        for (about, from) in &self.attesters {
            nodes.insert(*about);
            nodes.extend(from.iter().copied());
        }
        nodes
    }

    /// Raw propagated score (final minus base) for every agent in the graph.
    ///
    /// Each pass reads only the previous pass's scores, so the result does not depend on
    /// iteration order.
    #[must_use]
    pub fn propagate(&self) -> BTreeMap<AgentId, f64> {
        let mut scores =
            self.nodes().into_iter().map(|id| (id, BASE_SCORE)).collect::<BTreeMap<_, _>>();
        for _ in 0..PROPAGATION_PASSES {
            let mut next = scores.clone();
            for (about, attesters) in &self.attesters {
                let increment = attesters
                    .iter()
                    .map(|from| {
                        let weight =
                            if self.is_mutual(*from, *about) { MUTUAL_EDGE_WEIGHT } else { 1.0 };
                        scores.get(from).copied().unwrap_or(BASE_SCORE)
                            * PROPAGATION_FACTOR
                            * weight
                    })
                    .sum::<f64>();
                if let Some(score) = next.get_mut(about) {
                    *score = scores.get(about).copied().unwrap_or(BASE_SCORE) + increment;
                }
            }
            scores = next;
        }
        scores.into_iter().map(|(id, score)| (id, score - BASE_SCORE)).collect()
    }

    #[must_use]
    pub fn raw_score(&self, about: AgentId) -> f64 {
        self.propagate().get(&about).copied().unwrap_or(0.0)
    }
}

/// Attestation signal source for one computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttestationInput {
    Fresh { raw: f64, unique_attesters: usize },
    /// No graph snapshot supplied; reuse what was last stored.
    Prior { normalized: f64, unique_attesters: usize },
}

impl AttestationInput {
    #[must_use]
    pub fn from_prior(prior: Option<&TrustScore>) -> Self {
        prior.map_or(Self::Prior { normalized: 0.0, unique_attesters: 0 }, |score| Self::Prior {
            normalized: score.breakdown.attestations,
            unique_attesters: score.unique_attesters,
        })
    }

    #[must_use]
    pub fn raw(&self) -> f64 {
        match self {
            Self::Fresh { raw, .. } => *raw,
            Self::Prior { normalized, .. } => normalized * ATTESTATION_RAW_SCALE,
        }
    }

    #[must_use]
    pub fn unique_attesters(&self) -> usize {
        match self {
            Self::Fresh { unique_attesters, .. } | Self::Prior { unique_attesters, .. } => {
                *unique_attesters
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustInputs<'a> {
    pub agent: &'a Agent,
    pub backups: &'a [BackupRecord],
    pub model_declarations: &'a [ModelDeclaration],
    pub resurrections: &'a [ResurrectionEvent],
    pub attestations: AttestationInput,
    pub now: OffsetDateTime,
}

#[must_use]
pub fn compute_trust_score(inputs: &TrustInputs<'_>) -> TrustScore {
    let breakdown = TrustBreakdown {
        age: age_signal(inputs.agent.registered_at, inputs.now),
        backup_consistency: backup_consistency_signal(
            inputs.agent.registered_at,
            inputs.backups,
            inputs.now,
        ),
        attestations: clamp_unit(inputs.attestations.raw() / ATTESTATION_RAW_SCALE),
        model_stability: model_stability_signal(
            inputs.agent.registered_at,
            inputs.model_declarations,
            inputs.now,
        ),
        genesis_completeness: genesis_signal(
            inputs.agent.genesis.is_some(),
            !inputs.backups.is_empty(),
            inputs.attestations.unique_attesters() > 0,
        ),
        recovery_resilience: resilience_signal(inputs.resurrections, inputs.now),
    };
    let score = breakdown.score();
    TrustScore {
        agent_id: inputs.agent.agent_id,
        score,
        level: TrustLevel::from_score(score),
        unique_attesters: inputs.attestations.unique_attesters(),
        breakdown,
        computed_at: inputs.now,
    }
}

fn days_between(start: OffsetDateTime, end: OffsetDateTime) -> f64 {
    (end - start).as_seconds_f64() / SECONDS_PER_DAY
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn count_f64(count: usize) -> f64 {
    f64::from(u32::try_from(count).unwrap_or(u32::MAX))
}

fn age_signal(registered_at: OffsetDateTime, now: OffsetDateTime) -> f64 {
    let months = days_between(registered_at, now) / DAYS_PER_MONTH;
    clamp_unit(months / 12.0)
}

fn backup_consistency_signal(
    registered_at: OffsetDateTime,
    backups: &[BackupRecord],
    now: OffsetDateTime,
) -> f64 {
    if backups.is_empty() {
        return 0.0;
    }
    let mut ordered = backups.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|backup| (backup.timestamp_ms, backup.backup_seq));

    let distinct = 1 + ordered
        .windows(2)
        .filter(|pair| pair[0].manifest_hash != pair[1].manifest_hash)
        .count();
    let mut gaps = ordered
        .windows(2)
        .filter(|pair| {
            Duration::milliseconds(pair[1].timestamp_ms - pair[0].timestamp_ms) > MAX_BACKUP_GAP
        })
        .count();
    // A late first backup and silence since the newest one both count as gaps.
    let backed_up_at = |backup: &BackupRecord| {
        OffsetDateTime::UNIX_EPOCH + Duration::milliseconds(backup.timestamp_ms)
    };
    if let (Some(&oldest), Some(&newest)) = (ordered.first(), ordered.last()) {
        if backed_up_at(oldest) - registered_at > MAX_BACKUP_GAP {
            gaps += 1;
        }
        if now - backed_up_at(newest) > MAX_BACKUP_GAP {
            gaps += 1;
        }
    }

    let expected = days_between(registered_at, now).max(1.0);
    let ratio = (count_f64(distinct) / expected).min(1.0);
    clamp_unit(ratio - BACKUP_GAP_PENALTY * count_f64(gaps))
}

fn model_stability_signal(
    registered_at: OffsetDateTime,
    declarations: &[ModelDeclaration],
    now: OffsetDateTime,
) -> f64 {
    let mut ordered = declarations.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|declaration| declaration.declared_at);
    let Some(current) = ordered.last() else {
        return NEUTRAL_MODEL_STABILITY;
    };

    let total = (now - registered_at).as_seconds_f64();
    if total <= 0.0 {
        return 1.0;
    }
    // Redeclaring the same model does not restart the clock.
    let since = ordered
        .iter()
        .rev()
        .take_while(|declaration| declaration.model == current.model)
        .last()
        .map_or(current.declared_at, |declaration| declaration.declared_at);
    clamp_unit((now - since).as_seconds_f64() / total)
}

fn genesis_signal(has_genesis: bool, has_backup: bool, has_attestation: bool) -> f64 {
    let mut value = 0.0;
    if has_genesis {
        value += 0.4;
    }
    if has_backup {
        value += 0.3;
    }
    if has_attestation {
        value += 0.3;
    }
    value
}

fn resilience_signal(events: &[ResurrectionEvent], now: OffsetDateTime) -> f64 {
    let successes = events.iter().filter(|event| event.succeeded).count();
    let recent = events
        .iter()
        .filter(|event| event.succeeded && now - event.restored_at <= RESURRECTION_WINDOW)
        .count();
    let bonus = (0.25 * count_f64(successes)).min(0.5);
    let penalty = 0.2 * count_f64(recent.saturating_sub(RESURRECTIONS_TOLERATED));
    clamp_unit(0.5 + bonus - penalty)
}
