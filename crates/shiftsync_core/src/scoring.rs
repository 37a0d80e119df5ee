//! Advisory risk scoring for conflict review.
//!
//! Scores only order the review queue. They never change a merged value.

use crate::registry::MergeRuleRegistry;
use serde::Serialize;
use shiftsync_protocol::{ConflictId, ConflictRecord};

const SAFETY_WEIGHT: u32 = 100;
const EXTRA_OP_WEIGHT: u32 = 10;
const SPREAD_WEIGHT: u32 = 20;
const ACTOR_WEIGHT: u32 = 15;
const SPREAD_THRESHOLD_MS: i64 = 5 * 60 * 1000;

/// Something that raised a conflict's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskFactor {
    /// The field is marked safety-critical.
    SafetyCritical,
    /// More than two operations contend.
    ManyOperations,
    /// The contending writes are far apart in wall-clock time.
    WideTimeSpread,
    /// More than one person is involved.
    MultipleActors,
}

/// Rough effort needed to review a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Score up to 20.
    Low,
    /// Score above 20.
    Medium,
    /// Score above 50.
    High,
}

/// Suggested handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    /// Safe to accept the automatic outcome.
    AutoResolveSafe,
    /// A person should look at it.
    ManualReviewRecommended,
    /// A person must look at it.
    ManualReviewRequired,
}

/// Score of one conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictScore {
    /// Scored conflict.
    pub conflict_id: ConflictId,
    /// Additive risk score.
    pub score: u32,
    /// Confidence in the automatic outcome, in `(0, 1]`.
    pub confidence: f64,
    /// Review effort bucket.
    pub complexity: Complexity,
    /// Suggested handling.
    pub recommendation: Recommendation,
    /// What contributed to the score.
    pub risk_factors: Vec<RiskFactor>,
}

/// Scores `record` against the safety markings in `registry`.
#[must_use]
pub fn score_conflict(registry: &MergeRuleRegistry, record: &ConflictRecord) -> ConflictScore {
    let mut score = 0u32;
    let mut confidence = 1.0f64;
    let mut risk_factors = Vec::new();

    let safety_critical = registry.is_safety_critical(record.entity_type, &record.field_path);
    if safety_critical {
        score += SAFETY_WEIGHT;
        confidence *= 0.5;
        risk_factors.push(RiskFactor::SafetyCritical);
    }

    let ops = u32::try_from(record.contending.len()).unwrap_or(u32::MAX);
    if ops > 2 {
        score = score.saturating_add(ops.saturating_mul(EXTRA_OP_WEIGHT));
        confidence *= 0.9;
        risk_factors.push(RiskFactor::ManyOperations);
    }

    if record.time_spread_ms() > SPREAD_THRESHOLD_MS {
        score += SPREAD_WEIGHT;
        confidence *= 0.8;
        risk_factors.push(RiskFactor::WideTimeSpread);
    }

    let actors = u32::try_from(record.participants.len()).unwrap_or(u32::MAX);
    if actors > 1 {
        score = score.saturating_add(actors.saturating_mul(ACTOR_WEIGHT));
        confidence *= 0.85;
        risk_factors.push(RiskFactor::MultipleActors);
    }

    let complexity = if score > 50 {
        Complexity::High
    } else if score > 20 {
        Complexity::Medium
    } else {
        Complexity::Low
    };

    let recommendation = if score > 100 || confidence < 0.5 || safety_critical {
        Recommendation::ManualReviewRequired
    } else if score > 50 || confidence < 0.7 {
        Recommendation::ManualReviewRecommended
    } else {
        Recommendation::AutoResolveSafe
    };

    ConflictScore {
        conflict_id: record.conflict_id,
        score,
        confidence,
        complexity,
        recommendation,
        risk_factors,
    }
}

/// Scores every record, highest risk first.
#[must_use]
pub fn rank_conflicts(registry: &MergeRuleRegistry, records: &[ConflictRecord]) -> Vec<ConflictScore> {
    let mut scores: Vec<_> = records.iter().map(|r| score_conflict(registry, r)).collect();
    scores.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.confidence.total_cmp(&b.confidence))
            .then(a.conflict_id.cmp(&b.conflict_id))
    });
    scores
}
