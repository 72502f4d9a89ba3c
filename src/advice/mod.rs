//! Per-subscriber advice rendered from a shared analysis.
//!
//! Advice is a pure function of (analysis, policy): regenerating from the
//! same inputs produces byte-identical fields except `created_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::{Analysis, Recommendation, RiskLevel};
use crate::subscribers::Subscriber;

/// Delivered voting decision vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Yes,
    No,
    Abstain,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "YES"),
            Self::No => write!(f, "NO"),
            Self::Abstain => write!(f, "ABSTAIN"),
        }
    }
}

/// Fixed mapping from the analyzer's vocabulary to the delivered one.
impl From<Recommendation> for Decision {
    fn from(recommendation: Recommendation) -> Self {
        match recommendation {
            Recommendation::Approve => Decision::Yes,
            Recommendation::Reject => Decision::No,
            Recommendation::Abstain => Decision::Abstain,
        }
    }
}

/// The per-subscriber materialization of one analysis. Transient: produced
/// by the fan-out, consumed by the delivery gate, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advice {
    pub chain_id: String,
    pub proposal_id: u64,
    pub subscriber_id: String,
    pub decision: Decision,
    pub rationale: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// One-line statement relating the subscriber's risk tolerance to the
/// analysis risk assessment, prefixed to the rationale.
fn alignment_statement(tolerance: RiskLevel, assessed: RiskLevel) -> String {
    let relation = if assessed <= tolerance {
        "within"
    } else {
        "above"
    };
    format!(
        "Assessed risk {assessed} is {relation} your declared {tolerance} risk tolerance."
    )
}

/// Compose the advice for one subscriber from the shared analysis.
///
/// A degraded analysis (all providers failed) leads with its own
/// reasoning so the recipient sees immediately that no provider was
/// available; everything else leads with the alignment statement.
pub fn render_for(
    chain_id: &str,
    proposal_id: u64,
    analysis: &Analysis,
    subscriber: &Subscriber,
    now: DateTime<Utc>,
) -> Advice {
    let preamble = alignment_statement(
        subscriber.policy.risk_tolerance,
        analysis.risk_assessment,
    );
    let rationale = if analysis.reasoning == crate::analyzer::FALLBACK_REASONING {
        format!("{}. {preamble}", analysis.reasoning)
    } else {
        format!("{preamble} {}", analysis.reasoning)
    };
    Advice {
        chain_id: chain_id.to_string(),
        proposal_id,
        subscriber_id: subscriber.subscriber_id.clone(),
        decision: analysis.recommendation.into(),
        rationale,
        confidence: analysis.confidence,
        created_at: now,
    }
}
