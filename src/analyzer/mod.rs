//! Hybrid LLM analysis of governance proposals.
//!
//! Providers are tried in configured priority order. A transient failure
//! (timeout, 5xx, rate limit) moves on to the next provider; a provider
//! whose output still fails the schema after one repair round is skipped
//! for this call. When every provider fails the analyzer degrades to a
//! deterministic abstain verdict rather than erroring, so downstream
//! advice is never missing for a proposal that reached the pipeline.

pub mod prompt;
pub mod provider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{Fingerprint, Proposal};
use crate::subscribers::Policy;
use self::provider::{AnalysisProvider, ProviderError};

/// Reasoning text used when no provider produced a usable result.
pub const FALLBACK_REASONING: &str = "no provider available";

/// Provider-facing recommendation vocabulary. Delivered advice uses
/// YES/NO/ABSTAIN; the mapping lives in the advice module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Approve,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Medium
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// One provider's structured opinion, before the cache stamps timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub provider: String,
    pub recommendation: Recommendation,
    /// In [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub risk_assessment: RiskLevel,
    /// Optional structured sub-fields the provider chose to emit
    /// (key considerations, stakeholder impact, ...). Preserved verbatim,
    /// ignored by the advice renderer.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Verdict {
    /// The deterministic degraded result used when all providers fail.
    pub fn fallback() -> Self {
        Self {
            provider: "fallback".to_string(),
            recommendation: Recommendation::Abstain,
            confidence: 0.0,
            reasoning: FALLBACK_REASONING.to_string(),
            risk_assessment: RiskLevel::High,
            extra: BTreeMap::new(),
        }
    }
}

/// AI opinion attached to a proposal fingerprint. Exactly one analysis
/// exists per fingerprint at any time; the cache owns that invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub fingerprint: Fingerprint,
    pub provider: String,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub reasoning: String,
    pub risk_assessment: RiskLevel,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Analysis {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Raw schema providers must emit. Strictly validated; one repair round.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    recommendation: String,
    confidence: f64,
    reasoning: String,
    risk_assessment: String,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Ordered-fallback analyzer over a static provider list.
pub struct HybridAnalyzer {
    providers: Vec<Arc<dyn AnalysisProvider>>,
}

impl HybridAnalyzer {
    pub fn new(providers: Vec<Arc<dyn AnalysisProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Analyze one proposal under one policy. Never fails: total provider
    /// failure degrades to [`Verdict::fallback`].
    pub async fn analyze(&self, proposal: &Proposal, chain_name: &str, policy: &Policy) -> Verdict {
        let prompt = prompt::build_prompt(proposal, chain_name, policy);

        for provider in &self.providers {
            match self.try_provider(provider.as_ref(), &prompt).await {
                Ok(verdict) => {
                    info!(
                        chain = %proposal.chain_id,
                        proposal_id = proposal.proposal_id,
                        provider = provider.name(),
                        recommendation = ?verdict.recommendation,
                        confidence = verdict.confidence,
                        "analysis produced"
                    );
                    return verdict;
                }
                Err(e) => {
                    warn!(
                        chain = %proposal.chain_id,
                        proposal_id = proposal.proposal_id,
                        provider = provider.name(),
                        error = %e,
                        "provider failed, trying next"
                    );
                }
            }
        }

        warn!(
            chain = %proposal.chain_id,
            proposal_id = proposal.proposal_id,
            "all providers failed, using deterministic fallback"
        );
        Verdict::fallback()
    }

    /// One provider attempt: complete, parse strictly, and on a schema
    /// violation issue exactly one repair request before giving up on the
    /// provider for this call.
    async fn try_provider(
        &self,
        provider: &dyn AnalysisProvider,
        prompt: &str,
    ) -> Result<Verdict, ProviderError> {
        let first = provider.complete(prompt).await?;
        match parse_verdict(provider.name(), &first) {
            Ok(verdict) => return Ok(verdict),
            Err(detail) => {
                warn!(
                    provider = provider.name(),
                    error = %detail,
                    "schema violation, requesting re-emit"
                );
            }
        }

        let repair = format!(
            "{prompt}\n\nYour previous reply did not match the required JSON schema. \
             Please re-emit your analysis as a single JSON object with exactly the \
             fields: recommendation, confidence, reasoning, risk_assessment."
        );
        let second = provider.complete(&repair).await?;
        parse_verdict(provider.name(), &second)
            .map_err(|detail| ProviderError::Permanent(format!("schema violation after repair: {detail}")))
    }
}

/// Strict parse of a provider reply. Markdown fences are tolerated; any
/// missing field, unknown vocabulary value, or out-of-range confidence is
/// an error.
pub(crate) fn parse_verdict(provider: &str, reply: &str) -> Result<Verdict, String> {
    let body = strip_fences(reply);
    let raw: RawVerdict =
        serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;

    let recommendation = match raw.recommendation.as_str() {
        "APPROVE" => Recommendation::Approve,
        "REJECT" => Recommendation::Reject,
        "ABSTAIN" => Recommendation::Abstain,
        other => return Err(format!("unknown recommendation {other:?}")),
    };
    if !(0.0..=1.0).contains(&raw.confidence) || !raw.confidence.is_finite() {
        return Err(format!("confidence {} out of range", raw.confidence));
    }
    let risk_assessment = match raw.risk_assessment.as_str() {
        "LOW" => RiskLevel::Low,
        "MEDIUM" => RiskLevel::Medium,
        "HIGH" => RiskLevel::High,
        other => return Err(format!("unknown risk assessment {other:?}")),
    };
    if raw.reasoning.trim().is_empty() {
        return Err("empty reasoning".to_string());
    }

    Ok(Verdict {
        provider: provider.to_string(),
        recommendation,
        confidence: raw.confidence,
        reasoning: raw.reasoning.trim().to_string(),
        risk_assessment,
        extra: raw.extra,
    })
}

/// Drop a ```json ... ``` wrapper if the model added one.
fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}
