//! REST client for Cosmos SDK governance endpoints.
//!
//! Speaks `/cosmos/gov/v1beta1` against each chain's configured endpoint
//! list. Endpoints are cycled round-robin across attempts so a single dead
//! node never monopolizes retries. Backoff starts at 500 ms, doubles to a
//! cap of 8 s, and is jittered ±20%; a 429 response waits at least 30 s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::{ChainDescriptor, Proposal, ProposalStatus, ProposalSummary};

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(30);
const JITTER_FRAC: f64 = 0.2;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 2000;

#[derive(Error, Debug)]
pub enum ClientError {
    /// 4xx other than 429. Not retried.
    #[error("permanent error from {url}: HTTP {status}")]
    Permanent { url: String, status: u16 },
    /// All attempts exhausted on transient failures.
    #[error("chain {chain_id} unreachable after {attempts} attempts: {last_error}")]
    Exhausted {
        chain_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("chain {0} is not configured")]
    UnknownChain(String),
    #[error("proposal {proposal_id} not found on {chain_id}")]
    NotFound { chain_id: String, proposal_id: u64 },
    #[error("malformed response from {url}: {detail}")]
    Malformed { url: String, detail: String },
}

/// Uniform read access to one chain's governance state.
#[async_trait]
pub trait ChainQuerier: Send + Sync {
    /// Proposals whose status is not terminal, as lightweight summaries.
    async fn list_active(&self, chain_id: &str) -> Result<Vec<ProposalSummary>, ClientError>;

    /// The full proposal, including title, description, and timestamps.
    async fn fetch(&self, chain_id: &str, proposal_id: u64) -> Result<Proposal, ClientError>;
}

/// Stateless (beyond endpoint rotation) client, safe for concurrent use.
pub struct ChainClient {
    http: reqwest::Client,
    chains: HashMap<String, ChainDescriptor>,
    /// Per-chain round-robin position across the endpoint list.
    rotation: DashMap<String, AtomicUsize>,
}

impl ChainClient {
    pub fn new(chains: Vec<ChainDescriptor>, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("govwatch/0.3")
            .build()
            .unwrap_or_default();
        let chains = chains
            .into_iter()
            .map(|c| (c.chain_id.clone(), c))
            .collect();
        Self {
            http,
            chains,
            rotation: DashMap::new(),
        }
    }

    fn descriptor(&self, chain_id: &str) -> Result<&ChainDescriptor, ClientError> {
        self.chains
            .get(chain_id)
            .ok_or_else(|| ClientError::UnknownChain(chain_id.to_string()))
    }

    fn next_endpoint<'a>(&self, chain: &'a ChainDescriptor) -> &'a str {
        let counter = self
            .rotation
            .entry(chain.chain_id.clone())
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::Relaxed) % chain.endpoints.len();
        &chain.endpoints[idx]
    }

    /// GET `path` against the chain, retrying transient failures with
    /// jittered exponential backoff and rotating endpoints per attempt.
    async fn get_json(
        &self,
        chain: &ChainDescriptor,
        path: &str,
    ) -> Result<serde_json::Value, ClientError> {
        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            let endpoint = self.next_endpoint(chain);
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

            let outcome = match self.http.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<serde_json::Value>().await {
                            Ok(value) => return Ok(value),
                            Err(e) => {
                                return Err(ClientError::Malformed {
                                    url,
                                    detail: e.to_string(),
                                })
                            }
                        }
                    } else if status.as_u16() == 429 {
                        Attempt::RateLimited
                    } else if status.is_client_error() {
                        return Err(ClientError::Permanent {
                            url,
                            status: status.as_u16(),
                        });
                    } else {
                        Attempt::Transient(format!("HTTP {status}"))
                    }
                }
                Err(e) => Attempt::Transient(e.to_string()),
            };

            let rate_limited = matches!(outcome, Attempt::RateLimited);
            last_error = match outcome {
                Attempt::RateLimited => "HTTP 429".to_string(),
                Attempt::Transient(detail) => detail,
            };
            warn!(
                chain = %chain.chain_id,
                url = %url,
                attempt = attempt + 1,
                error = %last_error,
                "chain request failed, retrying"
            );

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(retry_delay(attempt, rate_limited)).await;
            }
        }

        Err(ClientError::Exhausted {
            chain_id: chain.chain_id.clone(),
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }
}

enum Attempt {
    Transient(String),
    RateLimited,
}

/// Delay before the attempt after `attempt` (0-based), jittered ±20%.
/// Rate-limited attempts wait at least 30 s.
fn retry_delay(attempt: u32, rate_limited: bool) -> Duration {
    let base = backoff_base(attempt);
    let floor = if rate_limited {
        base.max(RATE_LIMIT_FLOOR)
    } else {
        base
    };
    apply_jitter(floor, JITTER_FRAC)
}

fn backoff_base(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(8));
    exp.min(BACKOFF_CAP)
}

fn apply_jitter(d: Duration, frac: f64) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-frac..=frac);
    Duration::from_secs_f64(d.as_secs_f64() * factor)
}

#[async_trait]
impl ChainQuerier for ChainClient {
    async fn list_active(&self, chain_id: &str) -> Result<Vec<ProposalSummary>, ClientError> {
        let chain = self.descriptor(chain_id)?;
        let value = self
            .get_json(
                chain,
                "/cosmos/gov/v1beta1/proposals?pagination.limit=500&pagination.reverse=true",
            )
            .await?;

        let page: ProposalsPage =
            serde_json::from_value(value).map_err(|e| ClientError::Malformed {
                url: chain_id.to_string(),
                detail: e.to_string(),
            })?;

        let mut summaries = Vec::new();
        for raw in &page.proposals {
            match raw.summary() {
                Some(s) if !s.status.is_terminal() => summaries.push(s),
                Some(_) => {}
                None => {
                    debug!(chain = chain_id, status = %raw.status, "skipping proposal with unknown status");
                }
            }
        }
        debug!(chain = chain_id, active = summaries.len(), "listed active proposals");
        Ok(summaries)
    }

    async fn fetch(&self, chain_id: &str, proposal_id: u64) -> Result<Proposal, ClientError> {
        let chain = self.descriptor(chain_id)?;
        let path = format!("/cosmos/gov/v1beta1/proposals/{proposal_id}");
        let value = match self.get_json(chain, &path).await {
            Ok(v) => v,
            Err(ClientError::Permanent { status: 404, .. }) => {
                return Err(ClientError::NotFound {
                    chain_id: chain_id.to_string(),
                    proposal_id,
                })
            }
            Err(e) => return Err(e),
        };

        let wrapper: ProposalWrapper =
            serde_json::from_value(value).map_err(|e| ClientError::Malformed {
                url: path.clone(),
                detail: e.to_string(),
            })?;
        wrapper
            .proposal
            .into_proposal(chain_id)
            .ok_or(ClientError::Malformed {
                url: path,
                detail: "unparseable proposal body".to_string(),
            })
    }
}

// ─── Wire shapes (gov v1beta1 JSON) ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProposalsPage {
    #[serde(default)]
    proposals: Vec<RawProposal>,
}

#[derive(Debug, Deserialize)]
struct ProposalWrapper {
    proposal: RawProposal,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    proposal_id: String,
    #[serde(default)]
    content: RawContent,
    #[serde(default)]
    status: String,
    #[serde(default)]
    submit_time: Option<String>,
    #[serde(default)]
    voting_start_time: Option<String>,
    #[serde(default)]
    voting_end_time: Option<String>,
    #[serde(default)]
    proposer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "@type", default)]
    type_tag: String,
}

impl RawProposal {
    fn summary(&self) -> Option<ProposalSummary> {
        Some(ProposalSummary {
            proposal_id: self.proposal_id.parse().ok()?,
            status: ProposalStatus::from_sdk(&self.status)?,
        })
    }

    fn into_proposal(self, chain_id: &str) -> Option<Proposal> {
        let proposal_id = self.proposal_id.parse().ok()?;
        let status = ProposalStatus::from_sdk(&self.status)?;
        let title = if self.content.title.is_empty() {
            format!("Proposal #{proposal_id}")
        } else {
            truncate_chars(&self.content.title, MAX_TITLE_LEN)
        };
        Some(Proposal {
            chain_id: chain_id.to_string(),
            proposal_id,
            title,
            description: truncate_chars(&self.content.description, MAX_DESCRIPTION_LEN),
            status,
            voting_start: parse_timestamp(self.voting_start_time.as_deref()),
            voting_end: parse_timestamp(self.voting_end_time.as_deref()),
            submit_time: parse_timestamp(self.submit_time.as_deref()),
            proposer: self.proposer.unwrap_or_default(),
            type_tag: self.content.type_tag,
        })
    }
}

/// Chains report unset timestamps as the zero time; map those to None.
fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(parsed)
}

fn truncate_chars(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        trimmed.chars().take(max).collect()
    }
}
