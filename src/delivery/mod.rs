//! At-most-once dispatch of advice to the notifier.
//!
//! The gate enforces one accepted send per (chain, proposal, subscriber)
//! across the process lifetime and restarts: probe the ledger, take the
//! per-key lock, probe again, send, then persist the mark before the lock
//! is released. Mark persistence retries indefinitely because an
//! accepted-but-unmarked send is the one state that would duplicate on the
//! next pass.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::advice::Advice;
use crate::chain::Proposal;
use crate::metrics::Stats;
use crate::store::{DeliveryLedger, DeliveryMark};
use crate::subscribers::Subscriber;

/// Send attempts per delivery, exponential backoff 1 s → 16 s in between.
const MAX_SEND_ATTEMPTS: u32 = 3;
const SEND_BACKOFF_BASE: Duration = Duration::from_secs(1);
const SEND_BACKOFF_CAP: Duration = Duration::from_secs(16);
/// Per-attempt deadline on the notifier backend.
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Backoff cap while retrying mark persistence.
const MARK_RETRY_CAP: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SendError {
    /// Worth retrying: timeout, connection loss, provider 5xx.
    #[error("transient notifier error: {0}")]
    Transient(String),
    /// Not retried automatically; surfaced as a failure event.
    #[error("permanent notifier error: {0}")]
    Permanent(String),
}

/// Successful acceptance by the notifier backend.
#[derive(Debug, Clone)]
pub struct Accepted {
    /// Provider message identifier, opaque.
    pub message_id: String,
}

/// Outbound message transport. The concrete email/webhook transport lives
/// outside the core; the shipped implementation logs instead of sending.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<Accepted, SendError>;
}

/// Notification subject: `[<ChainName>] Proposal #<id>: <title>`.
pub fn subject(chain_name: &str, proposal: &Proposal) -> String {
    format!(
        "[{}] Proposal #{}: {}",
        chain_name, proposal.proposal_id, proposal.title
    )
}

/// Plain-text notification body.
pub fn body(advice: &Advice, proposal: &Proposal) -> String {
    format!(
        "Governance voting recommendation\n\
         \n\
         Chain: {}\n\
         Proposal #{}: {}\n\
         \n\
         RECOMMENDATION: {}\n\
         Confidence: {:.0}%\n\
         \n\
         ANALYSIS:\n\
         {}\n",
        advice.chain_id,
        proposal.proposal_id,
        proposal.title,
        advice.decision,
        advice.confidence * 100.0,
        advice.rationale,
    )
}

/// What happened to one piece of advice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { message_id: String },
    /// A mark already existed; dropped silently (and counted).
    AlreadySent,
    /// Delivery is administratively paused; the advice was not consumed.
    Paused,
    /// Transient exhaustion or a permanent notifier error. No mark was
    /// persisted, so a future manual pass may retry.
    Failed(String),
}

pub struct DeliveryGate {
    ledger: DeliveryLedger,
    notifier: Arc<dyn Notifier>,
    /// Per-key serialization of the probe/send/mark sequence.
    locks: DashMap<String, Arc<Mutex<()>>>,
    paused: AtomicBool,
    stats: Arc<Stats>,
}

impl DeliveryGate {
    pub fn new(ledger: DeliveryLedger, notifier: Arc<dyn Notifier>, stats: Arc<Stats>) -> Self {
        Self {
            ledger,
            notifier,
            locks: DashMap::new(),
            paused: AtomicBool::new(false),
            stats,
        }
    }

    /// Toggle the process-wide pause flag.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        info!(paused, "delivery pause flag changed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Dispatch one advice to one subscriber, at most once ever.
    pub async fn deliver(
        &self,
        advice: &Advice,
        subscriber: &Subscriber,
        subject: &str,
        body: &str,
    ) -> DeliveryOutcome {
        if self.is_paused() {
            return DeliveryOutcome::Paused;
        }

        let (chain_id, proposal_id, subscriber_id) = (
            advice.chain_id.as_str(),
            advice.proposal_id,
            advice.subscriber_id.as_str(),
        );

        // Cheap lock-free probe first: the common duplicate case never
        // touches the lock table.
        match self.ledger.probe(chain_id, proposal_id, subscriber_id) {
            Ok(Some(_)) => {
                Stats::incr(&self.stats.duplicates_dropped);
                return DeliveryOutcome::AlreadySent;
            }
            Ok(None) => {}
            Err(e) => {
                Stats::incr(&self.stats.delivery_failures);
                return DeliveryOutcome::Failed(format!("ledger probe failed: {e}"));
            }
        }

        let key = format!("{chain_id}|{proposal_id}|{subscriber_id}");
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Double-check under the lock.
        match self.ledger.probe(chain_id, proposal_id, subscriber_id) {
            Ok(Some(_)) => {
                Stats::incr(&self.stats.duplicates_dropped);
                return DeliveryOutcome::AlreadySent;
            }
            Ok(None) => {}
            Err(e) => {
                Stats::incr(&self.stats.delivery_failures);
                return DeliveryOutcome::Failed(format!("ledger probe failed: {e}"));
            }
        }

        let accepted = match self.send_with_retry(&subscriber.address, subject, body).await {
            Ok(accepted) => accepted,
            Err(e) => {
                Stats::incr(&self.stats.delivery_failures);
                warn!(
                    chain = chain_id,
                    proposal_id,
                    subscriber = subscriber_id,
                    error = %e,
                    "notification failed"
                );
                return DeliveryOutcome::Failed(e.to_string());
            }
        };

        // Accepted: the mark MUST land before the lock is released, however
        // long that takes.
        let mark = DeliveryMark {
            chain_id: chain_id.to_string(),
            proposal_id,
            subscriber_id: subscriber_id.to_string(),
            sent_at: Utc::now(),
            message_id: accepted.message_id.clone(),
        };
        self.persist_until_done(&mark).await;

        Stats::incr(&self.stats.deliveries);
        info!(
            chain = chain_id,
            proposal_id,
            subscriber = subscriber_id,
            message_id = %accepted.message_id,
            "notification delivered"
        );
        DeliveryOutcome::Delivered {
            message_id: accepted.message_id,
        }
    }

    async fn send_with_retry(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> Result<Accepted, SendError> {
        let mut delay = SEND_BACKOFF_BASE;
        let mut last = None;
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let sent = tokio::time::timeout(
                SEND_TIMEOUT,
                self.notifier.send(address, subject, body),
            )
            .await
            .unwrap_or_else(|_| Err(SendError::Transient("send timed out".to_string())));
            match sent {
                Ok(accepted) => return Ok(accepted),
                Err(SendError::Permanent(e)) => return Err(SendError::Permanent(e)),
                Err(SendError::Transient(e)) => {
                    warn!(attempt, error = %e, "transient notifier error");
                    last = Some(e);
                }
            }
            if attempt < MAX_SEND_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 4).min(SEND_BACKOFF_CAP);
            }
        }
        Err(SendError::Transient(format!(
            "exhausted {MAX_SEND_ATTEMPTS} attempts: {}",
            last.unwrap_or_default()
        )))
    }

    /// Persist the mark, retrying forever. An existing mark (another writer
    /// won a race) is accepted as done.
    async fn persist_until_done(&self, mark: &DeliveryMark) {
        let mut delay = Duration::from_secs(1);
        loop {
            match self.ledger.try_insert(mark) {
                Ok(true) => return,
                Ok(false) => {
                    warn!(
                        chain = %mark.chain_id,
                        proposal_id = mark.proposal_id,
                        subscriber = %mark.subscriber_id,
                        "delivery mark already present at persist time"
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        chain = %mark.chain_id,
                        proposal_id = mark.proposal_id,
                        subscriber = %mark.subscriber_id,
                        error = %e,
                        "delivery mark persistence failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MARK_RETRY_CAP);
                }
            }
        }
    }
}

/// Structured-log notifier used when no real transport is wired in.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, address: &str, subject: &str, _body: &str) -> Result<Accepted, SendError> {
        info!(address, subject, "notification (log transport)");
        Ok(Accepted {
            message_id: format!("log-{}", Utc::now().timestamp_micros()),
        })
    }
}
