//! Multi-chain proposal watcher.
//!
//! One tick observes a chain: list the active proposals, re-fetch anything
//! the previous cursor still tracked (to catch status changes on proposals
//! that just dropped off the active list), diff against the last known
//! state, emit `New`/`Changed` events, and persist the advanced cursor
//! atomically. A tick that fails entirely leaves the cursor untouched; a
//! partial tick persists only what was confirmed.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chain::client::{ChainQuerier, ClientError};
use crate::chain::{Proposal, ProposalEvent, ProposalStatus};
use crate::metrics::Stats;
use crate::store::{Cursor, CursorStore, StoreError};

#[derive(Error, Debug)]
pub enum WatcherError {
    /// The chain's cursor record is unreadable. Fatal for this chain's
    /// watcher task until the record is repaired.
    #[error("cursor corrupt for {chain_id}: {source}")]
    CursorCorrupt {
        chain_id: String,
        #[source]
        source: StoreError,
    },
    #[error("active listing failed for {chain_id}: {source}")]
    ListFailed {
        chain_id: String,
        #[source]
        source: ClientError,
    },
    #[error("active listing timed out for {chain_id}")]
    ListTimeout { chain_id: String },
    #[error(transparent)]
    Store(StoreError),
    #[error("event channel closed")]
    ChannelClosed,
}

/// What one tick observed, for logging and counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub observed: usize,
    pub new_events: usize,
    pub changed_events: usize,
    pub fetch_failures: usize,
}

/// Deadline for one full active-proposal listing.
const LIST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

pub struct Watcher {
    querier: Arc<dyn ChainQuerier>,
    cursors: CursorStore,
    events: mpsc::Sender<ProposalEvent>,
    stats: Arc<Stats>,
    /// Last observed proposal per (chain, id); in-memory only. After a
    /// restart everything re-emits as `New` and the delivery marks absorb
    /// the replay.
    known: DashMap<(String, u64), Proposal>,
}

impl Watcher {
    pub fn new(
        querier: Arc<dyn ChainQuerier>,
        cursors: CursorStore,
        events: mpsc::Sender<ProposalEvent>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            querier,
            cursors,
            events,
            stats,
            known: DashMap::new(),
        }
    }

    /// Run one tick for `chain_id`.
    pub async fn tick(&self, chain_id: &str) -> Result<TickSummary, WatcherError> {
        Stats::incr(&self.stats.ticks);

        let cursor = match self.cursors.load(chain_id) {
            Ok(c) => c.unwrap_or_default(),
            Err(e @ StoreError::Corrupt { .. }) => {
                return Err(WatcherError::CursorCorrupt {
                    chain_id: chain_id.to_string(),
                    source: e,
                })
            }
            Err(e) => return Err(WatcherError::Store(e)),
        };

        let listing = tokio::time::timeout(LIST_TIMEOUT, self.querier.list_active(chain_id))
            .await
            .map_err(|_| {
                Stats::incr(&self.stats.tick_failures);
                WatcherError::ListTimeout {
                    chain_id: chain_id.to_string(),
                }
            })?;
        let summaries = listing.map_err(|source| {
            Stats::incr(&self.stats.tick_failures);
            WatcherError::ListFailed {
                chain_id: chain_id.to_string(),
                source,
            }
        })?;

        // Same ID reported twice in one listing: keep the status later in
        // the forward order.
        let mut listed: BTreeMap<u64, ProposalStatus> = BTreeMap::new();
        for summary in summaries {
            listed
                .entry(summary.proposal_id)
                .and_modify(|status| {
                    if summary.status.rank() > status.rank() {
                        *status = summary.status;
                    }
                })
                .or_insert(summary.status);
        }

        // Fetch everything listed plus the previously tracked IDs that are
        // no longer listed (they may have gone terminal).
        let mut to_fetch: BTreeSet<u64> = listed.keys().copied().collect();
        to_fetch.extend(cursor.tracked.iter().copied());

        let mut summary = TickSummary::default();
        let mut confirmed: Vec<Proposal> = Vec::new();
        let mut unconfirmed_tracked: BTreeSet<u64> = BTreeSet::new();

        for proposal_id in to_fetch {
            match self.querier.fetch(chain_id, proposal_id).await {
                Ok(proposal) => {
                    summary.observed += 1;
                    confirmed.push(proposal);
                }
                Err(e) => {
                    summary.fetch_failures += 1;
                    warn!(
                        chain = chain_id,
                        proposal_id,
                        error = %e,
                        "proposal fetch failed, leaving cursor entry in place"
                    );
                    if cursor.tracked.contains(&proposal_id) {
                        unconfirmed_tracked.insert(proposal_id);
                    }
                }
            }
        }

        for proposal in &confirmed {
            self.diff_and_emit(proposal, &mut summary).await?;
        }

        let mut next = Cursor {
            highest_seen: cursor.highest_seen,
            tracked: unconfirmed_tracked,
        };
        for proposal in &confirmed {
            next.highest_seen = next.highest_seen.max(proposal.proposal_id);
            if !proposal.status.is_terminal() {
                next.tracked.insert(proposal.proposal_id);
            }
        }
        self.cursors
            .save(chain_id, &next)
            .map_err(WatcherError::Store)?;

        info!(
            chain = chain_id,
            observed = summary.observed,
            new = summary.new_events,
            changed = summary.changed_events,
            failures = summary.fetch_failures,
            highest_seen = next.highest_seen,
            "tick complete"
        );
        Ok(summary)
    }

    /// Compare one observed proposal against the last known state and emit
    /// the matching events.
    async fn diff_and_emit(
        &self,
        proposal: &Proposal,
        summary: &mut TickSummary,
    ) -> Result<(), WatcherError> {
        let key = (proposal.chain_id.clone(), proposal.proposal_id);

        let previous = self.known.get(&key).map(|p| p.value().clone());
        match previous {
            None => {
                self.known.insert(key, proposal.clone());
                summary.new_events += 1;
                self.emit(ProposalEvent::New(proposal.clone())).await?;

                // Never-seen proposals already terminal get a synthetic
                // change event so downstream stages see a uniform shape.
                if proposal.status.is_terminal() {
                    summary.changed_events += 1;
                    self.emit(ProposalEvent::Changed {
                        proposal: proposal.clone(),
                        old_status: ProposalStatus::Voting,
                    })
                    .await?;
                }
            }
            Some(old) => {
                if old.status.is_terminal() && !proposal.status.is_terminal() {
                    // No backward edges: a terminal proposal re-reported as
                    // live is a transient read error.
                    warn!(
                        chain = %proposal.chain_id,
                        proposal_id = proposal.proposal_id,
                        old_status = %old.status,
                        reported = %proposal.status,
                        "ignoring backward status transition"
                    );
                    return Ok(());
                }

                let changed = old.status != proposal.status
                    || old.title != proposal.title
                    || old.description != proposal.description
                    || old.voting_end != proposal.voting_end;
                if changed {
                    let old_status = old.status;
                    self.known.insert(key, proposal.clone());
                    summary.changed_events += 1;
                    self.emit(ProposalEvent::Changed {
                        proposal: proposal.clone(),
                        old_status,
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, event: ProposalEvent) -> Result<(), WatcherError> {
        Stats::incr(&self.stats.events_emitted);
        self.events
            .send(event)
            .await
            .map_err(|_| WatcherError::ChannelClosed)
    }
}
