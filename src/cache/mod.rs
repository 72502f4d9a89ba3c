//! Content-addressed analysis cache with single-flight computation.
//!
//! Lookups and inserts are keyed by proposal fingerprint only. The cache
//! guarantees that for any fingerprint at most one compute (LLM call) is in
//! flight at a time: concurrent requesters attach to the ongoing
//! computation and share its result. Results persist through the analysis
//! store and survive restarts; an in-flight computation lost to a crash is
//! simply absent and re-runs on demand.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::analyzer::{Analysis, Verdict};
use crate::chain::{Fingerprint, ProposalStatus};
use crate::store::{AnalysisStore, StoreError};

/// Analyses older than this are purged by the sweep regardless of status.
pub const MAX_ANALYSIS_AGE_DAYS: i64 = 30;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("analysis computation failed: {0}")]
    Compute(String),
}

/// How a lookup was satisfied, for counter accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh entry served from the store.
    Hit,
    /// This caller ran the computation.
    Computed,
    /// Another caller's in-flight computation was joined.
    Joined,
}

/// Time-to-live by proposal status: active proposals go stale in a day,
/// settled ones keep their analysis for a week.
pub fn ttl(status: ProposalStatus) -> Duration {
    match status {
        ProposalStatus::Deposit | ProposalStatus::Voting => Duration::hours(24),
        ProposalStatus::Passed | ProposalStatus::Rejected | ProposalStatus::Failed => {
            Duration::days(7)
        }
    }
}

type Shared = watch::Receiver<Option<Result<Analysis, String>>>;

pub struct AnalysisCache {
    store: AnalysisStore,
    /// Fingerprint → broadcast of the in-flight computation's outcome.
    /// Guarded by one async mutex; entries live only while computing.
    inflight: Mutex<HashMap<Fingerprint, Shared>>,
}

impl AnalysisCache {
    pub fn new(store: AnalysisStore) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached analysis for `fingerprint`, or run `compute` to
    /// produce it. Concurrent calls for the same fingerprint share one
    /// computation. A failed computation is propagated to every waiter and
    /// leaves no negative entry behind.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        status: ProposalStatus,
        compute: F,
    ) -> Result<(Analysis, CacheStatus), CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Verdict, anyhow::Error>>,
    {
        let tx = {
            let mut inflight = self.inflight.lock().await;

            let now = Utc::now();
            if let Some(existing) = self.store.load(fingerprint)? {
                if !existing.is_expired(now) {
                    debug!(fingerprint = %fingerprint, "analysis cache hit");
                    return Ok((existing, CacheStatus::Hit));
                }
                debug!(fingerprint = %fingerprint, "cached analysis expired, recomputing");
            }

            if let Some(rx) = inflight.get(&fingerprint) {
                let rx = rx.clone();
                drop(inflight);
                let analysis = Self::wait_for(rx).await?;
                return Ok((analysis, CacheStatus::Joined));
            }

            let (tx, rx) = watch::channel(None);
            inflight.insert(fingerprint, rx);
            tx
        };

        let outcome = compute().await;

        // Remove the marker before publishing so late subscribers either see
        // the stored entry or start a fresh computation.
        let result = match outcome {
            Ok(verdict) => {
                let now = Utc::now();
                let analysis = Analysis {
                    fingerprint,
                    provider: verdict.provider,
                    recommendation: verdict.recommendation,
                    confidence: verdict.confidence,
                    reasoning: verdict.reasoning,
                    risk_assessment: verdict.risk_assessment,
                    extra: verdict.extra,
                    created_at: now,
                    expires_at: now + ttl(status),
                };
                if let Err(e) = self.store.save(&analysis) {
                    // The result itself is still good; serve it and let a
                    // later pass re-persist.
                    warn!(fingerprint = %fingerprint, error = %e, "failed to persist analysis");
                }
                Ok(analysis)
            }
            Err(e) => Err(e.to_string()),
        };

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&fingerprint);
        }
        let _ = tx.send(Some(result.clone()));

        match result {
            Ok(analysis) => Ok((analysis, CacheStatus::Computed)),
            Err(msg) => Err(CacheError::Compute(msg)),
        }
    }

    async fn wait_for(mut rx: Shared) -> Result<Analysis, CacheError> {
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result.map_err(CacheError::Compute);
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing: computation abandoned.
                return Err(CacheError::Compute("computation abandoned".to_string()));
            }
        }
    }

    /// Purge analyses older than [`MAX_ANALYSIS_AGE_DAYS`]. Called from the
    /// scheduler's sweep task, at most hourly.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let cutoff = now - Duration::days(MAX_ANALYSIS_AGE_DAYS);
        let removed = self.store.purge_older_than(cutoff)?;
        if removed > 0 {
            info!(removed, "analysis sweep purged aged entries");
        }
        Ok(removed)
    }

    /// Direct read without computing, for diagnostics.
    pub fn peek(&self, fingerprint: Fingerprint) -> Result<Option<Analysis>, CacheError> {
        Ok(self.store.load(fingerprint)?)
    }
}
