//! Subscribers and the chain → subscriber matcher.
//!
//! The subscriber directory is owned by external subscription management;
//! the core only reads it. Reads are cached per chain for up to five
//! minutes, which is the staleness the directory contract allows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::analyzer::RiskLevel;

/// How long a cached directory read stays valid.
pub const DIRECTORY_STALENESS: Duration = Duration::from_secs(300);

/// Subscriber preferences shaping advice. Opaque input to the analyzer
/// prompt; the core never interprets the criteria beyond rendering them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: RiskLevel,
    /// Criterion name → non-negative weight; weights sum to 1.0.
    #[serde(default)]
    pub criteria: BTreeMap<String, f64>,
    /// Free-form short policy statements.
    #[serde(default)]
    pub blurbs: Vec<String>,
}

fn default_risk_tolerance() -> RiskLevel {
    RiskLevel::Medium
}

/// A notification recipient. Read-only within the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub subscriber_id: String,
    /// Delivery address, opaque to the core.
    pub address: String,
    /// Watched chain IDs; non-empty for a valid subscriber.
    pub chains: BTreeSet<String>,
    #[serde(default)]
    pub policy: Policy,
    pub active: bool,
    pub active_until: DateTime<Utc>,
}

impl Subscriber {
    /// Eligibility for delivery at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.active_until
    }
}

/// Read access to the external subscriber directory.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Subscribers watching `chain_id` that are active at `now`.
    async fn list_subscribers_for(
        &self,
        chain_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Subscriber>>;
}

struct CachedRead {
    fetched_at: Instant,
    subscribers: Vec<Subscriber>,
}

/// Resolves the subscribers interested in a chain, caching directory reads
/// per chain for [`DIRECTORY_STALENESS`].
pub struct SubscriberMatcher {
    directory: Arc<dyn SubscriberDirectory>,
    cache: DashMap<String, CachedRead>,
    staleness: Duration,
}

impl SubscriberMatcher {
    pub fn new(directory: Arc<dyn SubscriberDirectory>) -> Self {
        Self::with_staleness(directory, DIRECTORY_STALENESS)
    }

    pub fn with_staleness(directory: Arc<dyn SubscriberDirectory>, staleness: Duration) -> Self {
        Self {
            directory,
            cache: DashMap::new(),
            staleness,
        }
    }

    /// All subscribers that should receive advice for proposals on
    /// `chain_id`: watching the chain, active, and not past `active_until`.
    /// Directory filters are re-checked locally so a permissive directory
    /// cannot widen delivery.
    pub async fn matches(
        &self,
        chain_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Subscriber>> {
        if let Some(cached) = self.cache.get(chain_id) {
            if cached.fetched_at.elapsed() < self.staleness {
                return Ok(Self::filter(&cached.subscribers, chain_id, now));
            }
        }

        let subscribers = self.directory.list_subscribers_for(chain_id, now).await?;
        debug!(
            chain = chain_id,
            subscribers = subscribers.len(),
            "directory read refreshed"
        );
        let filtered = Self::filter(&subscribers, chain_id, now);
        self.cache.insert(
            chain_id.to_string(),
            CachedRead {
                fetched_at: Instant::now(),
                subscribers,
            },
        );
        Ok(filtered)
    }

    fn filter(subscribers: &[Subscriber], chain_id: &str, now: DateTime<Utc>) -> Vec<Subscriber> {
        subscribers
            .iter()
            .filter(|s| s.is_active(now) && s.chains.contains(chain_id))
            .cloned()
            .collect()
    }

    /// Drop all cached reads (used by tests and forced refreshes).
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

/// Directory backed by a JSON file maintained by the external subscription
/// manager. The file holds a flat list of subscribers; it is re-read on
/// every (uncached) lookup, so edits show up within the staleness window.
pub struct FileDirectory {
    path: std::path::PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SubscriberDirectory for FileDirectory {
    async fn list_subscribers_for(
        &self,
        chain_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Subscriber>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<Subscriber> = serde_json::from_slice(&raw)?;
        Ok(all
            .into_iter()
            .filter(|s| s.is_active(now) && s.chains.contains(chain_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn subscriber(id: &str, chains: &[&str], active: bool, until: DateTime<Utc>) -> Subscriber {
        Subscriber {
            subscriber_id: id.into(),
            address: format!("{id}@example.org"),
            chains: chains.iter().map(|c| c.to_string()).collect(),
            policy: Policy::default(),
            active,
            active_until: until,
        }
    }

    struct FixedDirectory {
        subscribers: Vec<Subscriber>,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SubscriberDirectory for FixedDirectory {
        async fn list_subscribers_for(
            &self,
            chain_id: &str,
            _now: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Subscriber>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .subscribers
                .iter()
                .filter(|s| s.chains.contains(chain_id))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn matches_filters_inactive_and_expired() {
        let now = Utc::now();
        let directory = Arc::new(FixedDirectory {
            subscribers: vec![
                subscriber("sub-A", &["osmosis-1"], true, now + ChronoDuration::days(30)),
                subscriber("sub-B", &["osmosis-1"], false, now + ChronoDuration::days(30)),
                subscriber("sub-C", &["osmosis-1"], true, now - ChronoDuration::days(1)),
                subscriber("sub-D", &["cosmoshub-4"], true, now + ChronoDuration::days(30)),
            ],
            reads: AtomicUsize::new(0),
        });
        let matcher = SubscriberMatcher::new(directory);

        let matched = matcher.matches("osmosis-1", now).await.unwrap();
        let ids: Vec<_> = matched.iter().map(|s| s.subscriber_id.as_str()).collect();
        assert_eq!(ids, vec!["sub-A"]);
    }

    #[tokio::test]
    async fn directory_reads_are_cached_within_staleness_window() {
        let now = Utc::now();
        let directory = Arc::new(FixedDirectory {
            subscribers: vec![subscriber(
                "sub-A",
                &["osmosis-1"],
                true,
                now + ChronoDuration::days(30),
            )],
            reads: AtomicUsize::new(0),
        });
        let matcher = SubscriberMatcher::new(directory.clone());

        matcher.matches("osmosis-1", now).await.unwrap();
        matcher.matches("osmosis-1", now).await.unwrap();
        matcher.matches("osmosis-1", now).await.unwrap();
        assert_eq!(directory.reads.load(Ordering::SeqCst), 1);

        // Different chain is a separate cache entry.
        matcher.matches("cosmoshub-4", now).await.unwrap();
        assert_eq!(directory.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_staleness_always_rereads() {
        let now = Utc::now();
        let directory = Arc::new(FixedDirectory {
            subscribers: vec![],
            reads: AtomicUsize::new(0),
        });
        let matcher = SubscriberMatcher::with_staleness(directory.clone(), Duration::ZERO);

        matcher.matches("osmosis-1", now).await.unwrap();
        matcher.matches("osmosis-1", now).await.unwrap();
        assert_eq!(directory.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let now = Utc::now();
        let s = subscriber("sub-A", &["osmosis-1"], true, now);
        assert!(!s.is_active(now));
        assert!(s.is_active(now - ChronoDuration::seconds(1)));
    }
}
