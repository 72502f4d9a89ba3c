//! Task lifecycle and backpressure for the whole pipeline.
//!
//! The scheduler owns one jittered periodic watcher loop per chain, a
//! bounded analysis queue (duplicate fingerprints are a no-op), a bounded
//! delivery queue, the LLM and notifier concurrency caps, and the hourly
//! cache sweep. Shutdown stops new ticks, drains analysis work within its
//! grace period, then delivery work within its own, then cancels the rest;
//! the delivery marks keep whatever was cut off idempotent on restart.

use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::advice;
use crate::analyzer::HybridAnalyzer;
use crate::cache::{AnalysisCache, CacheStatus};
use crate::chain::client::ChainQuerier;
use crate::chain::{ChainDescriptor, Fingerprint, Proposal, ProposalEvent};
use crate::config::{SchedulerConfig, WatcherConfig};
use crate::delivery::{self, DeliveryGate, DeliveryOutcome, Notifier};
use crate::metrics::{Stats, StatsSnapshot};
use crate::store::{AnalysisStore, CursorStore, DeliveryLedger};
use crate::subscribers::{Subscriber, SubscriberDirectory, SubscriberMatcher};
use crate::watcher::{Watcher, WatcherError};

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// How long to wait for in-flight watcher ticks on shutdown.
const WATCHER_GRACE: Duration = Duration::from_secs(5);

struct DeliveryJob {
    advice: advice::Advice,
    subscriber: Subscriber,
    subject: String,
    body: String,
}

/// Everything the pipeline shares.
struct Core {
    names: HashMap<String, String>,
    watcher: Watcher,
    cache: AnalysisCache,
    analyzer: Arc<HybridAnalyzer>,
    matcher: SubscriberMatcher,
    gate: DeliveryGate,
    stats: Arc<Stats>,
    llm_permits: Arc<Semaphore>,
    /// Fingerprints queued or being analyzed; enqueueing a duplicate is a
    /// no-op.
    pending: std::sync::Mutex<HashSet<Fingerprint>>,
}

pub struct Scheduler {
    core: Arc<Core>,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
    tick_triggers: HashMap<String, Arc<Notify>>,
    watcher_handles: Vec<JoinHandle<()>>,
    router_handle: JoinHandle<()>,
    analysis_handles: Vec<JoinHandle<()>>,
    delivery_handles: Vec<JoinHandle<()>>,
    sweep_handle: JoinHandle<()>,
}

impl Scheduler {
    /// Open the durable stores, wire the stages together, and spawn all
    /// long-running tasks.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        chains: Vec<ChainDescriptor>,
        querier: Arc<dyn ChainQuerier>,
        directory: Arc<dyn SubscriberDirectory>,
        notifier: Arc<dyn Notifier>,
        analyzer: Arc<HybridAnalyzer>,
        data_dir: &Path,
        watcher_config: WatcherConfig,
        config: SchedulerConfig,
    ) -> anyhow::Result<Self> {
        let stats = Arc::new(Stats::default());
        let cursors = CursorStore::open(data_dir)?;
        let analyses = AnalysisStore::open(data_dir)?;
        let ledger = DeliveryLedger::open(data_dir)?;

        let (event_tx, event_rx) = mpsc::channel::<ProposalEvent>(256);
        let (analysis_tx, analysis_rx) = mpsc::channel::<Proposal>(config.analysis_queue);
        let (delivery_tx, delivery_rx) = mpsc::channel::<DeliveryJob>(config.delivery_queue);

        let core = Arc::new(Core {
            names: chains
                .iter()
                .map(|c| (c.chain_id.clone(), c.name.clone()))
                .collect(),
            watcher: Watcher::new(querier, cursors, event_tx, stats.clone()),
            cache: AnalysisCache::new(analyses),
            analyzer,
            matcher: SubscriberMatcher::new(directory),
            gate: DeliveryGate::new(ledger, notifier, stats.clone()),
            stats,
            llm_permits: Arc::new(Semaphore::new(config.llm_concurrency)),
            pending: std::sync::Mutex::new(HashSet::new()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tick_triggers = HashMap::new();
        let mut watcher_handles = Vec::new();
        for chain in &chains {
            let trigger = Arc::new(Notify::new());
            tick_triggers.insert(chain.chain_id.clone(), trigger.clone());
            watcher_handles.push(tokio::spawn(watch_loop(
                core.clone(),
                chain.chain_id.clone(),
                watcher_config.poll_interval_secs,
                trigger,
                shutdown_rx.clone(),
            )));
        }

        let router_handle = tokio::spawn(route_events(
            core.clone(),
            event_rx,
            analysis_tx,
            shutdown_rx.clone(),
        ));

        let analysis_rx = Arc::new(Mutex::new(analysis_rx));
        let mut analysis_handles = Vec::new();
        for worker in 0..config.llm_concurrency {
            analysis_handles.push(tokio::spawn(analysis_worker(
                core.clone(),
                analysis_rx.clone(),
                delivery_tx.clone(),
                worker,
            )));
        }
        drop(delivery_tx);

        let delivery_rx = Arc::new(Mutex::new(delivery_rx));
        let mut delivery_handles = Vec::new();
        for worker in 0..config.send_concurrency {
            delivery_handles.push(tokio::spawn(delivery_worker(
                core.clone(),
                delivery_rx.clone(),
                worker,
            )));
        }

        let sweep_handle = tokio::spawn(sweep_loop(core.clone(), shutdown_rx));

        info!(
            chains = core.names.len(),
            llm_concurrency = config.llm_concurrency,
            send_concurrency = config.send_concurrency,
            "scheduler started"
        );

        Ok(Self {
            core,
            config,
            shutdown,
            tick_triggers,
            watcher_handles,
            router_handle,
            analysis_handles,
            delivery_handles,
            sweep_handle,
        })
    }

    /// Schedule an immediate watcher tick for one chain. Returns false for
    /// unknown chains.
    pub fn force_tick(&self, chain_id: &str) -> bool {
        match self.tick_triggers.get(chain_id) {
            Some(trigger) => {
                trigger.notify_one();
                true
            }
            None => false,
        }
    }

    /// Toggle the process-wide delivery pause flag.
    pub fn pause_delivery(&self, paused: bool) {
        self.core.gate.set_paused(paused);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Stop accepting ticks, drain analysis then delivery within their
    /// grace periods, and cancel whatever remains.
    pub async fn shutdown(self) {
        info!("scheduler shutting down");
        let _ = self.shutdown.send(true);

        for handle in self.watcher_handles {
            if tokio::time::timeout(WATCHER_GRACE, handle).await.is_err() {
                debug!("watcher task cancelled after grace period");
            }
        }
        // Router exits on the shutdown signal and drops the analysis queue
        // sender; workers then drain the queue to completion.
        let _ = self.router_handle.await;

        let analysis_grace = Duration::from_secs(self.config.analysis_grace_secs);
        if tokio::time::timeout(
            analysis_grace,
            futures::future::join_all(self.analysis_handles),
        )
        .await
        .is_err()
        {
            warn!("analysis queue not drained within grace period");
        }

        let delivery_grace = Duration::from_secs(self.config.delivery_grace_secs);
        if tokio::time::timeout(
            delivery_grace,
            futures::future::join_all(self.delivery_handles),
        )
        .await
        .is_err()
        {
            warn!("delivery queue not drained within grace period");
        }

        self.sweep_handle.abort();
        info!("scheduler stopped");
    }
}

/// Multiply the nominal interval by a ±10% factor so chains never tick in
/// lockstep.
fn jittered(interval_secs: u64) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(interval_secs as f64 * factor)
}

/// One chain's periodic tick loop. An immediate first tick, then jittered
/// intervals; `trigger` forces a tick out of band. Cursor corruption halts
/// the loop until the process restarts with a repaired cursor.
async fn watch_loop(
    core: Arc<Core>,
    chain_id: String,
    interval_secs: u64,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match core.watcher.tick(&chain_id).await {
            Ok(_) => {}
            Err(WatcherError::CursorCorrupt { source, .. }) => {
                error!(
                    chain = %chain_id,
                    error = %source,
                    "cursor corrupt; watcher halted for this chain until restart"
                );
                return;
            }
            Err(e) => {
                warn!(chain = %chain_id, error = %e, "tick failed, retrying next interval");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(jittered(interval_secs)) => {}
            _ = trigger.notified() => {
                debug!(chain = %chain_id, "manual tick requested");
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(chain = %chain_id, "watcher loop stopped");
}

/// Move watcher events onto the analysis queue, deduplicating by
/// fingerprint.
async fn route_events(
    core: Arc<Core>,
    mut events: mpsc::Receiver<ProposalEvent>,
    analysis_tx: mpsc::Sender<Proposal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let proposal = event.proposal().clone();
        let fingerprint = proposal.fingerprint();
        {
            let mut pending = core.pending.lock().expect("pending set poisoned");
            if !pending.insert(fingerprint) {
                debug!(fingerprint = %fingerprint, "duplicate fingerprint enqueue ignored");
                continue;
            }
        }
        if analysis_tx.send(proposal).await.is_err() {
            break;
        }
    }
    debug!("event router stopped");
}

/// Pull proposals off the analysis queue, resolve the analysis through the
/// cache (single LLM call per fingerprint), and fan advice out to the
/// delivery queue.
async fn analysis_worker(
    core: Arc<Core>,
    queue: Arc<Mutex<mpsc::Receiver<Proposal>>>,
    delivery_tx: mpsc::Sender<DeliveryJob>,
    worker: usize,
) {
    loop {
        let proposal = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(proposal) = proposal else { break };

        let fingerprint = proposal.fingerprint();
        process_proposal(&core, &proposal, &delivery_tx).await;
        core.pending
            .lock()
            .expect("pending set poisoned")
            .remove(&fingerprint);
    }
    debug!(worker, "analysis worker stopped");
}

async fn process_proposal(
    core: &Arc<Core>,
    proposal: &Proposal,
    delivery_tx: &mpsc::Sender<DeliveryJob>,
) {
    let now = Utc::now();
    let subscribers = match core.matcher.matches(&proposal.chain_id, now).await {
        Ok(subscribers) => subscribers,
        Err(e) => {
            warn!(
                chain = %proposal.chain_id,
                proposal_id = proposal.proposal_id,
                error = %e,
                "subscriber directory read failed"
            );
            return;
        }
    };
    if subscribers.is_empty() {
        debug!(
            chain = %proposal.chain_id,
            proposal_id = proposal.proposal_id,
            "no active subscribers, skipping analysis"
        );
        return;
    }

    let chain_name = core
        .names
        .get(&proposal.chain_id)
        .cloned()
        .unwrap_or_else(|| proposal.chain_id.clone());

    // Analysis is per proposal: the first triggering subscriber's policy
    // shapes the shared result.
    let policy = subscribers[0].policy.clone();
    let fingerprint = proposal.fingerprint();
    let outcome = core
        .cache
        .get_or_compute(fingerprint, proposal.status, || {
            let analyzer = core.analyzer.clone();
            let permits = core.llm_permits.clone();
            let proposal = proposal.clone();
            let chain_name = chain_name.clone();
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow::anyhow!("llm semaphore closed"))?;
                Ok(analyzer.analyze(&proposal, &chain_name, &policy).await)
            }
        })
        .await;

    let analysis = match outcome {
        Ok((analysis, CacheStatus::Computed)) => {
            Stats::incr(&core.stats.cache_misses);
            Stats::incr(&core.stats.analyses_computed);
            analysis
        }
        Ok((analysis, _)) => {
            Stats::incr(&core.stats.cache_hits);
            analysis
        }
        Err(e) => {
            warn!(
                chain = %proposal.chain_id,
                proposal_id = proposal.proposal_id,
                error = %e,
                "analysis unavailable"
            );
            return;
        }
    };

    let subject = delivery::subject(&chain_name, proposal);
    for subscriber in subscribers {
        let advice =
            advice::render_for(&proposal.chain_id, proposal.proposal_id, &analysis, &subscriber, Utc::now());
        let body = delivery::body(&advice, proposal);
        let job = DeliveryJob {
            advice,
            subscriber,
            subject: subject.clone(),
            body,
        };
        if delivery_tx.send(job).await.is_err() {
            warn!("delivery queue closed, dropping remaining fan-out");
            return;
        }
    }
}

/// Pull advice off the delivery queue and push it through the gate. Worker
/// count equals the notifier concurrency cap.
async fn delivery_worker(
    core: Arc<Core>,
    queue: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    worker: usize,
) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        // A paused gate does not consume the advice: hold the job and
        // retry at a slow cadence until the flag clears.
        loop {
            let outcome = core
                .gate
                .deliver(&job.advice, &job.subscriber, &job.subject, &job.body)
                .await;
            if outcome != DeliveryOutcome::Paused {
                break;
            }
            debug!(
                chain = %job.advice.chain_id,
                proposal_id = job.advice.proposal_id,
                subscriber = %job.advice.subscriber_id,
                "delivery paused, holding advice"
            );
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
    debug!(worker, "delivery worker stopped");
}

/// Hourly cache sweep.
async fn sweep_loop(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
        match core.cache.sweep(Utc::now()) {
            Ok(_) => Stats::incr(&core.stats.sweeps),
            Err(e) => warn!(error = %e, "cache sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::provider::{AnalysisProvider, ProviderError};
    use crate::analyzer::{Recommendation, RiskLevel};
    use crate::chain::client::ClientError;
    use crate::chain::{ProposalStatus, ProposalSummary};
    use crate::delivery::{Accepted, SendError};
    use crate::subscribers::Policy;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::collections::{BTreeSet, HashMap as StdHashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn proposal(chain_id: &str, id: u64, title: &str, status: ProposalStatus) -> Proposal {
        Proposal {
            chain_id: chain_id.into(),
            proposal_id: id,
            title: title.into(),
            description: "raise the taker fee parameter".into(),
            status,
            voting_start: None,
            voting_end: None,
            submit_time: None,
            proposer: String::new(),
            type_tag: String::new(),
        }
    }

    #[derive(Default)]
    struct FakeChain {
        proposals: StdMutex<StdHashMap<(String, u64), Proposal>>,
    }

    impl FakeChain {
        fn set(&self, p: Proposal) {
            self.proposals
                .lock()
                .unwrap()
                .insert((p.chain_id.clone(), p.proposal_id), p);
        }
    }

    #[async_trait]
    impl ChainQuerier for FakeChain {
        async fn list_active(&self, chain_id: &str) -> Result<Vec<ProposalSummary>, ClientError> {
            Ok(self
                .proposals
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.chain_id == chain_id && !p.status.is_terminal())
                .map(|p| ProposalSummary {
                    proposal_id: p.proposal_id,
                    status: p.status,
                })
                .collect())
        }

        async fn fetch(&self, chain_id: &str, proposal_id: u64) -> Result<Proposal, ClientError> {
            self.proposals
                .lock()
                .unwrap()
                .get(&(chain_id.to_string(), proposal_id))
                .cloned()
                .ok_or(ClientError::NotFound {
                    chain_id: chain_id.into(),
                    proposal_id,
                })
        }
    }

    struct FixedDirectory {
        subscribers: Vec<Subscriber>,
    }

    #[async_trait]
    impl SubscriberDirectory for FixedDirectory {
        async fn list_subscribers_for(
            &self,
            chain_id: &str,
            now: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Subscriber>> {
            Ok(self
                .subscribers
                .iter()
                .filter(|s| s.is_active(now) && s.chains.contains(chain_id))
                .cloned()
                .collect())
        }
    }

    fn subscriber(id: &str, chain: &str, tolerance: RiskLevel) -> Subscriber {
        Subscriber {
            subscriber_id: id.into(),
            address: format!("{id}@example.org"),
            chains: BTreeSet::from([chain.to_string()]),
            policy: Policy {
                risk_tolerance: tolerance,
                ..Default::default()
            },
            active: true,
            active_until: Utc::now() + ChronoDuration::days(30),
        }
    }

    /// Always-healthy provider with a concurrency gauge.
    struct OkProvider {
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl OkProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AnalysisProvider for OkProvider {
        fn name(&self) -> &str {
            "primary"
        }

        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"{
                "recommendation": "APPROVE",
                "confidence": 0.85,
                "reasoning": "Fee change is conservative and well scoped.",
                "risk_assessment": "LOW"
            }"#
            .to_string())
        }
    }

    /// Provider that always fails with the given kind of error.
    struct BrokenProvider {
        name: &'static str,
        transient: bool,
    }

    #[async_trait]
    impl AnalysisProvider for BrokenProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            if self.transient {
                Err(ProviderError::Transient("timeout".into()))
            } else {
                Err(ProviderError::Permanent("model unavailable".into()))
            }
        }
    }

    /// Accept-everything notifier with send log and concurrency gauge.
    struct RecordingNotifier {
        accepted: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        sent: StdMutex<Vec<(String, String, String)>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                accepted: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            address: &str,
            subject: &str,
            body: &str,
        ) -> Result<Accepted, SendError> {
            let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let n = self.accepted.fetch_add(1, Ordering::SeqCst);
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), subject.to_string(), body.to_string()));
            Ok(Accepted {
                message_id: format!("msg-{n}"),
            })
        }
    }

    struct Rig {
        chain: Arc<FakeChain>,
        notifier: Arc<RecordingNotifier>,
        provider: Arc<OkProvider>,
        scheduler: Scheduler,
        dir: tempfile::TempDir,
    }

    fn descriptor(chain_id: &str, name: &str) -> ChainDescriptor {
        ChainDescriptor {
            chain_id: chain_id.into(),
            name: name.into(),
            endpoints: vec!["http://unused.invalid".into()],
        }
    }

    fn start_rig(
        chain_id: &str,
        chain_name: &str,
        subscribers: Vec<Subscriber>,
        providers: Vec<Arc<dyn AnalysisProvider>>,
        data_dir: &Path,
        chain: Arc<FakeChain>,
    ) -> (Scheduler, Arc<RecordingNotifier>) {
        let notifier = RecordingNotifier::new();
        let scheduler = Scheduler::start(
            vec![descriptor(chain_id, chain_name)],
            chain,
            Arc::new(FixedDirectory { subscribers }),
            notifier.clone(),
            Arc::new(HybridAnalyzer::new(providers)),
            data_dir,
            WatcherConfig {
                poll_interval_secs: 3600,
                ..Default::default()
            },
            SchedulerConfig::default(),
        )
        .unwrap();
        (scheduler, notifier)
    }

    fn rig_with(subscribers: Vec<Subscriber>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(FakeChain::default());
        chain.set(proposal(
            "osmosis-1",
            848,
            "Increase taker fees",
            ProposalStatus::Voting,
        ));
        let provider = OkProvider::new();
        let notifier = RecordingNotifier::new();
        let scheduler = Scheduler::start(
            vec![descriptor("osmosis-1", "Osmosis")],
            chain.clone(),
            Arc::new(FixedDirectory { subscribers }),
            notifier.clone(),
            Arc::new(HybridAnalyzer::new(vec![
                provider.clone() as Arc<dyn AnalysisProvider>
            ])),
            dir.path(),
            WatcherConfig {
                poll_interval_secs: 3600,
                ..Default::default()
            },
            SchedulerConfig::default(),
        )
        .unwrap();
        Rig {
            chain,
            notifier,
            provider,
            scheduler,
            dir,
        }
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached: {what}");
    }

    /// S1: new VOTING proposal, one subscriber, analyzer approves.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s1_new_proposal_delivers_once_with_subject_and_yes() {
        let rig = rig_with(vec![subscriber("sub-A", "osmosis-1", RiskLevel::Low)]);
        let ledger = DeliveryLedger::open(rig.dir.path()).unwrap();

        wait_until("mark created", || {
            ledger.probe("osmosis-1", 848, "sub-A").unwrap().is_some()
        })
        .await;

        let sent = rig.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let (address, subject, body) = &sent[0];
        assert_eq!(address, "sub-A@example.org");
        assert_eq!(subject, "[Osmosis] Proposal #848: Increase taker fees");
        assert!(body.contains("RECOMMENDATION: YES"));

        rig.scheduler.shutdown().await;
    }

    /// S2: a re-tick with no change produces no sends and no computes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s2_unchanged_retick_is_fully_quiet() {
        let rig = rig_with(vec![subscriber("sub-A", "osmosis-1", RiskLevel::Low)]);
        let ledger = DeliveryLedger::open(rig.dir.path()).unwrap();
        wait_until("first delivery", || {
            ledger.probe("osmosis-1", 848, "sub-A").unwrap().is_some()
        })
        .await;
        let cursors = CursorStore::open(rig.dir.path()).unwrap();
        let cursor_before = cursors.load("osmosis-1").unwrap().unwrap();

        assert!(rig.scheduler.force_tick("osmosis-1"));
        wait_until("second tick", || rig.scheduler.stats().ticks >= 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(rig.notifier.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(rig.scheduler.stats().analyses_computed, 1);
        assert_eq!(rig.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cursors.load("osmosis-1").unwrap().unwrap(), cursor_before);

        rig.scheduler.shutdown().await;
    }

    /// S3: transition to PASSED computes a new 7-day analysis but the
    /// delivery mark suppresses any further notification.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s3_status_transition_reanalyzes_without_renotifying() {
        let rig = rig_with(vec![subscriber("sub-A", "osmosis-1", RiskLevel::Low)]);
        let ledger = DeliveryLedger::open(rig.dir.path()).unwrap();
        wait_until("first delivery", || {
            ledger.probe("osmosis-1", 848, "sub-A").unwrap().is_some()
        })
        .await;

        rig.chain.set(proposal(
            "osmosis-1",
            848,
            "Increase taker fees",
            ProposalStatus::Passed,
        ));
        assert!(rig.scheduler.force_tick("osmosis-1"));
        wait_until("second analysis", || {
            rig.scheduler.stats().analyses_computed == 2
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // New fingerprint, terminal TTL.
        let store = AnalysisStore::open(rig.dir.path()).unwrap();
        let passed_fp = Fingerprint::of(
            "osmosis-1",
            848,
            "Increase taker fees",
            ProposalStatus::Passed,
        );
        let analysis = store.load(passed_fp).unwrap().unwrap();
        assert_eq!(analysis.expires_at - analysis.created_at, ChronoDuration::days(7));

        // Deliveries unchanged.
        assert_eq!(rig.notifier.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(rig.scheduler.stats().deliveries, 1);

        rig.scheduler.shutdown().await;
    }

    /// S4: every provider fails; the stored fallback analysis still flows
    /// through one-shot delivery with an abstain rationale.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s4_total_provider_failure_delivers_abstain_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(FakeChain::default());
        chain.set(proposal(
            "cosmoshub-4",
            1,
            "Adjust inflation",
            ProposalStatus::Voting,
        ));
        let (scheduler, notifier) = start_rig(
            "cosmoshub-4",
            "Cosmos Hub",
            vec![subscriber("sub-A", "cosmoshub-4", RiskLevel::Low)],
            vec![
                Arc::new(BrokenProvider {
                    name: "primary",
                    transient: true,
                }) as Arc<dyn AnalysisProvider>,
                Arc::new(BrokenProvider {
                    name: "local",
                    transient: false,
                }),
            ],
            dir.path(),
            chain,
        );

        wait_until("fallback delivered", || {
            notifier.accepted.load(Ordering::SeqCst) == 1
        })
        .await;

        let sent = notifier.sent.lock().unwrap().clone();
        let (_, subject, body) = &sent[0];
        assert!(subject.contains("Proposal #1"));
        assert!(body.contains("RECOMMENDATION: ABSTAIN"));
        assert!(body.contains("\nno provider available"));
        assert!(body.contains("Confidence: 0%"));

        scheduler.shutdown().await;
    }

    /// S5: 100 subscribers, one compute, bounded concurrency.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn s5_hundred_subscriber_fanout_is_single_flight_and_bounded() {
        let subscribers: Vec<Subscriber> = (0..100)
            .map(|n| subscriber(&format!("sub-{n:03}"), "osmosis-1", RiskLevel::Medium))
            .collect();
        let rig = rig_with(subscribers);

        wait_until("hundred deliveries", || {
            rig.notifier.accepted.load(Ordering::SeqCst) == 100
        })
        .await;

        assert_eq!(rig.provider.calls.load(Ordering::SeqCst), 1);
        assert!(rig.provider.max_concurrent.load(Ordering::SeqCst) <= 3);
        assert!(rig.notifier.max_concurrent.load(Ordering::SeqCst) <= 8);

        let ledger = DeliveryLedger::open(rig.dir.path()).unwrap();
        for n in 0..100 {
            assert!(
                ledger
                    .probe("osmosis-1", 848, &format!("sub-{n:03}"))
                    .unwrap()
                    .is_some(),
                "missing mark for sub-{n:03}"
            );
        }

        rig.scheduler.shutdown().await;
    }

    /// P5: restarting over the same durable state and replaying the same
    /// chain responses produces no additional sends.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restart_replay_is_idempotent() {
        let rig = rig_with(vec![subscriber("sub-A", "osmosis-1", RiskLevel::Low)]);
        let ledger = DeliveryLedger::open(rig.dir.path()).unwrap();
        wait_until("first delivery", || {
            ledger.probe("osmosis-1", 848, "sub-A").unwrap().is_some()
        })
        .await;
        let Rig {
            chain,
            notifier,
            scheduler,
            dir,
            ..
        } = rig;
        assert_eq!(notifier.accepted.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;

        // Second process over the same data directory and chain state.
        let provider = OkProvider::new();
        let notifier2 = RecordingNotifier::new();
        let scheduler2 = Scheduler::start(
            vec![descriptor("osmosis-1", "Osmosis")],
            chain,
            Arc::new(FixedDirectory {
                subscribers: vec![subscriber("sub-A", "osmosis-1", RiskLevel::Low)],
            }),
            notifier2.clone(),
            Arc::new(HybridAnalyzer::new(vec![
                provider.clone() as Arc<dyn AnalysisProvider>
            ])),
            dir.path(),
            WatcherConfig {
                poll_interval_secs: 3600,
                ..Default::default()
            },
            SchedulerConfig::default(),
        )
        .unwrap();

        wait_until("replay tick", || scheduler2.stats().ticks >= 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The replayed NEW event re-reads the cached analysis and the mark
        // suppresses the duplicate send.
        assert_eq!(notifier2.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler2.stats().analyses_computed, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(scheduler2.stats().duplicates_dropped >= 1);

        scheduler2.shutdown().await;
    }

    /// Pause flag short-circuits delivery and resumes cleanly.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pause_holds_delivery_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(FakeChain::default());
        let provider = OkProvider::new();
        let notifier = RecordingNotifier::new();
        let scheduler = Scheduler::start(
            vec![descriptor("osmosis-1", "Osmosis")],
            chain.clone(),
            Arc::new(FixedDirectory {
                subscribers: vec![subscriber("sub-A", "osmosis-1", RiskLevel::Low)],
            }),
            notifier.clone(),
            Arc::new(HybridAnalyzer::new(vec![
                provider.clone() as Arc<dyn AnalysisProvider>
            ])),
            dir.path(),
            WatcherConfig {
                poll_interval_secs: 3600,
                ..Default::default()
            },
            SchedulerConfig::default(),
        )
        .unwrap();

        scheduler.pause_delivery(true);
        chain.set(proposal(
            "osmosis-1",
            848,
            "Increase taker fees",
            ProposalStatus::Voting,
        ));
        scheduler.force_tick("osmosis-1");

        wait_until("analysis done", || scheduler.stats().analyses_computed == 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(notifier.accepted.load(Ordering::SeqCst), 0);

        scheduler.pause_delivery(false);
        wait_until("delivered after unpause", || {
            notifier.accepted.load(Ordering::SeqCst) == 1
        })
        .await;

        scheduler.shutdown().await;
    }

    /// Unknown chains are rejected by the admin tick surface.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn force_tick_rejects_unknown_chain() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(FakeChain::default());
        let provider = OkProvider::new();
        let notifier = RecordingNotifier::new();
        let scheduler = Scheduler::start(
            vec![descriptor("osmosis-1", "Osmosis")],
            chain,
            Arc::new(FixedDirectory {
                subscribers: Vec::new(),
            }),
            notifier,
            Arc::new(HybridAnalyzer::new(vec![
                provider as Arc<dyn AnalysisProvider>
            ])),
            dir.path(),
            WatcherConfig::default(),
            SchedulerConfig::default(),
        )
        .unwrap();

        assert!(scheduler.force_tick("osmosis-1"));
        assert!(!scheduler.force_tick("nosuchchain-1"));

        scheduler.shutdown().await;
    }
}
