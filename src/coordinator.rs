//! Run coordinator
//!
//! Wires the source poller, validation pool and dispatch pool together for
//! one run, reports progress and decides when the run is over.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{DispatchConfig, DispatchPool, Dispatcher, WorkBoard};
use crate::error::{BoostError, Result};
use crate::models::{ProgressSnapshot, WorkItem};
use crate::progress::{ProgressSink, TracingProgress};
use crate::proxy::probe::Probe;
use crate::proxy::registry::ProxyRegistry;
use crate::proxy::source::ProxySource;
use crate::proxy::validation::{ValidationConfig, ValidationPool, ValidationStats};
use crate::shutdown::{CancellationController, CancellationToken, ShutdownStage};

/// Coordinator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub validation: ValidationConfig,
    pub dispatch: DispatchConfig,
    /// Poll the feeds while fewer proxies than this are fetched, validating or valid
    pub low_water_mark: usize,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    /// How long the registry may hold no fetched, validating or valid proxy
    /// before the run is flagged stalled
    pub stall_after: Duration,
    /// Failed dispatches tolerated per item; `None` retries until cancelled
    pub max_failures_per_item: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            dispatch: DispatchConfig::default(),
            low_water_mark: 50,
            poll_interval: Duration::from_secs(60),
            progress_interval: Duration::from_secs(2),
            stall_after: Duration::from_secs(60),
            max_failures_per_item: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BoostError::InvalidConfig(msg.to_string()));

        if self.validation.workers == 0 {
            return invalid("validation pool needs at least one worker");
        }
        if self.dispatch.workers == 0 {
            return invalid("dispatch pool needs at least one worker");
        }
        if self.validation.probe_timeout.is_zero() {
            return invalid("probe timeout must be positive");
        }
        if self.dispatch.dispatch_timeout.is_zero() {
            return invalid("dispatch timeout must be positive");
        }
        if self.dispatch.acquire_timeout.is_zero() {
            return invalid("acquire timeout must be positive");
        }
        if self.poll_interval.is_zero() || self.progress_interval.is_zero() {
            return invalid("poll and progress intervals must be positive");
        }
        Ok(())
    }
}

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub snapshot: ProgressSnapshot,
    /// Shutdown was requested before every item finished
    pub interrupted: bool,
    pub elapsed: Duration,
}

/// Drives one run from proxy fetching to the final tally
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<ProxyRegistry>,
    source: Arc<ProxySource>,
    probe: Arc<dyn Probe>,
    dispatcher: Arc<dyn Dispatcher>,
    sink: Arc<dyn ProgressSink>,
}

struct RunState {
    board: Arc<WorkBoard>,
    stats: Arc<ValidationStats>,
    started_at: Instant,
    /// Last instant the registry held a fetched, validating or valid proxy
    last_supplied_at: Instant,
    stalled: bool,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ProxyRegistry>,
        source: Arc<ProxySource>,
        probe: Arc<dyn Probe>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            probe,
            dispatcher,
            sink: Arc::new(TracingProgress),
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    /// Run until every item is done or `cancel` stops the run.
    ///
    /// Configuration errors are returned before any worker starts. A worker
    /// reporting a registry invariant violation aborts the whole run.
    #[instrument(skip_all, fields(items = work.len()))]
    pub async fn run(&self, work: Vec<WorkItem>, cancel: CancellationToken) -> Result<RunReport> {
        self.config.validate()?;

        let board = Arc::new(WorkBoard::new(work, self.config.max_failures_per_item));
        let validation = Arc::new(ValidationPool::new(
            self.registry.clone(),
            self.probe.clone(),
            self.config.validation,
        ));
        let started_at = Instant::now();
        let mut state = RunState {
            board: board.clone(),
            stats: validation.stats(),
            started_at,
            last_supplied_at: started_at,
            stalled: false,
        };

        if board.is_done() {
            info!("Nothing to dispatch");
            return Ok(self.finish(&mut state, false));
        }

        // Pools observe this controller; the caller's token is forwarded into it.
        let controller = CancellationController::new();
        let token = controller.token();

        let mut background: JoinSet<Result<()>> = JoinSet::new();
        background.spawn(poll_source(
            self.source.clone(),
            self.registry.clone(),
            self.config.low_water_mark,
            self.config.poll_interval,
            token.clone(),
        ));
        background.spawn(validation.run(token.clone()));

        let dispatch = Arc::new(DispatchPool::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            board.clone(),
            self.config.dispatch,
        ));
        let mut dispatch_task = tokio::spawn(dispatch.run(token.clone()));

        let mut ticker = interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut external = cancel.clone();
        let mut interrupted = cancel.is_stopping();
        controller.escalate_to(cancel.stage());

        let outcome: Result<()> = loop {
            tokio::select! {
                joined = &mut dispatch_task => break flatten(joined),
                Some(joined) = background.join_next() => match flatten(joined) {
                    Err(e) if e.is_fatal() => break Err(e),
                    Err(e) => warn!(error = %e, "Background task stopped"),
                    Ok(()) => {}
                },
                stage = external.changed() => {
                    interrupted = true;
                    forward_stage(&controller, stage);
                }
                _ = ticker.tick() => {
                    let snapshot = self.snapshot(&mut state);
                    self.sink.report(&snapshot);
                }
            }
        };

        if let Err(e) = outcome {
            controller.abort();
            dispatch_task.abort();
            background.shutdown().await;
            return Err(e);
        }

        if !interrupted {
            // All items done: abandon probes still running.
            controller.abort();
        }
        controller.request_graceful();

        loop {
            tokio::select! {
                joined = background.join_next() => match joined {
                    Some(joined) => flatten(joined)?,
                    None => break,
                },
                stage = external.changed() => forward_stage(&controller, stage),
            }
        }

        let report = self.finish(&mut state, interrupted && !board.is_done());
        Ok(report)
    }

    fn snapshot(&self, state: &mut RunState) -> ProgressSnapshot {
        let proxies = self.registry.snapshot_counts();
        let now = Instant::now();

        if proxies.supply() > 0 {
            state.last_supplied_at = now;
            if state.stalled {
                info!("Proxy supply recovered");
            }
            state.stalled = false;
        } else if !state.stalled
            && now.duration_since(state.last_supplied_at) >= self.config.stall_after
        {
            state.stalled = true;
            warn!(
                cooldown = proxies.cooldown,
                dead = proxies.dead,
                "No usable proxies for {}s, still polling feeds",
                self.config.stall_after.as_secs()
            );
        }

        let items = state.board.snapshot();
        ProgressSnapshot {
            completed: items.iter().map(|item| item.completed()).sum(),
            target: items.iter().map(|item| item.target).sum(),
            items,
            proxies,
            checked: state.stats.checked(),
            validated: state.stats.validated(),
            stalled: state.stalled,
            elapsed_ms: now.duration_since(state.started_at).as_millis() as u64,
        }
    }

    fn finish(&self, state: &mut RunState, interrupted: bool) -> RunReport {
        let snapshot = self.snapshot(state);
        self.sink.report(&snapshot);
        let elapsed = state.started_at.elapsed();

        info!(
            completed = snapshot.completed,
            target = snapshot.target,
            interrupted,
            elapsed_secs = elapsed.as_secs(),
            "Run finished"
        );
        RunReport {
            snapshot,
            interrupted,
            elapsed,
        }
    }
}

fn forward_stage(controller: &CancellationController, stage: ShutdownStage) {
    match controller.escalate_to(stage) {
        ShutdownStage::Graceful => info!("Graceful shutdown, letting in-flight requests finish"),
        ShutdownStage::Hard => warn!("Hard shutdown, abandoning in-flight requests"),
        ShutdownStage::Running => {}
    }
}

/// Collapse a task's join result, treating an aborted task as finished.
fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Refill at startup, then on every interval while supply is low.
#[instrument(skip_all)]
async fn poll_source(
    source: Arc<ProxySource>,
    registry: Arc<ProxyRegistry>,
    low_water_mark: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut first = true;
    loop {
        if first || registry.supply() < low_water_mark {
            tokio::select! {
                added = source.refill(&registry) => debug!(added, "Registry refilled"),
                _ = cancel.stopping() => break,
            }
        }
        first = false;

        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = cancel.stopping() => break,
        }
    }
    debug!("Source poller exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;
    use crate::models::ProxyAddress;
    use crate::progress::WatchProgress;
    use crate::proxy::probe::ProbeOutcome;
    use crate::proxy::registry::RegistryConfig;
    use crate::proxy::source::{ProxyFeed, StaticFeed};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    struct PassingProbe;

    #[async_trait]
    impl Probe for PassingProbe {
        async fn probe(&self, _address: &ProxyAddress, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::Passed {
                latency: Duration::from_millis(10),
            }
        }

        fn name(&self) -> &'static str {
            "passing"
        }
    }

    /// Each dispatch waits for a permit from `gate` before succeeding
    struct GatedDispatcher {
        gate: Semaphore,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl GatedDispatcher {
        fn open() -> Arc<Self> {
            Self::with_permits(Semaphore::MAX_PERMITS)
        }

        fn with_permits(permits: usize) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(permits),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Dispatcher for GatedDispatcher {
        async fn dispatch(
            &self,
            _proxy: &ProxyAddress,
            _target_id: &str,
            _timeout: Duration,
        ) -> DispatchOutcome {
            self.started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            DispatchOutcome::Success {
                status: 200,
                latency: Duration::from_millis(10),
            }
        }
    }

    struct CountingFeed {
        lines: Vec<String>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ProxyFeed for CountingFeed {
        async fn fetch(&self) -> Result<Vec<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.lines.clone())
        }

        fn name(&self) -> String {
            "counting".to_string()
        }
    }

    fn proxies(count: u16) -> Vec<String> {
        (0..count).map(|n| format!("10.1.0.1:{}", 3000 + n)).collect()
    }

    fn config(validators: usize, workers: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            validation: ValidationConfig {
                workers: validators,
                probe_timeout: Duration::from_secs(3),
                idle_backoff: Duration::from_millis(100),
            },
            dispatch: DispatchConfig {
                workers,
                acquire_timeout: Duration::from_secs(5),
                dispatch_timeout: Duration::from_secs(60),
                idle_backoff: Duration::from_millis(50),
            },
            low_water_mark: 0,
            poll_interval: Duration::from_secs(60),
            progress_interval: Duration::from_secs(1),
            stall_after: Duration::from_secs(5),
            max_failures_per_item: None,
        }
    }

    fn coordinator(
        config: CoordinatorConfig,
        feed_lines: Vec<String>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Coordinator {
        let registry = Arc::new(ProxyRegistry::new(RegistryConfig {
            cooldown: Duration::from_secs(300),
            failure_threshold: 3,
        }));
        let source = Arc::new(ProxySource::new(vec![Arc::new(StaticFeed::new(feed_lines))]));
        Coordinator::new(config, registry, source, Arc::new(PassingProbe), dispatcher)
    }

    #[test]
    fn test_config_validation() {
        assert!(CoordinatorConfig::default().validate().is_ok());

        let mut config = CoordinatorConfig::default();
        config.dispatch.workers = 0;
        assert!(matches!(config.validate(), Err(BoostError::InvalidConfig(_))));

        let mut config = CoordinatorConfig::default();
        config.validation.probe_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_fetching() {
        let feed = Arc::new(CountingFeed {
            lines: proxies(1),
            fetches: AtomicUsize::new(0),
        });
        let coordinator = Coordinator::new(
            config(0, 1),
            Arc::new(ProxyRegistry::default()),
            Arc::new(ProxySource::new(vec![feed.clone()])),
            Arc::new(PassingProbe),
            GatedDispatcher::open(),
        );

        let controller = CancellationController::new();
        let err = coordinator
            .run(vec![WorkItem::new("BV1", 1)], controller.token())
            .await
            .unwrap_err();
        assert!(matches!(err, BoostError::InvalidConfig(_)));
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_proxy_completes_work_item() {
        let dispatcher = GatedDispatcher::open();
        let coordinator = coordinator(config(2, 2), proxies(1), dispatcher.clone());
        let controller = CancellationController::new();

        let report = coordinator
            .run(vec![WorkItem::new("BV1", 5)], controller.token())
            .await
            .unwrap();

        assert!(!report.interrupted);
        assert!(report.snapshot.is_complete());
        assert_eq!(report.snapshot.completed, 5);
        assert_eq!(report.snapshot.items[0].remaining, 0);
        assert_eq!(report.snapshot.items[0].surplus, 0);
        assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 5);
        // Five uses of the only proxy are four cooldowns apart
        assert!(report.elapsed >= Duration::from_secs(4 * 300));
        assert_eq!(coordinator.registry().snapshot_counts().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_every_item_across_many_proxies() {
        let dispatcher = GatedDispatcher::open();
        let coordinator = coordinator(config(4, 8), proxies(20), dispatcher.clone());
        let controller = CancellationController::new();
        let work = vec![
            WorkItem::new("BV1", 7),
            WorkItem::new("BV2", 3),
            WorkItem::new("BV3", 0),
        ];

        let report = coordinator.run(work, controller.token()).await.unwrap();

        assert!(report.snapshot.is_complete());
        assert_eq!(report.snapshot.completed, 10);
        assert_eq!(report.snapshot.target, 10);
        assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 10);
        // Each proxy serves once within its cooldown
        assert!(report.snapshot.checked >= 10);
    }

    #[tokio::test]
    async fn test_graceful_cancel_drains_inflight_dispatches() {
        let dispatcher = GatedDispatcher::with_permits(0);
        let coordinator = Arc::new(coordinator(config(2, 2), proxies(4), dispatcher.clone()));
        let controller = CancellationController::new();

        let run = {
            let coordinator = coordinator.clone();
            let token = controller.token();
            let work = vec![WorkItem::new("BV1", 10)];
            tokio::spawn(async move { coordinator.run(work, token).await })
        };

        while dispatcher.started.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.request();

        // Graceful stop must not cut the two requests short
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());
        assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 0);

        dispatcher.gate.add_permits(2);
        let report = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(dispatcher.started.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 2);
        assert_eq!(report.snapshot.completed, 2);
        assert!(report.snapshot.completed <= report.snapshot.target);
        assert_eq!(coordinator.registry().snapshot_counts().in_use, 0);
    }

    #[tokio::test]
    async fn test_hard_cancel_abandons_inflight_dispatches() {
        let dispatcher = GatedDispatcher::with_permits(0);
        let coordinator = Arc::new(coordinator(config(2, 2), proxies(4), dispatcher.clone()));
        let controller = CancellationController::new();

        let run = {
            let coordinator = coordinator.clone();
            let token = controller.token();
            let work = vec![WorkItem::new("BV1", 10)];
            tokio::spawn(async move { coordinator.run(work, token).await })
        };

        while dispatcher.started.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.request();
        controller.request();

        let report = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 0);
        assert_eq!(report.snapshot.items[0].remaining, 10);
        let counts = coordinator.registry().snapshot_counts();
        assert_eq!(counts.in_use, 0);
        assert_eq!(counts.dead, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_is_reported_as_stalled() {
        let (sink, progress) = WatchProgress::new();
        let coordinator = coordinator(config(1, 1), Vec::new(), GatedDispatcher::open())
            .with_progress(Arc::new(sink));
        let controller = CancellationController::new();

        let run = {
            let token = controller.token();
            tokio::spawn(async move { coordinator.run(vec![WorkItem::new("BV1", 1)], token).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(progress.borrow().stalled);
        assert_eq!(progress.borrow().completed, 0);

        controller.request();
        let report = run.await.unwrap().unwrap();
        assert!(report.interrupted);
        assert_eq!(report.snapshot.completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_stuck_in_cooldown_is_reported_as_stalled() {
        let (sink, progress) = WatchProgress::new();
        let coordinator = coordinator(config(1, 1), proxies(1), GatedDispatcher::open())
            .with_progress(Arc::new(sink));
        let controller = CancellationController::new();

        let run = {
            let token = controller.token();
            let work = vec![WorkItem::new("BV1", 10)];
            tokio::spawn(async move { coordinator.run(work, token).await })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        {
            let snapshot = progress.borrow();
            assert_eq!(snapshot.completed, 1);
            assert_eq!(snapshot.proxies.cooldown, 1);
            assert_eq!(snapshot.proxies.supply(), 0);
            assert!(snapshot.stalled);
        }

        controller.request();
        let report = run.await.unwrap().unwrap();
        assert!(report.interrupted);
        assert_eq!(report.snapshot.completed, 1);
    }

    #[tokio::test]
    async fn test_registry_error_aborts_run() {
        let registry = Arc::new(ProxyRegistry::new(RegistryConfig {
            cooldown: Duration::from_secs(u64::MAX),
            failure_threshold: 3,
        }));
        let dispatcher = GatedDispatcher::open();
        let coordinator = Coordinator::new(
            config(1, 1),
            registry,
            Arc::new(ProxySource::new(vec![Arc::new(StaticFeed::new(proxies(1)))])),
            Arc::new(PassingProbe),
            dispatcher.clone(),
        );
        let controller = CancellationController::new();

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            coordinator.run(vec![WorkItem::new("BV1", 3)], controller.token()),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_supply_triggers_feed_polls() {
        let feed = Arc::new(CountingFeed {
            lines: Vec::new(),
            fetches: AtomicUsize::new(0),
        });
        let mut config = config(1, 1);
        config.low_water_mark = 10;
        let coordinator = Coordinator::new(
            config,
            Arc::new(ProxyRegistry::default()),
            Arc::new(ProxySource::new(vec![feed.clone()])),
            Arc::new(PassingProbe),
            GatedDispatcher::open(),
        );
        let controller = CancellationController::new();

        let run = {
            let token = controller.token();
            tokio::spawn(async move { coordinator.run(vec![WorkItem::new("BV1", 1)], token).await })
        };

        // Startup fetch plus one per elapsed interval
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 3);

        controller.request();
        run.await.unwrap().unwrap();
    }
}
