//! Validation pool
//!
//! Fixed set of workers that claim `Fetched` proxies, probe them once and
//! record the verdict in the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::ProxyState;
use crate::proxy::probe::{Probe, ProbeOutcome};
use crate::proxy::registry::ProxyRegistry;
use crate::shutdown::CancellationToken;

/// Validation pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationConfig {
    pub workers: usize,
    pub probe_timeout: Duration,
    /// Pause after finding the candidate queue empty
    pub idle_backoff: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            workers: 75,
            probe_timeout: Duration::from_secs(3),
            idle_backoff: Duration::from_secs(1),
        }
    }
}

/// Running totals shared with the coordinator
#[derive(Debug, Default)]
pub struct ValidationStats {
    checked: AtomicU64,
    validated: AtomicU64,
}

impl ValidationStats {
    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::Relaxed)
    }

    pub fn validated(&self) -> u64 {
        self.validated.load(Ordering::Relaxed)
    }

    fn record(&self, passed: bool) {
        self.checked.fetch_add(1, Ordering::Relaxed);
        if passed {
            self.validated.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// What a single worker iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStep {
    /// Nothing to claim
    Idle,
    Recorded(ProxyState),
    /// Hard abort hit mid-probe; the candidate went back to the queue
    Requeued,
}

pub struct ValidationPool {
    registry: Arc<ProxyRegistry>,
    probe: Arc<dyn Probe>,
    config: ValidationConfig,
    stats: Arc<ValidationStats>,
}

impl ValidationPool {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        probe: Arc<dyn Probe>,
        config: ValidationConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            stats: Arc::new(ValidationStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ValidationStats> {
        self.stats.clone()
    }

    /// Run every worker until shutdown.
    ///
    /// Returns the first invariant violation reported by a worker, after
    /// aborting the rest.
    #[instrument(skip_all, fields(workers = self.config.workers, probe = self.probe.name()))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Starting {} validation workers", self.config.workers);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers {
            let pool = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { pool.worker(worker_id, cancel).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined? {
                workers.abort_all();
                return Err(e);
            }
        }

        info!(
            checked = self.stats.checked(),
            validated = self.stats.validated(),
            "Validation workers stopped"
        );
        Ok(())
    }

    async fn worker(&self, worker_id: usize, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_stopping() {
                break;
            }

            let step = match self.validate_next(&cancel).await {
                Ok(step) => step,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(worker_id, error = %e, "Validation iteration failed");
                    ValidationStep::Idle
                }
            };

            if step == ValidationStep::Idle {
                tokio::select! {
                    _ = sleep(self.config.idle_backoff) => {}
                    _ = cancel.stopping() => break,
                }
            }
        }

        debug!(worker_id, "Validation worker exiting");
        Ok(())
    }

    /// Claim one candidate, probe it and record the verdict.
    pub async fn validate_next(&self, cancel: &CancellationToken) -> Result<ValidationStep> {
        let Some(lease) = self.registry.claim_for_validation() else {
            return Ok(ValidationStep::Idle);
        };
        let address = lease.address().clone();
        let limit = self.config.probe_timeout;

        let outcome = tokio::select! {
            _ = cancel.aborted() => None,
            result = timeout(limit, self.probe.probe(&address, limit)) => {
                Some(result.unwrap_or(ProbeOutcome::TimedOut))
            }
        };

        let Some(outcome) = outcome else {
            self.registry.requeue_candidate(lease)?;
            return Ok(ValidationStep::Requeued);
        };

        let passed = outcome.is_passed();
        match &outcome {
            ProbeOutcome::Passed { latency } => {
                debug!(proxy = %address, latency_ms = latency.as_millis() as u64, "Proxy validated")
            }
            ProbeOutcome::Failed(reason) => {
                debug!(proxy = %address, %reason, "Proxy failed validation")
            }
            ProbeOutcome::TimedOut => debug!(proxy = %address, "Proxy validation timed out"),
        }

        let state = self.registry.record_validation_result(lease, passed)?;
        self.stats.record(passed);
        Ok(ValidationStep::Recorded(state))
    }
}
