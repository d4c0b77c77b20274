//! Dispatch pool
//!
//! Fixed set of workers. Each iteration reserves a unit of work, leases a
//! valid proxy, sends one request through it and settles both.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::dispatch::board::WorkBoard;
use crate::dispatch::client::{DispatchOutcome, Dispatcher};
use crate::error::{BoostError, Result};
use crate::models::ReleaseOutcome;
use crate::proxy::registry::ProxyRegistry;
use crate::shutdown::CancellationToken;

/// Dispatch pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Longest wait for an eligible proxy per iteration
    pub acquire_timeout: Duration,
    pub dispatch_timeout: Duration,
    /// Pause when every item is fully reserved
    pub idle_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            acquire_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(3),
            idle_backoff: Duration::from_millis(200),
        }
    }
}

/// What a single worker iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStep {
    /// Nothing left to reserve
    Idle,
    /// No proxy became eligible in time
    NoProxy,
    Succeeded,
    Failed,
    /// Shutdown interrupted the iteration
    Stopped,
}

pub struct DispatchPool {
    registry: Arc<ProxyRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    board: Arc<WorkBoard>,
    config: DispatchConfig,
}

impl DispatchPool {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        board: Arc<WorkBoard>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            board,
            config,
        }
    }

    pub fn board(&self) -> &Arc<WorkBoard> {
        &self.board
    }

    /// Run every worker until the board is done or shutdown.
    #[instrument(
        skip_all,
        fields(workers = self.config.workers, dispatcher = self.dispatcher.name())
    )]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Starting {} dispatch workers", self.config.workers);

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

        info!("Dispatch workers stopped");
        Ok(())
    }

    async fn worker(&self, worker_id: usize, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_stopping() || self.board.is_done() {
                break;
            }

            let step = match self.dispatch_next(&cancel).await {
                Ok(step) => step,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(worker_id, error = %e, "Dispatch iteration failed");
                    DispatchStep::Idle
                }
            };

            match step {
                DispatchStep::Stopped => break,
                DispatchStep::Idle => {
                    tokio::select! {
                        _ = sleep(self.config.idle_backoff) => {}
                        _ = cancel.stopping() => break,
                    }
                }
                DispatchStep::NoProxy | DispatchStep::Succeeded | DispatchStep::Failed => {}
            }
        }

        debug!(worker_id, "Dispatch worker exiting");
        Ok(())
    }

    /// Reserve work, lease a proxy and dispatch once.
    ///
    /// Transient acquire errors come back as [`DispatchStep::NoProxy`];
    /// everything else, registry invariant violations included, is returned.
    pub async fn dispatch_next(&self, cancel: &CancellationToken) -> Result<DispatchStep> {
        let Some(reservation) = self.board.reserve() else {
            return Ok(DispatchStep::Idle);
        };

        let lease = match self
            .registry
            .acquire_valid(self.config.acquire_timeout, cancel)
            .await
        {
            Ok(lease) => lease,
            Err(BoostError::Cancelled) => return Ok(DispatchStep::Stopped),
            Err(e) if e.is_transient() => return Ok(DispatchStep::NoProxy),
            Err(e) => return Err(e),
        };

        let address = lease.address().clone();
        let target_id = reservation.target_id().to_string();
        let limit = self.config.dispatch_timeout;
        let request = self.dispatcher.dispatch(&address, &target_id, limit);

        // Graceful shutdown lets this request finish; only a hard abort cuts it.
        let outcome = tokio::select! {
            _ = cancel.aborted() => None,
            result = timeout(limit, request) => Some(result.unwrap_or(DispatchOutcome::TimedOut)),
        };

        match outcome {
            None => {
                self.registry.release(lease, ReleaseOutcome::Abandoned)?;
                Ok(DispatchStep::Stopped)
            }
            Some(outcome) if outcome.is_success() => {
                debug!(proxy = %address, %target_id, "Dispatch succeeded");
                reservation.succeed();
                self.registry.release(lease, ReleaseOutcome::Success)?;
                Ok(DispatchStep::Succeeded)
            }
            Some(outcome) => {
                debug!(proxy = %address, %target_id, ?outcome, "Dispatch failed");
                reservation.fail();
                self.registry.release(lease, ReleaseOutcome::Failure)?;
                Ok(DispatchStep::Failed)
            }
        }
    }
}
