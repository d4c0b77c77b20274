//! Two-stage cancellation
//!
//! The first request asks every pool to drain gracefully; the second aborts
//! in-flight work. Workers hold a [`CancellationToken`] and check it at the top
//! of each iteration and at every suspension point.

use std::fmt;

use tokio::sync::watch;
use tracing::{error, warn};

/// Shutdown stage, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ShutdownStage {
    #[default]
    Running,
    /// Stop admitting new iterations, let in-flight operations finish
    Graceful,
    /// Abandon in-flight operations
    Hard,
}

impl ShutdownStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownStage::Running => "running",
            ShutdownStage::Graceful => "graceful",
            ShutdownStage::Hard => "hard",
        }
    }
}

impl fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Owner side of the shutdown signal
pub struct CancellationController {
    stage_tx: watch::Sender<ShutdownStage>,
}

impl CancellationController {
    pub fn new() -> Self {
        let (stage_tx, _) = watch::channel(ShutdownStage::Running);
        Self { stage_tx }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            stage_rx: self.stage_tx.subscribe(),
        }
    }

    pub fn stage(&self) -> ShutdownStage {
        *self.stage_tx.borrow()
    }

    /// Escalate by one stage and return the stage now in effect.
    ///
    /// Running becomes Graceful, Graceful becomes Hard; Hard stays Hard.
    pub fn request(&self) -> ShutdownStage {
        let mut current = ShutdownStage::Running;
        self.stage_tx.send_modify(|stage| {
            *stage = match *stage {
                ShutdownStage::Running => ShutdownStage::Graceful,
                ShutdownStage::Graceful | ShutdownStage::Hard => ShutdownStage::Hard,
            };
            current = *stage;
        });
        current
    }

    /// Raise the stage to at least `target`. Never lowers it.
    pub fn escalate_to(&self, target: ShutdownStage) -> ShutdownStage {
        let mut current = target;
        self.stage_tx.send_modify(|stage| {
            if *stage < target {
                *stage = target;
            }
            current = *stage;
        });
        current
    }

    pub fn request_graceful(&self) -> ShutdownStage {
        self.escalate_to(ShutdownStage::Graceful)
    }

    pub fn abort(&self) -> ShutdownStage {
        self.escalate_to(ShutdownStage::Hard)
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the shutdown signal
#[derive(Clone)]
pub struct CancellationToken {
    stage_rx: watch::Receiver<ShutdownStage>,
}

impl CancellationToken {
    pub fn stage(&self) -> ShutdownStage {
        *self.stage_rx.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.stage() >= ShutdownStage::Graceful
    }

    pub fn is_aborted(&self) -> bool {
        self.stage() >= ShutdownStage::Hard
    }

    /// Resolves once any shutdown was requested.
    pub async fn stopping(&self) {
        self.reached(ShutdownStage::Graceful).await
    }

    /// Resolves once a hard abort was requested.
    pub async fn aborted(&self) {
        self.reached(ShutdownStage::Hard).await
    }

    /// Resolves with each new stage as it comes into effect.
    pub async fn changed(&mut self) -> ShutdownStage {
        if self.stage_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.stage_rx.borrow_and_update()
    }

    async fn reached(&self, stage: ShutdownStage) {
        let mut rx = self.stage_rx.clone();
        if rx.wait_for(|current| *current >= stage).await.is_err() {
            // Controller dropped before reaching the stage: it never will.
            std::future::pending::<()>().await;
        }
    }
}

/// Feed process signals (Ctrl+C, SIGTERM) into the controller until a hard abort.
pub async fn forward_signals(controller: &CancellationController) {
    loop {
        wait_for_signal().await;
        match controller.request() {
            ShutdownStage::Graceful => {
                warn!(
                    "Shutdown requested, finishing in-flight requests. \
                     Press Ctrl+C again to force quit"
                );
            }
            _ => {
                error!("Force quit requested, abandoning in-flight requests");
                return;
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
