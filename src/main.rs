//! proxy-boost - Entry Point
//!
//! Plans the work items, runs the coordinator and maps Ctrl+C/SIGTERM to the
//! two-stage shutdown.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_boost::config::{Config, LogConfig};
use proxy_boost::coordinator::{Coordinator, RunReport};
use proxy_boost::models::WorkItem;
use proxy_boost::proxy::ProxyRegistry;
use proxy_boost::shutdown::{forward_signals, CancellationController};

/// Dispatch requests to targets through a rotating pool of public proxies
#[derive(Parser)]
#[command(name = "proxy-boost", version)]
#[command(about = "Dispatch requests to targets through a rotating pool of public proxies")]
struct Cli {
    /// One or more target ids
    #[arg(short, long, num_args = 1.., required = true)]
    targets: Vec<String>,

    /// Successful dispatches wanted per target
    #[arg(short = 'n', long)]
    increment: u64,

    /// Comma-separated target ids to skip
    #[arg(long, value_delimiter = ',')]
    blacklist: Vec<String>,

    /// Print the plan and exit
    #[arg(long)]
    dry_run: bool,

    /// Validation workers
    #[arg(long)]
    validators: Option<usize>,

    /// Dispatch workers
    #[arg(long)]
    workers: Option<usize>,

    /// Proxy cooldown in seconds
    #[arg(long)]
    cooldown: Option<u64>,

    /// Probe and dispatch timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Proxy list URL (replaces the configured URLs)
    #[arg(long)]
    proxy_url: Option<String>,

    /// Local proxy list
    #[arg(long)]
    proxy_file: Option<String>,

    /// Also use the dated proxy archive
    #[arg(long)]
    use_archive: bool,

    /// Dispatch URL template containing {target}
    #[arg(long)]
    dispatch_url: Option<String>,
}

impl Cli {
    /// CLI values take precedence over the environment.
    fn apply(&self, config: &mut Config) {
        if let Some(validators) = self.validators {
            config.pools.validators = validators;
        }
        if let Some(workers) = self.workers {
            config.pools.workers = workers;
        }
        if let Some(cooldown) = self.cooldown {
            config.proxy.cooldown = cooldown;
        }
        if let Some(timeout) = self.timeout {
            config.probe.timeout = timeout;
            config.dispatch.timeout = timeout;
        }
        if let Some(url) = &self.proxy_url {
            config.source.urls = vec![url.clone()];
        }
        if let Some(path) = &self.proxy_file {
            config.source.file = Some(path.clone());
        }
        if self.use_archive {
            config.source.use_archive = true;
        }
        if let Some(url) = &self.dispatch_url {
            config.dispatch.url = url.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);
    init_tracing(&config.log);

    if cli.increment == 0 {
        bail!("--increment must be greater than zero");
    }
    let work = WorkItem::plan(&cli.targets, cli.increment, &cli.blacklist);
    if work.is_empty() {
        warn!("No targets left after applying the blacklist, nothing to do");
        return Ok(());
    }

    if cli.dry_run {
        for item in &work {
            println!("{}\t{}", item.target_id, item.remaining);
        }
        return Ok(());
    }

    config.validate()?;
    info!(
        "Starting proxy-boost: {} targets, {} validators, {} workers, cooldown {}s",
        work.len(),
        config.pools.validators,
        config.pools.workers,
        config.proxy.cooldown
    );

    let registry = Arc::new(ProxyRegistry::new(config.registry_config()));
    let coordinator = Coordinator::new(
        config.coordinator_config(),
        registry,
        Arc::new(config.build_source()?),
        config.build_probe()?,
        Arc::new(config.build_dispatcher()?),
    );

    let controller = CancellationController::new();
    let token = controller.token();

    let run = coordinator.run(work, token);
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report,
        // Signals stop after a hard abort; the run winds down on its own.
        _ = forward_signals(&controller) => run.await,
    };

    match report {
        Ok(report) => {
            log_summary(&report);
            Ok(())
        }
        Err(e) => {
            error!("Run aborted: {}", e);
            Err(e.into())
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxy_boost={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn log_summary(report: &RunReport) {
    let snapshot = &report.snapshot;
    let status = if report.interrupted { "Interrupted" } else { "Complete" };

    info!(
        "{}: {}/{} in {}s, proxies checked {}, valid {}, validation rate {:.1}%",
        status,
        snapshot.completed,
        snapshot.target,
        report.elapsed.as_secs(),
        snapshot.checked,
        snapshot.validated,
        snapshot.validation_rate()
    );

    for item in &snapshot.items {
        let finished = item
            .elapsed_ms
            .map(|ms| format!(" in {}s", ms / 1000))
            .unwrap_or_default();
        if item.abandoned {
            warn!(
                "  {}: abandoned at {}/{} after {} failed dispatches",
                item.target_id,
                item.completed(),
                item.target,
                item.failures
            );
        } else {
            info!(
                "  {}: {}/{} (+{} surplus, {} failed){}",
                item.target_id,
                item.completed(),
                item.target,
                item.surplus,
                item.failures,
                finished
            );
        }
    }
}
