//! Proxy registry
//!
//! Single owner of proxy state. Every transition goes through one mutex so two
//! workers can never both move the same proxy to `InUse`. Valid and cooling
//! proxies sit in one schedule ordered by the instant they became (or become)
//! eligible, which gives both exact cooldown enforcement and the
//! earliest-eligible-first tie-break.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::{BoostError, Result};
use crate::models::{ProxyAddress, ProxyId, ProxyState, ReleaseOutcome, StateCounts};
use crate::shutdown::CancellationToken;

/// Registry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Idle time enforced after every release
    pub cooldown: Duration,
    /// A proxy dies once its consecutive failures exceed this
    pub failure_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

/// Exclusive hold on a proxy, handed out by the registry
///
/// Not clonable; consumed by `release`, `record_validation_result` or
/// `requeue_candidate`.
#[derive(Debug)]
pub struct ProxyLease {
    id: ProxyId,
    address: Arc<ProxyAddress>,
}

impl ProxyLease {
    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }
}

/// Read-only view of one registry entry
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxyView {
    pub id: ProxyId,
    pub address: ProxyAddress,
    pub state: ProxyState,
    pub failure_count: u32,
    pub last_released_at: Option<Instant>,
}

struct ProxyEntry {
    address: Arc<ProxyAddress>,
    state: ProxyState,
    failure_count: u32,
    last_released_at: Option<Instant>,
    /// Set while the entry is in the schedule (Valid or Cooldown)
    eligible_at: Option<Instant>,
}

impl ProxyEntry {
    /// State as seen at `now`: an elapsed cooldown reads as Valid.
    fn state_at(&self, now: Instant) -> ProxyState {
        match (self.state, self.eligible_at) {
            (ProxyState::Cooldown, Some(at)) if at <= now => ProxyState::Valid,
            (state, _) => state,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<ProxyId, ProxyEntry>,
    by_address: HashMap<Arc<ProxyAddress>, ProxyId>,
    candidates: VecDeque<ProxyId>,
    schedule: BTreeSet<(Instant, ProxyId)>,
}

impl RegistryInner {
    fn entry_in(
        &mut self,
        id: ProxyId,
        expected: ProxyState,
        operation: &'static str,
    ) -> Result<&mut ProxyEntry> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(BoostError::ProxyNotFound { id })?;
        if entry.state != expected {
            return Err(BoostError::InvalidTransition {
                id,
                state: entry.state,
                operation,
            });
        }
        Ok(entry)
    }

    fn take_eligible(&mut self, now: Instant) -> Result<Option<ProxyLease>> {
        let Some(&(at, id)) = self.schedule.first() else {
            return Ok(None);
        };
        if at > now {
            return Ok(None);
        }
        self.schedule.remove(&(at, id));

        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(BoostError::ProxyNotFound { id })?;
        if !matches!(entry.state, ProxyState::Valid | ProxyState::Cooldown) {
            return Err(BoostError::InvalidTransition {
                id,
                state: entry.state,
                operation: "acquire",
            });
        }

        entry.state = ProxyState::InUse;
        entry.eligible_at = None;
        Ok(Some(ProxyLease {
            id,
            address: entry.address.clone(),
        }))
    }

    fn schedule(&mut self, id: ProxyId, at: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.eligible_at = Some(at);
            self.schedule.insert((at, id));
        }
    }
}

/// Thread-safe store of proxy state plus the cooldown schedule
pub struct ProxyRegistry {
    inner: Mutex<RegistryInner>,
    /// Woken whenever a proxy enters the schedule
    scheduled: Notify,
    config: RegistryConfig,
}

impl ProxyRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            scheduled: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert a new `Fetched` proxy unless the address is already known.
    ///
    /// Dead proxies stay registered, so a feed cannot resurrect them.
    pub fn enqueue_candidate(&self, address: ProxyAddress) -> bool {
        let mut inner = self.inner.lock();
        if inner.by_address.contains_key(&address) {
            return false;
        }

        inner.next_id += 1;
        let id = ProxyId(inner.next_id);
        let address = Arc::new(address);
        inner.by_address.insert(address.clone(), id);
        inner.entries.insert(
            id,
            ProxyEntry {
                address,
                state: ProxyState::Fetched,
                failure_count: 0,
                last_released_at: None,
                eligible_at: None,
            },
        );
        inner.candidates.push_back(id);
        true
    }

    /// Take the oldest `Fetched` proxy for probing. Never blocks.
    pub fn claim_for_validation(&self) -> Option<ProxyLease> {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.candidates.pop_front() {
            if let Some(entry) = inner.entries.get_mut(&id) {
                if entry.state == ProxyState::Fetched {
                    entry.state = ProxyState::Validating;
                    return Some(ProxyLease {
                        id,
                        address: entry.address.clone(),
                    });
                }
            }
        }
        None
    }

    /// Promote a probed proxy to `Valid` or retire it as `Dead`.
    pub fn record_validation_result(&self, lease: ProxyLease, passed: bool) -> Result<ProxyState> {
        let now = Instant::now();
        let state = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let entry = inner.entry_in(lease.id, ProxyState::Validating, "record validation for")?;

            if passed {
                entry.state = ProxyState::Valid;
                entry.failure_count = 0;
                inner.schedule(lease.id, now);
                ProxyState::Valid
            } else {
                entry.state = ProxyState::Dead;
                ProxyState::Dead
            }
        };

        debug!(proxy = %lease.address, %state, "Validation recorded");
        if passed {
            self.scheduled.notify_waiters();
        }
        Ok(state)
    }

    /// Hand an unfinished probe back to the candidate queue.
    pub fn requeue_candidate(&self, lease: ProxyLease) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_in(lease.id, ProxyState::Validating, "requeue")?;
        entry.state = ProxyState::Fetched;
        inner.candidates.push_front(lease.id);
        Ok(())
    }

    /// Lease the proxy that has been eligible the longest.
    ///
    /// Waits up to `timeout` for a cooldown to expire or a new proxy to be
    /// validated. Gives up early with `Cancelled` once shutdown starts.
    pub async fn acquire_valid(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProxyLease> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| out_of_range("acquire timeout", timeout))?;

        loop {
            if cancel.is_stopping() {
                return Err(BoostError::Cancelled);
            }

            let notified = self.scheduled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_at = {
                let mut inner = self.inner.lock();
                if let Some(lease) = inner.take_eligible(Instant::now())? {
                    return Ok(lease);
                }
                inner.schedule.first().map(|(at, _)| *at)
            };

            if Instant::now() >= deadline {
                return Err(BoostError::NoProxyAvailable);
            }
            let wake_at = next_at.map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
                _ = cancel.stopping() => return Err(BoostError::Cancelled),
            }
        }
    }

    /// Return a leased proxy. It cools down, or dies after too many failures.
    pub fn release(&self, lease: ProxyLease, outcome: ReleaseOutcome) -> Result<ProxyState> {
        let now = Instant::now();
        let cooldown = self.config.cooldown;
        let threshold = self.config.failure_threshold;

        let eligible_at = now
            .checked_add(cooldown)
            .ok_or_else(|| out_of_range("cooldown", cooldown))?;

        let (state, failures, previous) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let entry = inner.entry_in(lease.id, ProxyState::InUse, "release")?;

            let previous = entry.last_released_at.replace(now);
            match outcome {
                ReleaseOutcome::Success => entry.failure_count = 0,
                ReleaseOutcome::Failure => entry.failure_count += 1,
                ReleaseOutcome::Abandoned => {}
            }
            let failures = entry.failure_count;

            if outcome == ReleaseOutcome::Failure && failures > threshold {
                entry.state = ProxyState::Dead;
                (ProxyState::Dead, failures, previous)
            } else {
                entry.state = ProxyState::Cooldown;
                inner.schedule(lease.id, eligible_at);
                (ProxyState::Cooldown, failures, previous)
            }
        };

        match state {
            ProxyState::Dead => warn!(
                proxy = %lease.address,
                failures,
                "Proxy exceeded failure threshold, retiring"
            ),
            _ => {
                let rested_secs = previous.map(|at| now.duration_since(at).as_secs());
                debug!(proxy = %lease.address, ?outcome, rested_secs, "Proxy cooling down");
                self.scheduled.notify_waiters();
            }
        }
        Ok(state)
    }

    /// Per-state counts at this instant. Side-effect free.
    pub fn snapshot_counts(&self) -> StateCounts {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut counts = StateCounts::default();
        for entry in inner.entries.values() {
            counts.bump(entry.state_at(now));
        }
        counts
    }

    /// Proxies that are, or may soon become, ready without a cooldown:
    /// Fetched, Validating and Valid.
    pub fn supply(&self) -> usize {
        self.snapshot_counts().supply()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn out_of_range(what: &str, value: Duration) -> BoostError {
    BoostError::InvalidConfig(format!("{} of {}s is out of range", what, value.as_secs()))
}

#[cfg(test)]
impl ProxyRegistry {
    /// Take an eligible proxy without waiting.
    pub(crate) fn try_acquire(&self) -> Result<Option<ProxyLease>> {
        self.inner.lock().take_eligible(Instant::now())
    }

    pub(crate) fn get(&self, id: ProxyId) -> Option<ProxyView> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner.entries.get(&id).map(|entry| ProxyView {
            id,
            address: (*entry.address).clone(),
            state: entry.state_at(now),
            failure_count: entry.failure_count,
            last_released_at: entry.last_released_at,
        })
    }

    pub(crate) fn find(&self, address: &ProxyAddress) -> Option<ProxyView> {
        let id = *self.inner.lock().by_address.get(address)?;
        self.get(id)
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
