//! Work board
//!
//! Tallies every work item behind one mutex. A dispatch worker reserves a unit
//! of an item before it acquires a proxy, so no item ever has more requests in
//! flight than it still needs.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::{ItemProgress, WorkItem};

struct ItemSlot {
    target_id: Arc<str>,
    target: u64,
    remaining: u64,
    hits: u64,
    failures: u64,
    surplus: u64,
    in_flight: u64,
    abandoned: bool,
    finished_at: Option<Instant>,
}

impl ItemSlot {
    fn is_done(&self) -> bool {
        self.remaining == 0 || self.abandoned
    }

    fn is_reservable(&self) -> bool {
        !self.is_done() && self.in_flight < self.remaining
    }
}

struct BoardInner {
    items: Vec<ItemSlot>,
    /// Next item to consider for round-robin reservation
    cursor: usize,
}

/// Shared tally of all work items
pub struct WorkBoard {
    inner: Mutex<BoardInner>,
    /// Failed dispatches tolerated per item; `None` retries forever
    max_failures: Option<u64>,
    started_at: Instant,
}

impl WorkBoard {
    pub fn new(items: Vec<WorkItem>, max_failures: Option<u64>) -> Self {
        let now = Instant::now();
        let items = items
            .into_iter()
            .map(|item| ItemSlot {
                target_id: Arc::from(item.target_id),
                target: item.remaining,
                remaining: item.remaining,
                hits: 0,
                failures: 0,
                surplus: 0,
                in_flight: 0,
                abandoned: false,
                finished_at: (item.remaining == 0).then_some(now),
            })
            .collect();

        Self {
            inner: Mutex::new(BoardInner { items, cursor: 0 }),
            max_failures: max_failures.filter(|max| *max > 0),
            started_at: now,
        }
    }

    /// Reserve one unit of the next item that still needs work, round-robin.
    pub fn reserve(&self) -> Option<Reservation<'_>> {
        let mut inner = self.inner.lock();
        let len = inner.items.len();
        for offset in 0..len {
            let index = (inner.cursor + offset) % len;
            let slot = &mut inner.items[index];
            if slot.is_reservable() {
                slot.in_flight += 1;
                let target_id = slot.target_id.clone();
                inner.cursor = (index + 1) % len;
                return Some(Reservation {
                    board: self,
                    index,
                    target_id,
                    settled: false,
                });
            }
        }
        None
    }

    /// True once every item reached zero or was abandoned.
    pub fn is_done(&self) -> bool {
        self.inner.lock().items.iter().all(ItemSlot::is_done)
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.lock().items.iter().map(|slot| slot.in_flight).sum()
    }

    pub fn snapshot(&self) -> Vec<ItemProgress> {
        let inner = self.inner.lock();
        inner
            .items
            .iter()
            .map(|slot| ItemProgress {
                target_id: slot.target_id.to_string(),
                target: slot.target,
                remaining: slot.remaining,
                hits: slot.hits,
                failures: slot.failures,
                surplus: slot.surplus,
                abandoned: slot.abandoned,
                elapsed_ms: slot
                    .finished_at
                    .map(|at| at.duration_since(self.started_at).as_millis() as u64),
            })
            .collect()
    }

    fn settle(&self, index: usize, success: bool) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.items.get_mut(index) else {
            return;
        };
        slot.in_flight = slot.in_flight.saturating_sub(1);

        if success {
            if slot.remaining == 0 {
                slot.surplus += 1;
                return;
            }
            slot.remaining -= 1;
            slot.hits += 1;
            if slot.remaining == 0 {
                slot.finished_at = Some(Instant::now());
                info!(target_id = %slot.target_id, hits = slot.hits, "Work item complete");
            }
            return;
        }

        slot.failures += 1;
        if let Some(max) = self.max_failures {
            if !slot.abandoned && slot.remaining > 0 && slot.failures > max {
                slot.abandoned = true;
                slot.finished_at = Some(Instant::now());
                warn!(
                    target_id = %slot.target_id,
                    failures = slot.failures,
                    remaining = slot.remaining,
                    "Work item abandoned after too many failed dispatches"
                );
            }
        }
    }

    fn give_back(&self, index: usize) {
        if let Some(slot) = self.inner.lock().items.get_mut(index) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }
}

/// One reserved unit of a work item
///
/// Dropping it without settling returns the unit to the board untouched.
pub struct Reservation<'a> {
    board: &'a WorkBoard,
    index: usize,
    target_id: Arc<str>,
    settled: bool,
}

impl Reservation<'_> {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Count a successful dispatch against the item.
    pub fn succeed(mut self) {
        self.settled = true;
        self.board.settle(self.index, true);
    }

    /// Record a failed dispatch; `remaining` is unchanged.
    pub fn fail(mut self) {
        self.settled = true;
        self.board.settle(self.index, false);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.board.give_back(self.index);
        }
    }
}
