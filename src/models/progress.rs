use serde::{Deserialize, Serialize};

use super::StateCounts;

/// Progress of a single work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub target_id: String,
    pub target: u64,
    pub remaining: u64,
    pub hits: u64,
    pub failures: u64,
    /// Successes that landed after `remaining` already reached zero
    pub surplus: u64,
    pub abandoned: bool,
    /// Time from run start to completion, once complete
    pub elapsed_ms: Option<u64>,
}

impl ItemProgress {
    pub fn completed(&self) -> u64 {
        self.target - self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0 || self.abandoned
    }
}

/// Snapshot pushed to progress observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub target: u64,
    pub items: Vec<ItemProgress>,
    pub proxies: StateCounts,
    pub checked: u64,
    pub validated: u64,
    pub stalled: bool,
    pub elapsed_ms: u64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(ItemProgress::is_done)
    }

    /// Share of probed proxies that passed validation, in percent.
    pub fn validation_rate(&self) -> f64 {
        if self.checked == 0 {
            0.0
        } else {
            (self.validated as f64 / self.checked as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(target: u64, remaining: u64) -> ItemProgress {
        ItemProgress {
            target_id: "BV1".to_string(),
            target,
            remaining,
            hits: target - remaining,
            failures: 0,
            surplus: 0,
            abandoned: false,
            elapsed_ms: None,
        }
    }

    #[test]
    fn test_snapshot_completion() {
        let mut snapshot = ProgressSnapshot {
            items: vec![item(5, 0), item(5, 2)],
            ..Default::default()
        };
        assert!(!snapshot.is_complete());
        assert_eq!(snapshot.items[1].completed(), 3);

        snapshot.items[1].abandoned = true;
        assert!(snapshot.is_complete());
    }

    #[test]
    fn test_validation_rate() {
        let mut snapshot = ProgressSnapshot::default();
        assert_eq!(snapshot.validation_rate(), 0.0);

        snapshot.checked = 8;
        snapshot.validated = 2;
        assert!((snapshot.validation_rate() - 25.0).abs() < 1e-9);
    }
}
