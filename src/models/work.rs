use serde::{Deserialize, Serialize};

/// One unit of repeated dispatch work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub target_id: String,
    pub remaining: u64,
}

impl WorkItem {
    pub fn new(target_id: impl Into<String>, remaining: u64) -> Self {
        Self {
            target_id: target_id.into(),
            remaining,
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Build one item per target, skipping blacklisted and duplicate ids.
    pub fn plan<I, S>(targets: I, increment: u64, blacklist: &[String]) -> Vec<WorkItem>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut items: Vec<WorkItem> = Vec::new();
        for target in targets {
            let target = target.as_ref().trim();
            if target.is_empty()
                || blacklist.iter().any(|b| b == target)
                || items.iter().any(|i| i.target_id == target)
            {
                continue;
            }
            items.push(WorkItem::new(target, increment));
        }
        items
    }
}
