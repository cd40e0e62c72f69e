use std::collections::{BTreeMap, HashSet};

use crate::events::EventId;

/// Dedupe window over dispatched event identities.
///
/// Live subscription and catch-up scans can observe the same block range
/// during a handover; an event already dispatched must not be published again.
/// Entries are kept until the checkpoint has passed them by more than
/// `window` blocks, so a scan retried from a halted checkpoint still sees
/// everything it already dispatched.
#[derive(Debug)]
pub(crate) struct SeenSet {
    window: u64,
    entries: HashSet<EventId>,
    by_block: BTreeMap<u64, Vec<EventId>>,
}

impl SeenSet {
    pub(crate) fn new(window: u64) -> Self {
        Self { window, entries: HashSet::new(), by_block: BTreeMap::new() }
    }

    pub(crate) fn contains(&self, id: &EventId) -> bool {
        self.entries.contains(id)
    }

    pub(crate) fn insert(&mut self, id: EventId) {
        self.by_block.entry(id.block).or_default().push(id.clone());
        self.entries.insert(id);
    }

    /// Drops entries more than `window` blocks behind the checkpoint.
    pub(crate) fn prune_behind(&mut self, checkpoint_block: u64) {
        let min_keep = checkpoint_block.saturating_sub(self.window);
        while let Some((&block, _)) = self.by_block.first_key_value() {
            if block >= min_keep {
                break;
            }
            if let Some(ids) = self.by_block.remove(&block) {
                for id in ids {
                    self.entries.remove(&id);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
