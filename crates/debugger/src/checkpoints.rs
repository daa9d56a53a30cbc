use std::collections::BTreeMap;

use crate::types::{CheckpointId, Mark, TaskUid};

/// A saved timeline position and the thread last resumed there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub mark: Mark,
    pub last_continue_tuid: TaskUid,
}

/// Named checkpoints plus the restart checkpoint
///
/// The registry only tracks handles. Taking and releasing the timeline's
/// reference on each mark is the caller's job, since the registry never
/// sees the timeline.
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
    restart: Option<Checkpoint>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest handle above every live one
    pub fn next_id(&self) -> CheckpointId {
        self.checkpoints
            .keys()
            .next_back()
            .map_or(1, |last| last.saturating_add(1))
    }

    /// Store `checkpoint` under `id`, returning the checkpoint it replaced
    pub fn insert(&mut self, id: CheckpointId, checkpoint: Checkpoint) -> Option<Checkpoint> {
        self.checkpoints.insert(id, checkpoint)
    }

    pub fn get(&self, id: CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.get(&id)
    }

    pub fn remove(&mut self, id: CheckpointId) -> Option<Checkpoint> {
        self.checkpoints.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CheckpointId, &Checkpoint)> {
        self.checkpoints.iter().map(|(id, cp)| (*id, cp))
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn restart_checkpoint(&self) -> Option<&Checkpoint> {
        self.restart.as_ref()
    }

    /// Install a new restart checkpoint, returning the previous one
    pub fn replace_restart(&mut self, checkpoint: Checkpoint) -> Option<Checkpoint> {
        self.restart.replace(checkpoint)
    }

    /// Remove every checkpoint, restart checkpoint included
    pub fn drain(&mut self) -> Vec<Checkpoint> {
        let mut all: Vec<_> = std::mem::take(&mut self.checkpoints).into_values().collect();
        all.extend(self.restart.take());
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(event: u64) -> Checkpoint {
        Checkpoint {
            mark: Mark::new(event, 0),
            last_continue_tuid: TaskUid { tid: 1, serial: 0 },
        }
    }

    #[test]
    fn handles_are_allocated_above_live_ones() {
        let mut registry = CheckpointRegistry::new();
        assert_eq!(registry.next_id(), 1);
        registry.insert(1, checkpoint(10));
        registry.insert(5, checkpoint(20));
        assert_eq!(registry.next_id(), 6);
        registry.remove(5);
        assert_eq!(registry.next_id(), 2);
    }

    #[test]
    fn insert_reports_replaced_checkpoint() {
        let mut registry = CheckpointRegistry::new();
        assert_eq!(registry.insert(1, checkpoint(10)), None);
        assert_eq!(registry.insert(1, checkpoint(11)), Some(checkpoint(10)));
        assert_eq!(registry.get(1), Some(&checkpoint(11)));
    }

    #[test]
    fn drain_includes_restart_checkpoint() {
        let mut registry = CheckpointRegistry::new();
        registry.insert(1, checkpoint(10));
        assert_eq!(registry.replace_restart(checkpoint(3)), None);
        assert_eq!(registry.replace_restart(checkpoint(4)), Some(checkpoint(3)));
        let drained = registry.drain();
        assert_eq!(drained, vec![checkpoint(10), checkpoint(4)]);
        assert!(registry.is_empty());
        assert!(registry.restart_checkpoint().is_none());
    }
}
