//! Read and ack cursors over the durable backlog

use std::collections::BTreeMap;

/// Tracks which backlog tasks have been read and which delivered
///
/// Every task read from the store is registered with [`add_task`] in
/// ascending ID order. The ack level only moves over a contiguous prefix of
/// delivered tasks, so it never passes a task that is still buffered or in
/// flight. `ack_level <= read_level` holds at all times.
///
/// [`add_task`]: AckManager::add_task
#[derive(Debug, Default)]
pub(crate) struct AckManager {
    /// Task ID -> delivered
    outstanding: BTreeMap<i64, bool>,
    read_level: i64,
    ack_level: i64,
}

impl AckManager {
    /// Start from the levels recorded by the store
    pub fn new(ack_level: i64) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            read_level: ack_level,
            ack_level,
        }
    }

    /// Register a task read from the store
    ///
    /// Returns false (and ignores the task) if it is not above the read level.
    pub fn add_task(&mut self, task_id: i64) -> bool {
        if task_id <= self.read_level {
            return false;
        }
        self.outstanding.insert(task_id, false);
        self.read_level = task_id;
        true
    }

    /// Mark a task delivered; returns the new ack level if it moved
    pub fn ack(&mut self, task_id: i64) -> Option<i64> {
        match self.outstanding.get_mut(&task_id) {
            Some(done) => *done = true,
            None => return None,
        }

        let before = self.ack_level;
        while let Some(entry) = self.outstanding.first_entry() {
            if !*entry.get() {
                break;
            }
            let (id, _) = entry.remove_entry();
            self.ack_level = id;
        }

        (self.ack_level > before).then_some(self.ack_level)
    }

    pub fn ack_level(&self) -> i64 {
        self.ack_level
    }

    pub fn read_level(&self) -> i64 {
        self.read_level
    }

    /// Tasks read but not yet delivered
    pub fn backlog_count_hint(&self) -> u64 {
        self.outstanding.values().filter(|done| !**done).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_advances_over_contiguous_prefix() {
        let mut ack = AckManager::new(10);
        for id in [11, 12, 13] {
            assert!(ack.add_task(id));
        }
        assert_eq!(ack.read_level(), 13);
        assert_eq!(ack.backlog_count_hint(), 3);

        assert_eq!(ack.ack(12), None);
        assert_eq!(ack.ack_level(), 10);

        assert_eq!(ack.ack(11), Some(12));
        assert_eq!(ack.ack(13), Some(13));
        assert_eq!(ack.backlog_count_hint(), 0);
    }

    #[test]
    fn test_stale_and_unknown_ids_are_ignored() {
        let mut ack = AckManager::new(5);
        assert!(!ack.add_task(5));
        assert!(!ack.add_task(3));
        assert_eq!(ack.ack(4), None);
        assert_eq!(ack.read_level(), 5);
    }

    #[test]
    fn test_ack_never_exceeds_read() {
        let mut ack = AckManager::new(0);
        let ids = [1, 2, 4, 7, 8];
        for id in ids {
            ack.add_task(id);
            assert!(ack.ack_level() <= ack.read_level());
        }
        for id in [8, 2, 7, 1, 4] {
            ack.ack(id);
            assert!(ack.ack_level() <= ack.read_level());
        }
        assert_eq!(ack.ack_level(), 8);
    }

    #[test]
    fn test_double_ack_is_noop() {
        let mut ack = AckManager::new(0);
        ack.add_task(1);
        assert_eq!(ack.ack(1), Some(1));
        assert_eq!(ack.ack(1), None);
    }
}
