//! Registry of live task list managers
//!
//! The registry is the only structure shared by unrelated call paths. Every
//! mutation is a compare-and-swap on one map entry: creation installs a
//! manager only if the entry is vacant, and removal only succeeds while the
//! entry still holds the exact instance the caller saw.

use std::sync::Arc;

use dashmap::DashMap;

use crate::tasklist::TaskListManager;
use crate::types::TaskListId;

/// Concurrent map of task list identity to its manager
///
/// Constructed by the caller and handed to the engine, so tests can run
/// independent engines side by side.
#[derive(Debug, Default)]
pub struct TaskListRegistry {
    managers: DashMap<TaskListId, Arc<TaskListManager>>,
}

impl TaskListRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager for `id`, if one is registered
    pub fn get(&self, id: &TaskListId) -> Option<Arc<TaskListManager>> {
        self.managers.get(id).map(|m| Arc::clone(m.value()))
    }

    /// Manager for `id`, installing the one built by `create` if vacant
    ///
    /// Concurrent callers for the same identity all observe the same
    /// instance; `create` runs at most once per installed manager.
    pub fn get_or_create(
        &self,
        id: &TaskListId,
        create: impl FnOnce() -> Arc<TaskListManager>,
    ) -> Arc<TaskListManager> {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        let entry = self.managers.entry(id.clone()).or_insert_with(create);
        Arc::clone(entry.value())
    }

    /// Remove `manager` if it is still the registered instance
    pub fn remove_if_same(&self, id: &TaskListId, manager: &Arc<TaskListManager>) -> bool {
        self.managers
            .remove_if(id, |_, current| Arc::ptr_eq(current, manager))
            .is_some()
    }

    /// Unload and remove every manager idle for longer than its threshold
    ///
    /// Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for manager in self.snapshot() {
            let removed = self.managers.remove_if(manager.id(), |_, current| {
                Arc::ptr_eq(current, &manager) && current.try_mark_unloaded()
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// All registered managers
    pub fn snapshot(&self) -> Vec<Arc<TaskListManager>> {
        self.managers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Remove and return every manager
    pub fn drain(&self) -> Vec<Arc<TaskListManager>> {
        let ids: Vec<TaskListId> = self.managers.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.managers.remove(id).map(|(_, m)| m))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::metrics::NoopMetrics;
    use crate::persistence::InMemoryTaskStore;
    use crate::types::TaskListKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn id(name: &str) -> TaskListId {
        TaskListId::new("d", name, TaskListKind::Activity)
    }

    fn manager(id: TaskListId, config: MatchingConfig) -> Arc<TaskListManager> {
        TaskListManager::new(
            id,
            Arc::new(config),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(NoopMetrics),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_single_instance_per_identity() {
        let registry = TaskListRegistry::new();
        let created = AtomicUsize::new(0);
        let make = || {
            created.fetch_add(1, Ordering::SeqCst);
            manager(id("a"), MatchingConfig::default())
        };

        let first = registry.get_or_create(&id("a"), make);
        let second = registry.get_or_create(&id("a"), || manager(id("a"), MatchingConfig::default()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_creation_converges() {
        let registry = Arc::new(TaskListRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.get_or_create(&id("shared"), || {
                        manager(id("shared"), MatchingConfig::default())
                    })
                })
            })
            .collect();
        let managers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(managers.iter().all(|m| Arc::ptr_eq(m, &managers[0])));
    }

    #[test]
    fn test_stale_instance_is_not_removed() {
        let registry = TaskListRegistry::new();
        let old = registry.get_or_create(&id("a"), || manager(id("a"), MatchingConfig::default()));
        assert!(registry.remove_if_same(&id("a"), &old));

        let new = registry.get_or_create(&id("a"), || manager(id("a"), MatchingConfig::default()));
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!registry.remove_if_same(&id("a"), &old));
        assert!(registry.get(&id("a")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let registry = TaskListRegistry::new();
        let config = MatchingConfig::default().with_max_task_list_idle_time(Duration::from_secs(10));
        let m = registry.get_or_create(&id("a"), || manager(id("a"), config.clone()));
        assert_eq!(registry.evict_idle(), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
        assert!(m.is_stopped());
    }
}
