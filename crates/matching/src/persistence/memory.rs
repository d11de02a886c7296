//! In-memory implementation of TaskStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::*;
use crate::types::{PersistedTask, TaskInfo, TaskListId};

/// Internal task list state
#[derive(Default)]
struct TaskListState {
    range_id: i64,
    ack_level: i64,
    max_task_id: i64,
    tasks: BTreeMap<i64, TaskInfo>,
}

impl TaskListState {
    fn check_range(&self, task_list: &TaskListId, range_id: i64) -> Result<(), StoreError> {
        if range_id != self.range_id {
            return Err(StoreError::LeaseLost {
                task_list: task_list.to_string(),
                held: range_id,
                current: self.range_id,
            });
        }
        Ok(())
    }
}

/// In-memory implementation of TaskStore
///
/// This is primarily for testing. It keeps every task list in a map and
/// provides the same lease and ordering semantics a database store would.
/// Failures can be injected to exercise the retry paths.
///
/// # Example
///
/// ```
/// use everruns_matching::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.write_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    task_lists: RwLock<HashMap<TaskListId, TaskListState>>,
    writes: AtomicU64,
    reads: AtomicU64,
    failing_reads: AtomicUsize,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            task_lists: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            failing_reads: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of successful enqueues
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of `read_range` calls, failed ones included
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of unacknowledged tasks on a task list
    pub fn pending_task_count(&self, task_list: &TaskListId) -> usize {
        self.task_lists
            .read()
            .get(task_list)
            .map(|s| s.tasks.len())
            .unwrap_or(0)
    }

    /// Stored ack level of a task list
    pub fn ack_level(&self, task_list: &TaskListId) -> Option<i64> {
        self.task_lists.read().get(task_list).map(|s| s.ack_level)
    }

    /// Current range ID of a task list
    pub fn range_id(&self, task_list: &TaskListId) -> Option<i64> {
        self.task_lists.read().get(task_list).map(|s| s.range_id)
    }

    /// Make the next `count` reads fail
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make every enqueue fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        Ok(())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.task_lists.write().clear();
    }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn lease_task_list(&self, task_list: &TaskListId) -> Result<TaskListLease, StoreError> {
        let mut lists = self.task_lists.write();
        let state = lists.entry(task_list.clone()).or_default();
        state.range_id += 1;
        Ok(TaskListLease {
            range_id: state.range_id,
            ack_level: state.ack_level,
            max_task_id: state.max_task_id,
        })
    }

    async fn enqueue(
        &self,
        task_list: &TaskListId,
        range_id: i64,
        task: TaskInfo,
    ) -> Result<i64, StoreError> {
        self.check_open()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        let mut lists = self.task_lists.write();
        let state = lists
            .get_mut(task_list)
            .ok_or_else(|| StoreError::TaskListNotFound(task_list.to_string()))?;
        state.check_range(task_list, range_id)?;

        state.max_task_id += 1;
        let task_id = state.max_task_id;
        state.tasks.insert(task_id, task);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(task_id)
    }

    async fn read_range(
        &self,
        task_list: &TaskListId,
        from_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<PersistedTask>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.take_read_failure() {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }

        let lists = self.task_lists.read();
        let Some(state) = lists.get(task_list) else {
            return Ok(vec![]);
        };

        Ok(state
            .tasks
            .range(from_task_id..)
            .take(max_count)
            .map(|(id, info)| PersistedTask {
                task_id: *id,
                info: info.clone(),
            })
            .collect())
    }

    async fn ack_up_to(
        &self,
        task_list: &TaskListId,
        range_id: i64,
        task_id: i64,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let mut lists = self.task_lists.write();
        let state = lists
            .get_mut(task_list)
            .ok_or_else(|| StoreError::TaskListNotFound(task_list.to_string()))?;
        state.check_range(task_list, range_id)?;

        if task_id > state.ack_level {
            state.ack_level = task_id;
            state.tasks = state.tasks.split_off(&(task_id + 1));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
