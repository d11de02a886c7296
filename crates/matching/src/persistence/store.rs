//! TaskStore trait definition

use async_trait::async_trait;

use crate::types::{PersistedTask, TaskInfo, TaskListId};

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Another owner leased the task list after us
    #[error("lease lost on task list {task_list}: range {held} is older than {current}")]
    LeaseLost {
        task_list: String,
        held: i64,
        current: i64,
    },

    /// The task list has never been leased
    #[error("task list not found: {0}")]
    TaskListNotFound(String),

    /// Backend unreachable or timed out
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

/// Ownership record returned when a task list is leased
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskListLease {
    /// Fencing token; bumped by every lease
    pub range_id: i64,

    /// Highest task ID known delivered
    pub ack_level: i64,

    /// Highest task ID ever assigned on this task list
    pub max_task_id: i64,
}

/// Durable backlog of tasks, one ordered queue per task list
///
/// Task IDs are assigned by the store and increase monotonically within a
/// task list. Every mutating call carries the `range_id` of the caller's
/// lease; a call with an outdated range fails with [`StoreError::LeaseLost`].
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Take ownership of a task list, creating it if needed
    async fn lease_task_list(&self, task_list: &TaskListId) -> Result<TaskListLease, StoreError>;

    /// Append a task; returns its sequence number
    async fn enqueue(
        &self,
        task_list: &TaskListId,
        range_id: i64,
        task: TaskInfo,
    ) -> Result<i64, StoreError>;

    /// Read up to `max_count` tasks with ID >= `from_task_id`, ascending
    async fn read_range(
        &self,
        task_list: &TaskListId,
        from_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<PersistedTask>, StoreError>;

    /// Record that every task with ID <= `task_id` has been delivered
    ///
    /// Acknowledged tasks may be deleted. A level lower than the stored one
    /// must be ignored.
    async fn ack_up_to(
        &self,
        task_list: &TaskListId,
        range_id: i64,
        task_id: i64,
    ) -> Result<(), StoreError>;

    /// Release connections
    async fn close(&self) {}
}
