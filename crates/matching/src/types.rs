//! Task list identities, tasks, and the request/response shapes of the
//! matching API

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::option_duration_millis;

/// Kind of work carried by a task list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskListKind {
    /// Activity tasks, polled by activity workers
    Activity,

    /// Decision tasks (and queries), polled by workflow workers
    Decision,
}

impl fmt::Display for TaskListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity => write!(f, "activity"),
            Self::Decision => write!(f, "decision"),
        }
    }
}

/// Identity of a task list: one manager exists per identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskListId {
    domain_id: String,
    name: String,
    kind: TaskListKind,
}

impl TaskListId {
    /// Create a task list identity
    pub fn new(domain_id: impl Into<String>, name: impl Into<String>, kind: TaskListKind) -> Self {
        Self {
            domain_id: domain_id.into(),
            name: name.into(),
            kind,
        }
    }

    /// Domain that owns the task list
    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    /// Task list name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task list kind
    pub fn kind(&self) -> TaskListKind {
        self.kind
    }
}

impl fmt::Display for TaskListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.name, self.kind)
    }
}

/// Workflow run a task belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// A unit of work queued on a task list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub created_at: DateTime<Utc>,

    /// Task is dropped if it is still queued after this long
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_start_timeout: Option<Duration>,
}

impl TaskInfo {
    /// Whether the schedule-to-start timeout has elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.schedule_to_start_timeout else {
            return false;
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        self.created_at + timeout <= now
    }
}

/// A task read back from the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    /// Sequence number assigned by the store
    pub task_id: i64,
    pub info: TaskInfo,
}

/// Request to add an activity or decision task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTaskRequest {
    pub domain_id: String,
    pub task_list: String,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_start_timeout: Option<Duration>,
}

/// Request to long-poll a task list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub domain_id: String,
    pub task_list: String,

    /// Worker identity, reported by `DescribeTaskList`
    pub identity: String,

    /// Per-call ID used by `CancelOutstandingPoll`
    #[serde(default)]
    pub poller_id: String,
}

/// Where a polled task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// Handed over directly by a producer
    SyncMatch,

    /// Read from the durable backlog
    Backlog,
}

/// A task delivered to a poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolledTask {
    /// Store sequence number, absent for sync-matched tasks
    pub task_id: Option<i64>,
    pub info: TaskInfo,
    pub source: TaskSource,
}

/// Query against a running workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub query_type: String,
    #[serde(default)]
    pub query_args: Option<serde_json::Value>,
}

/// A query dispatched to a decision poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTask {
    /// Correlation ID the poller must echo in `RespondQueryTaskCompleted`
    pub query_id: String,
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub query: WorkflowQuery,
}

/// What a poll call received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchedTask {
    Task(PolledTask),
    Query(QueryTask),
}

/// Result of a long poll; timeout and cancellation are not errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Matched(MatchedTask),
    Timeout,
    Canceled,
}

impl PollOutcome {
    /// The delivered task, if any
    pub fn into_matched(self) -> Option<MatchedTask> {
        match self {
            Self::Matched(task) => Some(task),
            _ => None,
        }
    }

    /// Whether the poll ended without work
    pub fn is_empty(&self) -> bool {
        !matches!(self, Self::Matched(_))
    }
}

/// Request to query a workflow through its decision task list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryWorkflowRequest {
    pub domain_id: String,
    pub task_list: String,
    pub execution: WorkflowExecution,
    pub query: WorkflowQuery,
}

/// How a worker completed a query task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCompletionType {
    Completed,
    Failed,
}

/// A worker's answer to a query task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub completion_type: QueryCompletionType,
    #[serde(default)]
    pub answer: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl QueryResult {
    /// Successful answer
    pub fn answered(answer: serde_json::Value) -> Self {
        Self {
            completion_type: QueryCompletionType::Completed,
            answer: Some(answer),
            error_message: None,
        }
    }

    /// Failed answer
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            completion_type: QueryCompletionType::Failed,
            answer: None,
            error_message: Some(message.into()),
        }
    }
}

/// Result of `QueryWorkflow`; timeout and cancellation are not errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered { answer: Option<serde_json::Value> },
    Timeout,
    Canceled,
}

/// Request delivering a query answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondQueryTaskCompletedRequest {
    pub domain_id: String,
    pub task_list: String,
    pub query_id: String,
    pub result: QueryResult,
}

/// Request to cancel a blocked poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutstandingPollRequest {
    pub domain_id: String,
    pub task_list: String,
    pub kind: TaskListKind,
    pub poller_id: String,
}

/// Request for a task list snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeTaskListRequest {
    pub domain_id: String,
    pub task_list: String,
    pub kind: TaskListKind,
    #[serde(default)]
    pub include_task_list_status: bool,
}

/// A poller recently seen on a task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerInfo {
    pub identity: String,
    pub last_access_time: DateTime<Utc>,
}

/// Range of task IDs owned by the current lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdBlock {
    pub start: i64,
    pub end: i64,
}

/// Backlog bookkeeping of a task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListStatus {
    /// Estimated number of persisted tasks not yet delivered
    pub backlog_count_hint: u64,
    pub ack_level: i64,
    pub read_level: i64,
    pub task_id_block: TaskIdBlock,
}

/// Snapshot returned by `DescribeTaskList`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeTaskListResponse {
    pub pollers: Vec<PollerInfo>,
    /// Number of poll calls currently blocked
    pub outstanding_pollers: usize,
    pub status: Option<TaskListStatus>,
}

/// Health check answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub message: String,
}
