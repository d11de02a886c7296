//! Metrics sink for the matching service
//!
//! The engine and handler report through the [`MetricsClient`] trait, scoped
//! per API. Three sinks are provided:
//!
//! - [`FacadeMetrics`] forwards to the `metrics` crate facade, so any
//!   installed recorder (e.g. a Prometheus exporter) receives the data
//! - [`InMemoryMetrics`] keeps counts in memory for tests and debugging
//! - [`NoopMetrics`] drops everything
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `matching_requests_total` | Counter | `scope`, `counter` |
//! | `matching_latency_seconds` | Histogram | `scope`, `timer` |

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: every counted event, labelled by scope and counter.
    pub const COUNTERS_TOTAL: &str = "matching_requests_total";
    /// Histogram: timings in seconds, labelled by scope and timer.
    pub const LATENCY_SECONDS: &str = "matching_latency_seconds";
}

/// API or component a measurement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    AddActivityTask,
    AddDecisionTask,
    PollForActivityTask,
    PollForDecisionTask,
    QueryWorkflow,
    RespondQueryTaskCompleted,
    CancelOutstandingPoll,
    DescribeTaskList,
    TaskListManager,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddActivityTask => "add_activity_task",
            Self::AddDecisionTask => "add_decision_task",
            Self::PollForActivityTask => "poll_for_activity_task",
            Self::PollForDecisionTask => "poll_for_decision_task",
            Self::QueryWorkflow => "query_workflow",
            Self::RespondQueryTaskCompleted => "respond_query_task_completed",
            Self::CancelOutstandingPoll => "cancel_outstanding_poll",
            Self::DescribeTaskList => "describe_task_list",
            Self::TaskListManager => "task_list_manager",
        }
    }
}

/// Counted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Requests,
    Failures,
    ErrBadRequest,
    ErrEntityNotExists,
    ErrDomainNotActive,
    ErrServiceBusy,
    ErrLimitExceeded,
    ErrQueryFailed,
    SyncMatched,
    TasksPersisted,
    PollSuccess,
    PollTimeout,
    PollCanceled,
    ExpiredTasks,
    BacklogReadFailures,
    TaskListLoaded,
    TaskListUnloaded,
    QueryTimeout,
}

impl Counter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Failures => "failures",
            Self::ErrBadRequest => "err_bad_request",
            Self::ErrEntityNotExists => "err_entity_not_exists",
            Self::ErrDomainNotActive => "err_domain_not_active",
            Self::ErrServiceBusy => "err_service_busy",
            Self::ErrLimitExceeded => "err_limit_exceeded",
            Self::ErrQueryFailed => "err_query_failed",
            Self::SyncMatched => "sync_matched",
            Self::TasksPersisted => "tasks_persisted",
            Self::PollSuccess => "poll_success",
            Self::PollTimeout => "poll_timeout",
            Self::PollCanceled => "poll_canceled",
            Self::ExpiredTasks => "expired_tasks",
            Self::BacklogReadFailures => "backlog_read_failures",
            Self::TaskListLoaded => "task_list_loaded",
            Self::TaskListUnloaded => "task_list_unloaded",
            Self::QueryTimeout => "query_timeout",
        }
    }
}

/// Timed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Latency,
    SyncMatchLatency,
}

impl Timer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::SyncMatchLatency => "sync_match_latency",
        }
    }
}

/// Sink for counters and timers
pub trait MetricsClient: Send + Sync {
    fn add_counter(&self, scope: Scope, counter: Counter, n: u64);

    fn inc_counter(&self, scope: Scope, counter: Counter) {
        self.add_counter(scope, counter, 1);
    }

    fn record_timer(&self, scope: Scope, timer: Timer, elapsed: Duration);
}

/// Start a timer that records on drop
pub fn start_timer(client: &Arc<dyn MetricsClient>, scope: Scope, timer: Timer) -> Stopwatch {
    Stopwatch {
        client: Arc::clone(client),
        scope,
        timer,
        started: Instant::now(),
    }
}

/// Running timer; records the elapsed time when dropped
pub struct Stopwatch {
    client: Arc<dyn MetricsClient>,
    scope: Scope,
    timer: Timer,
    started: Instant,
}

impl Stopwatch {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        self.client
            .record_timer(self.scope, self.timer, self.started.elapsed());
    }
}

/// Sink forwarding to the `metrics` crate facade
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsClient for FacadeMetrics {
    fn add_counter(&self, scope: Scope, counter: Counter, n: u64) {
        metrics::counter!(
            names::COUNTERS_TOTAL,
            "scope" => scope.as_str(),
            "counter" => counter.as_str()
        )
        .increment(n);
    }

    fn record_timer(&self, scope: Scope, timer: Timer, elapsed: Duration) {
        metrics::histogram!(
            names::LATENCY_SECONDS,
            "scope" => scope.as_str(),
            "timer" => timer.as_str()
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Sink that drops every measurement
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsClient for NoopMetrics {
    fn add_counter(&self, _scope: Scope, _counter: Counter, _n: u64) {}

    fn record_timer(&self, _scope: Scope, _timer: Timer, _elapsed: Duration) {}
}

/// Sink keeping counts and timer samples in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<(Scope, Counter), u64>,
    timers: DashMap<(Scope, Timer), Vec<Duration>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter
    pub fn counter(&self, scope: Scope, counter: Counter) -> u64 {
        self.counters
            .get(&(scope, counter))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Number of samples recorded for a timer
    pub fn timer_count(&self, scope: Scope, timer: Timer) -> usize {
        self.timers
            .get(&(scope, timer))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Sum of a counter over all scopes
    pub fn counter_total(&self, counter: Counter) -> u64 {
        self.counters
            .iter()
            .filter(|e| e.key().1 == counter)
            .map(|e| *e.value())
            .sum()
    }
}

impl MetricsClient for InMemoryMetrics {
    fn add_counter(&self, scope: Scope, counter: Counter, n: u64) {
        *self.counters.entry((scope, counter)).or_insert(0) += n;
    }

    fn record_timer(&self, scope: Scope, timer: Timer, elapsed: Duration) {
        self.timers.entry((scope, timer)).or_default().push(elapsed);
    }
}
