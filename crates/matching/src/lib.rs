//! # Matching Service
//!
//! Task-list matching for a workflow orchestration system: producers add
//! activity and decision tasks, workers long-poll for them, and clients run
//! queries against workflows through the same task lists.
//!
//! ## Features
//!
//! - **Sync matching**: a task offered while a worker is polling is handed
//!   over in memory without touching the store
//! - **Durable backlog**: unmatched tasks are persisted and drained in
//!   sequence order by a per-task-list reader
//! - **Lease fencing**: each task list has one owner; a stale owner unloads
//!   itself and the next call reloads the task list
//! - **Idle eviction**: task lists nobody uses are unloaded without losing
//!   persisted tasks
//! - **Workflow queries**: queries ride on decision pollers and are answered
//!   through a correlation table
//! - **Admission control**: host-level rate limiting with `ServiceBusy`
//!   refusals and per-API metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Handler                             │
//! │  (startup barrier, rate limiting, metrics, error kinds)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MatchingEngine                         │
//! │  (domain checks, query table, idle sweep, reload on unload)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            TaskListRegistry → TaskListManager                │
//! │  (rendezvous of producers and pollers, backlog reader, acks) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TaskStore                            │
//! │  (leases, ordered task queue per task list, ack levels)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use everruns_matching::prelude::*;
//!
//! let store = Arc::new(InMemoryTaskStore::new());
//! let engine = Arc::new(MatchingEngine::new(
//!     MatchingConfig::default(),
//!     Arc::new(TaskListRegistry::new()),
//!     store.clone(),
//!     domains,
//!     Arc::new(NoopMetrics),
//! ));
//! let handler = Handler::new(engine, store, Arc::new(DynamicRateLimiter::fixed(1200)), metrics);
//! handler.start();
//!
//! let ctx = RequestContext::with_timeout(Duration::from_secs(60));
//! match handler.poll_for_activity_task(&ctx, request).await? {
//!     PollOutcome::Matched(task) => run(task).await,
//!     PollOutcome::Timeout | PollOutcome::Canceled => {}
//! }
//! ```

pub mod config;
pub mod context;
pub mod domain;
pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod persistence;
pub mod progress;
pub mod quotas;
pub mod reliability;
pub mod tasklist;
pub mod types;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::MatchingConfig;
    pub use crate::context::RequestContext;
    pub use crate::domain::{DomainCache, DomainEntry, InMemoryDomainCache};
    pub use crate::engine::{MatchingEngine, TaskListRegistry};
    pub use crate::error::{ErrorKind, MatchingError};
    pub use crate::handler::Handler;
    pub use crate::metrics::{FacadeMetrics, InMemoryMetrics, MetricsClient, NoopMetrics};
    pub use crate::persistence::{InMemoryTaskStore, StoreError, TaskStore};
    pub use crate::progress::{ProgressManager, ProgressManagerExt};
    pub use crate::quotas::{DynamicRateLimiter, RateLimiter};
    pub use crate::reliability::RetryPolicy;
    pub use crate::types::{
        AddTaskRequest, MatchedTask, PollOutcome, PollRequest, QueryOutcome, TaskListKind,
        WorkflowExecution,
    };
}

// Re-export key types at crate root
pub use config::{ConfigError, MatchingConfig};
pub use context::RequestContext;
pub use domain::{DomainCache, DomainEntry, DomainError, InMemoryDomainCache};
pub use engine::{MatchingEngine, QueryDispatchTable, TaskListRegistry};
pub use error::{ErrorKind, MatchingError};
pub use handler::Handler;
pub use crate::metrics::{FacadeMetrics, InMemoryMetrics, MetricsClient, NoopMetrics};
pub use persistence::{InMemoryTaskStore, StoreError, TaskListLease, TaskStore};
pub use progress::{
    HeartbeatPayload, HeartbeatProgressManager, InMemoryProgressManager, ProgressError,
    ProgressManager, ProgressManagerExt,
};
pub use quotas::{DynamicRateLimiter, FixedRateLimiter, RateLimiter};
pub use reliability::RetryPolicy;
pub use tasklist::TaskListManager;
pub use types::*;
