//! Shared fixtures for matching integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use everruns_matching::{
    AddTaskRequest, DomainEntry, FixedRateLimiter, Handler, InMemoryDomainCache, InMemoryMetrics,
    InMemoryTaskStore, MatchedTask, MatchingConfig, MatchingEngine, PollOutcome, PollRequest,
    RequestContext, TaskListRegistry, WorkflowExecution,
};

/// Active domain every test uses
pub const DOMAIN: &str = "d1";

/// Registered, but active in another cluster
pub const PASSIVE_DOMAIN: &str = "d2";

pub struct Harness {
    pub handler: Arc<Handler>,
    pub store: Arc<InMemoryTaskStore>,
    pub metrics: Arc<InMemoryMetrics>,
    pub limiter: Arc<FixedRateLimiter>,
    pub registry: Arc<TaskListRegistry>,
}

impl Harness {
    pub fn engine(&self) -> &Arc<MatchingEngine> {
        self.handler.engine()
    }
}

/// Started handler over in-memory collaborators
pub fn harness(config: MatchingConfig) -> Harness {
    let harness = unstarted_harness(config);
    harness.handler.start();
    harness
}

/// Handler whose startup barrier is still closed
pub fn unstarted_harness(config: MatchingConfig) -> Harness {
    let store = Arc::new(InMemoryTaskStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let limiter = Arc::new(FixedRateLimiter::allowing());
    let registry = Arc::new(TaskListRegistry::new());
    let domains = Arc::new(
        InMemoryDomainCache::new()
            .with_domain(DomainEntry::active(DOMAIN, "orders"))
            .with_domain(DomainEntry::passive(PASSIVE_DOMAIN, "billing")),
    );

    let engine = Arc::new(MatchingEngine::new(
        config,
        Arc::clone(&registry),
        store.clone(),
        domains,
        metrics.clone(),
    ));
    let handler = Arc::new(Handler::new(
        engine,
        store.clone(),
        limiter.clone(),
        metrics.clone(),
    ));

    Harness {
        handler,
        store,
        metrics,
        limiter,
        registry,
    }
}

pub fn ctx(timeout: Duration) -> RequestContext {
    RequestContext::with_timeout(timeout)
}

pub fn add_request(task_list: &str, schedule_id: i64) -> AddTaskRequest {
    AddTaskRequest {
        domain_id: DOMAIN.into(),
        task_list: task_list.into(),
        execution: WorkflowExecution::new("order-42", "run-1"),
        schedule_id,
        schedule_to_start_timeout: None,
    }
}

pub fn poll_request(task_list: &str, poller_id: &str) -> PollRequest {
    PollRequest {
        domain_id: DOMAIN.into(),
        task_list: task_list.into(),
        identity: format!("worker-{poller_id}"),
        poller_id: poller_id.into(),
    }
}

/// Schedule ID of a polled task; panics on anything else
pub fn schedule_id(outcome: PollOutcome) -> i64 {
    match outcome {
        PollOutcome::Matched(MatchedTask::Task(task)) => task.info.schedule_id,
        other => panic!("expected a task, got {other:?}"),
    }
}
