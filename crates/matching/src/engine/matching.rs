//! Matching engine: entry point for every task list operation

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::query::{QueryDispatchTable, QueryRegistration};
use super::registry::TaskListRegistry;
use crate::config::MatchingConfig;
use crate::context::{validate_long_poll_context, RequestContext};
use crate::domain::{DomainCache, DomainEntry};
use crate::error::MatchingError;
use crate::metrics::{Counter, MetricsClient, Scope};
use crate::persistence::TaskStore;
use crate::tasklist::{StopReason, TaskListManager};
use crate::types::{
    AddTaskRequest, CancelOutstandingPollRequest, DescribeTaskListRequest,
    DescribeTaskListResponse, PollOutcome, PollRequest, QueryCompletionType, QueryOutcome,
    QueryTask, QueryWorkflowRequest, RespondQueryTaskCompletedRequest, TaskInfo, TaskListId,
    TaskListKind,
};

/// How often a call re-resolves a task list that was unloaded under it
const MAX_RELOADS: usize = 3;

/// Registry of task list managers and the operations routed through them
///
/// # Example
///
/// ```ignore
/// let engine = MatchingEngine::new(
///     MatchingConfig::default(),
///     Arc::new(TaskListRegistry::new()),
///     store,
///     domains,
///     Arc::new(NoopMetrics),
/// );
/// engine.start();
///
/// let ctx = RequestContext::with_timeout(Duration::from_secs(30));
/// let outcome = engine.poll_for_activity_task(&ctx, request).await?;
///
/// engine.stop().await;
/// ```
pub struct MatchingEngine {
    config: Arc<MatchingConfig>,
    registry: Arc<TaskListRegistry>,
    queries: QueryDispatchTable,
    store: Arc<dyn TaskStore>,
    domains: Arc<dyn DomainCache>,
    metrics: Arc<dyn MetricsClient>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MatchingEngine {
    pub fn new(
        config: MatchingConfig,
        registry: Arc<TaskListRegistry>,
        store: Arc<dyn TaskStore>,
        domains: Arc<dyn DomainCache>,
        metrics: Arc<dyn MetricsClient>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            queries: QueryDispatchTable::new(),
            store,
            domains,
            metrics,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskListRegistry> {
        &self.registry
    }

    /// Number of queries waiting for an answer
    pub fn pending_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start the idle task list sweep
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let interval = self.config.idle_check_interval;
        let shutdown = self.shutdown.clone();

        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, remaining = registry.len(), "Evicted idle task lists");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Idle sweep: shutdown requested");
                        break;
                    }
                }
            }
        }));
        info!(
            idle_check_interval_ms = interval.as_millis() as u64,
            "Matching engine started"
        );
    }

    /// Stop the engine
    ///
    /// Outstanding polls fail with `ShuttingDown`, pending queries are
    /// released, and every manager is stopped and removed.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(task_lists = self.registry.len(), "Stopping matching engine");
        self.shutdown.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                warn!(error = %err, "Idle sweep ended abnormally");
            }
        }

        let released = self.queries.fail_all();
        for manager in self.registry.drain() {
            manager.stop(StopReason::Shutdown).await;
        }
        info!(released_queries = released, "Matching engine stopped");
    }

    /// Add an activity task; returns whether it was sync-matched
    #[instrument(skip(self, ctx, req), fields(domain_id = %req.domain_id, task_list = %req.task_list))]
    pub async fn add_activity_task(
        &self,
        ctx: &RequestContext,
        req: AddTaskRequest,
    ) -> Result<bool, MatchingError> {
        self.add_task(ctx, req, TaskListKind::Activity).await
    }

    /// Add a decision task; returns whether it was sync-matched
    #[instrument(skip(self, ctx, req), fields(domain_id = %req.domain_id, task_list = %req.task_list))]
    pub async fn add_decision_task(
        &self,
        ctx: &RequestContext,
        req: AddTaskRequest,
    ) -> Result<bool, MatchingError> {
        self.add_task(ctx, req, TaskListKind::Decision).await
    }

    async fn add_task(
        &self,
        ctx: &RequestContext,
        req: AddTaskRequest,
        kind: TaskListKind,
    ) -> Result<bool, MatchingError> {
        self.ensure_running()?;
        self.validate_task_list_name(&req.task_list)?;
        self.active_domain(&req.domain_id).await?;

        let id = TaskListId::new(&req.domain_id, &req.task_list, kind);
        let info = TaskInfo {
            domain_id: req.domain_id,
            execution: req.execution,
            schedule_id: req.schedule_id,
            created_at: Utc::now(),
            schedule_to_start_timeout: req.schedule_to_start_timeout,
        };

        let matched = self
            .with_manager(&id, |manager| {
                let info = info.clone();
                async move { manager.add_task(ctx, info).await }
            })
            .await?;

        if matched {
            let scope = match kind {
                TaskListKind::Activity => Scope::AddActivityTask,
                TaskListKind::Decision => Scope::AddDecisionTask,
            };
            self.metrics.inc_counter(scope, Counter::SyncMatched);
        }
        Ok(matched)
    }

    /// Long-poll an activity task list
    #[instrument(skip(self, ctx, req), fields(domain_id = %req.domain_id, task_list = %req.task_list))]
    pub async fn poll_for_activity_task(
        &self,
        ctx: &RequestContext,
        req: PollRequest,
    ) -> Result<PollOutcome, MatchingError> {
        self.poll(ctx, req, TaskListKind::Activity, "PollForActivityTask")
            .await
    }

    /// Long-poll a decision task list; may return a query task
    #[instrument(skip(self, ctx, req), fields(domain_id = %req.domain_id, task_list = %req.task_list))]
    pub async fn poll_for_decision_task(
        &self,
        ctx: &RequestContext,
        req: PollRequest,
    ) -> Result<PollOutcome, MatchingError> {
        self.poll(ctx, req, TaskListKind::Decision, "PollForDecisionTask")
            .await
    }

    async fn poll(
        &self,
        ctx: &RequestContext,
        req: PollRequest,
        kind: TaskListKind,
        operation: &str,
    ) -> Result<PollOutcome, MatchingError> {
        self.ensure_running()?;
        self.validate_long_poll(ctx, operation)?;
        self.validate_task_list_name(&req.task_list)?;
        self.active_domain(&req.domain_id).await?;

        let id = TaskListId::new(&req.domain_id, &req.task_list, kind);
        let identity = req.identity.as_str();
        let poller_id = req.poller_id.as_str();
        self.with_manager(&id, |manager| async move {
            manager.poll(ctx, identity, poller_id).await
        })
        .await
    }

    /// Run a query on a workflow through its decision task list
    ///
    /// Blocks until a worker answers, the deadline passes (`Timeout`), or
    /// the caller cancels (`Canceled`).
    #[instrument(skip(self, ctx, req), fields(domain_id = %req.domain_id, task_list = %req.task_list))]
    pub async fn query_workflow(
        &self,
        ctx: &RequestContext,
        req: QueryWorkflowRequest,
    ) -> Result<QueryOutcome, MatchingError> {
        self.ensure_running()?;
        self.validate_long_poll(ctx, "QueryWorkflow")?;
        self.validate_task_list_name(&req.task_list)?;
        self.active_domain(&req.domain_id).await?;

        let id = TaskListId::new(&req.domain_id, &req.task_list, TaskListKind::Decision);
        let (query_id, mut rx) = self.queries.register();
        let _registration = QueryRegistration {
            table: &self.queries,
            query_id: query_id.clone(),
        };
        let task = QueryTask {
            query_id: query_id.clone(),
            domain_id: req.domain_id,
            execution: req.execution,
            query: req.query,
        };

        let delivered = self
            .with_manager(&id, |manager| {
                let task = task.clone();
                async move { manager.offer_query(ctx, task).await }
            })
            .await?;

        let result = if delivered {
            debug!(%query_id, "Query dispatched to poller");
            let received = tokio::select! {
                result = &mut rx => Some(result.ok()),
                _ = ctx.expired() => None,
                _ = ctx.cancellation_token().cancelled() => None,
                _ = self.shutdown.cancelled() => None,
            };
            match received {
                Some(result) => result,
                // Lost the race to a responder; its answer is on the way
                None if !self.queries.remove(&query_id) => rx.await.ok(),
                None => None,
            }
        } else {
            None
        };

        match result {
            Some(result) => match result.completion_type {
                QueryCompletionType::Completed => Ok(QueryOutcome::Answered {
                    answer: result.answer,
                }),
                QueryCompletionType::Failed => Err(MatchingError::QueryFailed(
                    result
                        .error_message
                        .unwrap_or_else(|| "query failed without a message".to_string()),
                )),
            },
            None if self.shutdown.is_cancelled() => Err(MatchingError::ShuttingDown),
            None if ctx.is_cancelled() => Ok(QueryOutcome::Canceled),
            None => {
                self.metrics
                    .inc_counter(Scope::QueryWorkflow, Counter::QueryTimeout);
                debug!(%query_id, "Query timed out");
                Ok(QueryOutcome::Timeout)
            }
        }
    }

    /// Deliver a worker's answer to the waiting `QueryWorkflow` call
    #[instrument(skip(self, req), fields(query_id = %req.query_id))]
    pub async fn respond_query_task_completed(
        &self,
        req: RespondQueryTaskCompletedRequest,
    ) -> Result<(), MatchingError> {
        self.queries.resolve(&req.query_id, req.result)
    }

    /// Cancel a blocked poll by poller ID
    ///
    /// Unknown pollers and task lists are not an error.
    #[instrument(skip(self, req), fields(task_list = %req.task_list, poller_id = %req.poller_id))]
    pub async fn cancel_outstanding_poll(
        &self,
        req: CancelOutstandingPollRequest,
    ) -> Result<(), MatchingError> {
        self.validate_task_list_name(&req.task_list)?;
        let id = TaskListId::new(&req.domain_id, &req.task_list, req.kind);
        if let Some(manager) = self.registry.get(&id) {
            manager.cancel_poller(&req.poller_id);
        }
        Ok(())
    }

    /// Snapshot of a task list's pollers and backlog
    #[instrument(skip(self, req), fields(domain_id = %req.domain_id, task_list = %req.task_list))]
    pub async fn describe_task_list(
        &self,
        req: DescribeTaskListRequest,
    ) -> Result<DescribeTaskListResponse, MatchingError> {
        self.ensure_running()?;
        self.validate_task_list_name(&req.task_list)?;
        self.domains.get_domain_by_id(&req.domain_id).await?;

        let id = TaskListId::new(&req.domain_id, &req.task_list, req.kind);
        let include_status = req.include_task_list_status;
        self.with_manager(&id, |manager| async move {
            manager.describe(include_status).await
        })
        .await
    }

    /// Run `op` on the manager of `id`, re-resolving if it was unloaded
    async fn with_manager<T, F, Fut>(&self, id: &TaskListId, op: F) -> Result<T, MatchingError>
    where
        F: Fn(Arc<TaskListManager>) -> Fut,
        Fut: Future<Output = Result<T, MatchingError>>,
    {
        let mut reloads = 0;
        loop {
            let manager = self.manager(id)?;
            match op(Arc::clone(&manager)).await {
                Err(MatchingError::TaskListUnloaded(name)) => {
                    self.registry.remove_if_same(id, &manager);
                    if reloads >= MAX_RELOADS {
                        return Err(MatchingError::TaskListUnloaded(name));
                    }
                    reloads += 1;
                    debug!(task_list = %id, reloads, "Task list unloaded during call, reloading");
                }
                other => return other,
            }
        }
    }

    fn manager(&self, id: &TaskListId) -> Result<Arc<TaskListManager>, MatchingError> {
        self.ensure_running()?;
        Ok(self.registry.get_or_create(id, || {
            TaskListManager::new(
                id.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
                self.shutdown.child_token(),
            )
        }))
    }

    fn ensure_running(&self) -> Result<(), MatchingError> {
        if self.shutdown.is_cancelled() {
            return Err(MatchingError::ShuttingDown);
        }
        Ok(())
    }

    fn validate_long_poll(&self, ctx: &RequestContext, operation: &str) -> Result<(), MatchingError> {
        validate_long_poll_context(
            ctx,
            operation,
            self.config.max_long_poll_timeout,
            self.config.critical_long_poll_timeout,
        )
    }

    fn validate_task_list_name(&self, name: &str) -> Result<(), MatchingError> {
        if name.trim().is_empty() {
            return Err(MatchingError::BadRequest("task list name is empty".into()));
        }
        if name.len() > self.config.max_task_list_name_length {
            return Err(MatchingError::BadRequest(format!(
                "task list name exceeds {} bytes",
                self.config.max_task_list_name_length
            )));
        }
        Ok(())
    }

    async fn active_domain(&self, domain_id: &str) -> Result<Arc<DomainEntry>, MatchingError> {
        let domain = self.domains.get_domain_by_id(domain_id).await?;
        if !domain.is_active {
            return Err(MatchingError::DomainNotActive {
                domain: domain.name.clone(),
            });
        }
        Ok(domain)
    }
}

impl std::fmt::Debug for MatchingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchingEngine")
            .field("task_lists", &self.registry.len())
            .field("pending_queries", &self.queries.len())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}
