//! Service entry point of the matching host
//!
//! [`Handler`] wraps the [`MatchingEngine`] with the per-request envelope
//! shared by every API:
//!
//! 1. wait for the startup barrier
//! 2. count the request and start its latency timer
//! 3. consult the host rate limiter
//! 4. run the engine operation
//! 5. classify the error, bump its counter, and normalize it

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::engine::MatchingEngine;
use crate::error::{ErrorKind, MatchingError};
use crate::metrics::{start_timer, Counter, MetricsClient, Scope, Timer};
use crate::persistence::TaskStore;
use crate::quotas::RateLimiter;
use crate::types::{
    AddTaskRequest, CancelOutstandingPollRequest, DescribeTaskListRequest,
    DescribeTaskListResponse, HealthStatus, PollOutcome, PollRequest, QueryOutcome,
    QueryWorkflowRequest, RespondQueryTaskCompletedRequest,
};

/// Matching API surface
///
/// # Example
///
/// ```ignore
/// let handler = Handler::new(engine, store, limiter, metrics);
/// handler.start();
///
/// let ctx = RequestContext::with_timeout(Duration::from_secs(60));
/// let outcome = handler.poll_for_activity_task(&ctx, request).await?;
///
/// handler.stop().await;
/// ```
pub struct Handler {
    engine: Arc<MatchingEngine>,
    store: Arc<dyn TaskStore>,
    limiter: Arc<dyn RateLimiter>,
    metrics: Arc<dyn MetricsClient>,
    started: watch::Sender<bool>,
}

impl Handler {
    pub fn new(
        engine: Arc<MatchingEngine>,
        store: Arc<dyn TaskStore>,
        limiter: Arc<dyn RateLimiter>,
        metrics: Arc<dyn MetricsClient>,
    ) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            engine,
            store,
            limiter,
            metrics,
            started,
        }
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    /// Start the engine and open the startup barrier
    pub fn start(&self) {
        self.engine.start();
        self.started.send_replace(true);
        info!("Matching handler started");
    }

    /// Stop the engine, then release the store
    pub async fn stop(&self) {
        self.engine.stop().await;
        self.store.close().await;
        info!("Matching handler stopped");
    }

    /// Whether the startup barrier has opened
    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    pub fn health(&self) -> HealthStatus {
        if !self.is_started() {
            return HealthStatus {
                ok: false,
                message: "matching starting".to_string(),
            };
        }
        if self.engine.is_stopped() {
            return HealthStatus {
                ok: false,
                message: "matching stopped".to_string(),
            };
        }
        HealthStatus {
            ok: true,
            message: "matching good".to_string(),
        }
    }

    pub async fn add_activity_task(
        &self,
        ctx: &RequestContext,
        req: AddTaskRequest,
    ) -> Result<bool, MatchingError> {
        self.add_task(ctx, req, Scope::AddActivityTask).await
    }

    pub async fn add_decision_task(
        &self,
        ctx: &RequestContext,
        req: AddTaskRequest,
    ) -> Result<bool, MatchingError> {
        self.add_task(ctx, req, Scope::AddDecisionTask).await
    }

    async fn add_task(
        &self,
        ctx: &RequestContext,
        req: AddTaskRequest,
        scope: Scope,
    ) -> Result<bool, MatchingError> {
        let stopwatch = start_timer(&self.metrics, scope, Timer::Latency);
        let matched = self
            .handle(ctx, scope, true, async {
                match scope {
                    Scope::AddDecisionTask => self.engine.add_decision_task(ctx, req).await,
                    _ => self.engine.add_activity_task(ctx, req).await,
                }
            })
            .await?;
        if matched {
            self.metrics
                .record_timer(scope, Timer::SyncMatchLatency, stopwatch.elapsed());
        }
        Ok(matched)
    }

    pub async fn poll_for_activity_task(
        &self,
        ctx: &RequestContext,
        req: PollRequest,
    ) -> Result<PollOutcome, MatchingError> {
        let _stopwatch = start_timer(&self.metrics, Scope::PollForActivityTask, Timer::Latency);
        self.handle(
            ctx,
            Scope::PollForActivityTask,
            true,
            self.engine.poll_for_activity_task(ctx, req),
        )
        .await
    }

    pub async fn poll_for_decision_task(
        &self,
        ctx: &RequestContext,
        req: PollRequest,
    ) -> Result<PollOutcome, MatchingError> {
        let _stopwatch = start_timer(&self.metrics, Scope::PollForDecisionTask, Timer::Latency);
        self.handle(
            ctx,
            Scope::PollForDecisionTask,
            true,
            self.engine.poll_for_decision_task(ctx, req),
        )
        .await
    }

    pub async fn query_workflow(
        &self,
        ctx: &RequestContext,
        req: QueryWorkflowRequest,
    ) -> Result<QueryOutcome, MatchingError> {
        let _stopwatch = start_timer(&self.metrics, Scope::QueryWorkflow, Timer::Latency);
        self.handle(
            ctx,
            Scope::QueryWorkflow,
            true,
            self.engine.query_workflow(ctx, req),
        )
        .await
    }

    /// Answers are delivered even when the host is throttled, so a worker
    /// is never left holding a result nobody can receive.
    pub async fn respond_query_task_completed(
        &self,
        ctx: &RequestContext,
        req: RespondQueryTaskCompletedRequest,
    ) -> Result<(), MatchingError> {
        let _stopwatch = start_timer(
            &self.metrics,
            Scope::RespondQueryTaskCompleted,
            Timer::Latency,
        );
        self.handle(
            ctx,
            Scope::RespondQueryTaskCompleted,
            false,
            self.engine.respond_query_task_completed(req),
        )
        .await
    }

    /// Cancellation is never throttled.
    pub async fn cancel_outstanding_poll(
        &self,
        ctx: &RequestContext,
        req: CancelOutstandingPollRequest,
    ) -> Result<(), MatchingError> {
        let _stopwatch = start_timer(&self.metrics, Scope::CancelOutstandingPoll, Timer::Latency);
        self.handle(
            ctx,
            Scope::CancelOutstandingPoll,
            false,
            self.engine.cancel_outstanding_poll(req),
        )
        .await
    }

    pub async fn describe_task_list(
        &self,
        ctx: &RequestContext,
        req: DescribeTaskListRequest,
    ) -> Result<DescribeTaskListResponse, MatchingError> {
        let _stopwatch = start_timer(&self.metrics, Scope::DescribeTaskList, Timer::Latency);
        self.handle(
            ctx,
            Scope::DescribeTaskList,
            true,
            self.engine.describe_task_list(req),
        )
        .await
    }

    /// Request envelope shared by every API
    async fn handle<T, Fut>(
        &self,
        ctx: &RequestContext,
        scope: Scope,
        refuse_when_throttled: bool,
        op: Fut,
    ) -> Result<T, MatchingError>
    where
        Fut: Future<Output = Result<T, MatchingError>>,
    {
        self.metrics.inc_counter(scope, Counter::Requests);

        if let Err(err) = self.wait_started(ctx).await {
            return Err(self.handle_err(scope, err));
        }

        if !self.limiter.allow() && refuse_when_throttled {
            return Err(self.handle_err(scope, MatchingError::host_throttled()));
        }

        op.await.map_err(|err| self.handle_err(scope, err))
    }

    /// Block until `start` has run, or until the call's context ends
    async fn wait_started(&self, ctx: &RequestContext) -> Result<(), MatchingError> {
        let mut started = self.started.subscribe();
        if *started.borrow_and_update() {
            return Ok(());
        }

        tokio::select! {
            result = started.wait_for(|started| *started) => result
                .map(|_| ())
                .map_err(|_| MatchingError::ShuttingDown),
            _ = ctx.expired() => Err(MatchingError::ServiceBusy(
                "matching host is still starting".into(),
            )),
            _ = ctx.cancellation_token().cancelled() => Err(MatchingError::ServiceBusy(
                "request cancelled while matching host was starting".into(),
            )),
        }
    }

    fn handle_err(&self, scope: Scope, err: MatchingError) -> MatchingError {
        let kind = err.kind();
        self.metrics.inc_counter(scope, kind.counter());
        match kind {
            ErrorKind::InternalService => {
                error!(scope = scope.as_str(), error = %err, "Matching request failed");
            }
            ErrorKind::ServiceBusy => {
                warn!(scope = scope.as_str(), error = %err, "Matching request refused");
            }
            _ => {}
        }
        err.normalize()
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("engine", &self.engine)
            .field("started", &self.is_started())
            .finish()
    }
}
