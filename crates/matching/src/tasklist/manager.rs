//! Task list manager
//!
//! One [`TaskListManager`] serves one [`TaskListId`]. It owns:
//!
//! - the rendezvous between producers and long-polling consumers
//! - the overflow path that persists tasks nobody picked up in time
//! - a background reader that drains the durable backlog into a bounded
//!   in-memory buffer
//! - the ack/read cursors over that backlog
//!
//! ```text
//!   add_task ──► waiting poller? ──yes──► hand off (sync match)
//!                     │ no
//!                     ▼
//!              pending offer ──poller arrives in window──► hand off
//!                     │ window over
//!                     ▼
//!               store.enqueue ──► reader ──► buffer ──► poll
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::matcher::{MatcherState, PendingOffer, StopReason};
use super::pollers::{PollerHistory, PollerToken};
use crate::config::MatchingConfig;
use crate::context::RequestContext;
use crate::error::MatchingError;
use crate::metrics::{Counter, MetricsClient, Scope};
use crate::persistence::{StoreError, TaskListLease, TaskStore};
use crate::types::{
    DescribeTaskListResponse, MatchedTask, PersistedTask, PollOutcome, PolledTask, QueryTask,
    TaskIdBlock, TaskInfo, TaskListId, TaskListStatus, TaskSource,
};

/// Upper bound on how long shutdown waits for producers to finish writing
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Matching and backlog management for one task list
pub struct TaskListManager {
    id: TaskListId,
    config: Arc<MatchingConfig>,
    store: Arc<dyn TaskStore>,
    metrics: Arc<dyn MetricsClient>,
    lease: OnceCell<TaskListLease>,
    state: Mutex<MatcherState>,
    history: PollerHistory,
    reader_notify: Notify,
    writes_drained: Notify,
    shutdown: CancellationToken,
}

impl TaskListManager {
    /// Create a manager; nothing touches the store until the first call
    pub fn new(
        id: TaskListId,
        config: Arc<MatchingConfig>,
        store: Arc<dyn TaskStore>,
        metrics: Arc<dyn MetricsClient>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let history = PollerHistory::new(config.poller_history_ttl, config.poller_history_capacity);
        Arc::new(Self {
            id,
            config,
            store,
            metrics,
            lease: OnceCell::new(),
            state: Mutex::new(MatcherState::new()),
            history,
            reader_notify: Notify::new(),
            writes_drained: Notify::new(),
            shutdown,
        })
    }

    pub fn id(&self) -> &TaskListId {
        &self.id
    }

    /// Whether the manager stopped serving
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped.is_some()
    }

    /// Lease the task list on first use and start the backlog reader
    pub async fn ensure_started(self: &Arc<Self>) -> Result<TaskListLease, MatchingError> {
        if let Some(reason) = self.state.lock().stopped {
            return Err(self.stopped_error(reason));
        }
        let lease = self.lease.get_or_try_init(|| self.load()).await?;
        Ok(*lease)
    }

    async fn load(self: &Arc<Self>) -> Result<TaskListLease, MatchingError> {
        let lease = self.store.lease_task_list(&self.id).await?;
        self.state.lock().load(lease.ack_level, lease.max_task_id);

        tokio::spawn(Arc::clone(self).run_reader());
        if lease.max_task_id > lease.ack_level {
            self.reader_notify.notify_one();
        }

        self.metrics
            .inc_counter(Scope::TaskListManager, Counter::TaskListLoaded);
        info!(
            task_list = %self.id,
            range_id = lease.range_id,
            ack_level = lease.ack_level,
            max_task_id = lease.max_task_id,
            "Task list loaded"
        );
        Ok(lease)
    }

    /// Offer a task; returns whether it was handed directly to a poller
    ///
    /// With no poller waiting, the task stays on offer for the sync-match
    /// window and is persisted once the window closes.
    #[instrument(skip(self, ctx, info), fields(task_list = %self.id, schedule_id = info.schedule_id))]
    pub async fn add_task(
        self: &Arc<Self>,
        ctx: &RequestContext,
        info: TaskInfo,
    ) -> Result<bool, MatchingError> {
        let lease = self.ensure_started().await?;
        let wait = self.config.sync_match_wait;
        let (accepted, accepted_rx) = oneshot::channel();

        let offer_id = {
            let mut state = self.state.lock();
            if let Some(reason) = state.stopped {
                return Err(self.stopped_error(reason));
            }
            state.touch();

            let item = MatchedTask::Task(PolledTask {
                task_id: None,
                info: info.clone(),
                source: TaskSource::SyncMatch,
            });
            let item = match state.offer_to_poller(item) {
                Ok(()) => {
                    debug!(task_list = %self.id, "Task matched to waiting poller");
                    return Ok(true);
                }
                Err(item) => item,
            };

            if let Some(max) = self.config.max_backlog_size {
                if state.backlog_estimate() >= max {
                    return Err(MatchingError::LimitExceeded(format!(
                        "backlog of task list {} reached {max} tasks",
                        self.id
                    )));
                }
            }

            if wait.is_zero() || ctx.is_cancelled() {
                state.inflight_writes += 1;
                None
            } else {
                Some(state.push_offer(PendingOffer { item, accepted }))
            }
        };

        let write = match offer_id {
            None => WriteGuard::adopt(self),
            Some(offer_id) => {
                let mut offer = OfferGuard::new(self, offer_id);
                let window = ctx.remaining().map_or(wait, |left| left.min(wait));
                tokio::select! {
                    _ = accepted_rx => {}
                    _ = tokio::time::sleep(window) => {}
                    _ = ctx.cancellation_token().cancelled() => {}
                    _ = self.shutdown.cancelled() => {}
                }
                if !offer.withdraw(true) {
                    debug!(task_list = %self.id, "Task matched during sync-match window");
                    return Ok(true);
                }
                WriteGuard::adopt(self)
            }
        };

        self.persist(&lease, info, write).await?;
        Ok(false)
    }

    async fn persist(
        &self,
        lease: &TaskListLease,
        info: TaskInfo,
        _write: WriteGuard<'_>,
    ) -> Result<i64, MatchingError> {
        match self.store.enqueue(&self.id, lease.range_id, info).await {
            Ok(task_id) => {
                {
                    let mut state = self.state.lock();
                    state.max_task_id = state.max_task_id.max(task_id);
                }
                self.reader_notify.notify_one();
                self.metrics
                    .inc_counter(Scope::TaskListManager, Counter::TasksPersisted);
                debug!(task_list = %self.id, task_id, "Task persisted to backlog");
                Ok(task_id)
            }
            Err(err @ StoreError::LeaseLost { .. }) => {
                warn!(task_list = %self.id, error = %err, "Lease lost while persisting task");
                self.stop(StopReason::Unloaded).await;
                Err(MatchingError::TaskListUnloaded(self.id.to_string()))
            }
            Err(err) => {
                warn!(task_list = %self.id, error = %err, "Failed to persist task");
                Err(err.into())
            }
        }
    }

    /// Long-poll for a task or query
    ///
    /// Timeout and cancellation are outcomes, not errors.
    #[instrument(skip(self, ctx), fields(task_list = %self.id))]
    pub async fn poll(
        self: &Arc<Self>,
        ctx: &RequestContext,
        identity: &str,
        poller_id: &str,
    ) -> Result<PollOutcome, MatchingError> {
        self.ensure_started().await?;
        let now = Utc::now();
        self.history.record(identity, now);

        let token = PollerToken::new(poller_id, identity);
        let cancel = token.cancellation().clone();
        let (slot, rx) = oneshot::channel();

        let seq = {
            let mut state = self.state.lock();
            if let Some(reason) = state.stopped {
                return Err(self.stopped_error(reason));
            }
            state.touch();

            let taken = state.take_available(now);
            self.record_expired(taken.expired);
            if let Some(item) = taken.item {
                let ack = self.complete_delivery(&mut state, &item);
                drop(state);
                return Ok(self.deliver(item, ack));
            }

            let seq = state.pollers.register(token, slot);
            if state.ack.read_level() < state.max_task_id {
                self.reader_notify.notify_one();
            }
            seq
        };
        trace!(task_list = %self.id, seq, "Poller waiting");

        let mut guard = PollGuard {
            manager: self,
            seq,
            rx,
            done: false,
        };

        let received = tokio::select! {
            item = &mut guard.rx => item.ok(),
            _ = ctx.expired() => None,
            _ = cancel.cancelled() => None,
            _ = ctx.cancellation_token().cancelled() => None,
            _ = self.shutdown.cancelled() => None,
        };

        let mut state = self.state.lock();
        let item = match received {
            Some(item) => Some(item),
            // A producer may have matched us between the wake-up and the lock
            None => match state.pollers.remove(seq) {
                Some(_) => None,
                None => guard.rx.try_recv().ok(),
            },
        };
        guard.done = true;

        if let Some(item) = item {
            let ack = self.complete_delivery(&mut state, &item);
            drop(state);
            return Ok(self.deliver(item, ack));
        }

        if let Some(reason) = state.stopped {
            return Err(self.stopped_error(reason));
        }
        if self.shutdown.is_cancelled() {
            return Err(MatchingError::ShuttingDown);
        }
        if cancel.is_cancelled() || ctx.is_cancelled() {
            self.metrics
                .inc_counter(Scope::TaskListManager, Counter::PollCanceled);
            debug!(task_list = %self.id, poller_id, "Poll canceled");
            return Ok(PollOutcome::Canceled);
        }
        if state.read_failure {
            return Err(MatchingError::InternalService(format!(
                "backlog of task list {} could not be read before the deadline",
                self.id
            )));
        }

        self.metrics
            .inc_counter(Scope::TaskListManager, Counter::PollTimeout);
        Ok(PollOutcome::Timeout)
    }

    /// Offer a query to a decision poller until the context ends
    ///
    /// Queries are never persisted. Returns whether a poller took it.
    #[instrument(skip(self, ctx, task), fields(task_list = %self.id, query_id = %task.query_id))]
    pub async fn offer_query(
        self: &Arc<Self>,
        ctx: &RequestContext,
        task: QueryTask,
    ) -> Result<bool, MatchingError> {
        self.ensure_started().await?;
        let (accepted, accepted_rx) = oneshot::channel();

        let offer_id = {
            let mut state = self.state.lock();
            if let Some(reason) = state.stopped {
                return Err(self.stopped_error(reason));
            }
            state.touch();
            match state.offer_to_poller(MatchedTask::Query(task)) {
                Ok(()) => return Ok(true),
                Err(item) => state.push_offer(PendingOffer { item, accepted }),
            }
        };

        let mut offer = OfferGuard::new(self, offer_id);
        tokio::select! {
            _ = accepted_rx => {}
            _ = ctx.expired() => {}
            _ = ctx.cancellation_token().cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
        Ok(!offer.withdraw(false))
    }

    /// Cancel the blocked poll registered under `poller_id`
    ///
    /// Returns whether such a poll was waiting; unknown IDs are not an error.
    pub fn cancel_poller(&self, poller_id: &str) -> bool {
        let cancelled = self.state.lock().pollers.cancel(poller_id);
        if cancelled {
            debug!(task_list = %self.id, poller_id, "Outstanding poll cancelled");
        }
        cancelled
    }

    /// Snapshot of pollers and, optionally, backlog cursors
    pub async fn describe(
        self: &Arc<Self>,
        include_status: bool,
    ) -> Result<DescribeTaskListResponse, MatchingError> {
        let lease = self.ensure_started().await?;
        let pollers = self.history.snapshot(Utc::now());
        let state = self.state.lock();

        let status = include_status.then(|| TaskListStatus {
            backlog_count_hint: state.backlog_estimate(),
            ack_level: state.ack.ack_level(),
            read_level: state.ack.read_level(),
            task_id_block: TaskIdBlock {
                start: (lease.range_id - 1) * self.config.range_size + 1,
                end: lease.range_id * self.config.range_size,
            },
        });

        Ok(DescribeTaskListResponse {
            pollers,
            outstanding_pollers: state.pollers.len(),
            status,
        })
    }

    /// Mark the manager unloaded if it has been idle long enough
    ///
    /// Refuses while pollers wait, offers are pending, store writes are in
    /// flight, or recovered items are queued. Once this returns true every
    /// new call on this instance fails with `TaskListUnloaded`.
    pub fn try_mark_unloaded(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.stopped.is_some() {
                return true;
            }
            if !state.pollers.is_empty()
                || state.pending_offers() > 0
                || state.inflight_writes > 0
                || !state.redelivery.is_empty()
                || state.last_activity.elapsed() < self.config.max_task_list_idle_time
            {
                return false;
            }
            state.stopped = Some(StopReason::Unloaded);
        }

        self.shutdown.cancel();
        self.metrics
            .inc_counter(Scope::TaskListManager, Counter::TaskListUnloaded);
        info!(task_list = %self.id, "Idle task list unloaded");
        true
    }

    /// Stop serving: fail waiting polls and stop the backlog reader
    ///
    /// Sync-matched tasks recovered from abandoned polls are persisted so
    /// they are not lost. On shutdown this also waits for producers still in
    /// their sync-match window or writing to the store, so the store can be
    /// closed once it returns.
    pub(crate) async fn stop(&self, reason: StopReason) {
        let (waiting, orphans) = {
            let mut state = self.state.lock();
            if state.stopped.is_some() {
                return;
            }
            state.stopped = Some(reason);
            let waiting = state.pollers.drain().len();
            let orphans: Vec<TaskInfo> = state
                .redelivery
                .drain(..)
                .filter_map(|item| match item {
                    MatchedTask::Task(PolledTask {
                        info,
                        source: TaskSource::SyncMatch,
                        ..
                    }) => Some(info),
                    _ => None,
                })
                .collect();
            (waiting, orphans)
        };
        self.shutdown.cancel();

        if let Some(lease) = self.lease.get() {
            for info in orphans {
                if let Err(err) = self.store.enqueue(&self.id, lease.range_id, info).await {
                    error!(task_list = %self.id, error = %err, "Dropping recovered task on stop");
                }
            }
        }

        // Lease loss stops the manager from inside a write, which must not wait on itself
        if reason == StopReason::Shutdown
            && tokio::time::timeout(WRITE_DRAIN_TIMEOUT, self.wait_for_writes())
                .await
                .is_err()
        {
            warn!(task_list = %self.id, "Gave up waiting for in-flight task writes");
        }

        self.metrics
            .inc_counter(Scope::TaskListManager, Counter::TaskListUnloaded);
        info!(task_list = %self.id, ?reason, waiting, "Task list stopped");
    }

    /// Wait until no producer holds an offer or a store write slot
    async fn wait_for_writes(&self) {
        loop {
            let drained = self.writes_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let state = self.state.lock();
                if state.inflight_writes == 0 && state.pending_offers() == 0 {
                    return;
                }
            }
            drained.await;
        }
    }

    /// Wake `wait_for_writes` once the last offer or write is released
    fn signal_if_drained(&self, state: &MatcherState) {
        if state.inflight_writes == 0 && state.pending_offers() == 0 {
            self.writes_drained.notify_waiters();
        }
    }

    fn stopped_error(&self, reason: StopReason) -> MatchingError {
        match reason {
            StopReason::Shutdown => MatchingError::ShuttingDown,
            StopReason::Unloaded => MatchingError::TaskListUnloaded(self.id.to_string()),
        }
    }

    /// Bookkeeping for an item about to be returned from a poll
    ///
    /// Returns the ack level to write, with a write slot already reserved.
    fn complete_delivery(&self, state: &mut MatcherState, item: &MatchedTask) -> Option<i64> {
        state.delivered(item);

        if state.buffer.len() < self.config.read_batch_size / 2
            && state.ack.read_level() < state.max_task_id
        {
            self.reader_notify.notify_one();
        }

        let level = state.take_ack_to_persist()?;
        state.inflight_writes += 1;
        Some(level)
    }

    fn deliver(self: &Arc<Self>, item: MatchedTask, ack: Option<i64>) -> PollOutcome {
        self.metrics
            .inc_counter(Scope::TaskListManager, Counter::PollSuccess);
        if let Some(level) = ack {
            self.spawn_ack_write(level);
        }
        PollOutcome::Matched(item)
    }

    fn flush_ack(self: &Arc<Self>) {
        let level = {
            let mut state = self.state.lock();
            match state.take_ack_to_persist() {
                Some(level) => {
                    state.inflight_writes += 1;
                    level
                }
                None => return,
            }
        };
        self.spawn_ack_write(level);
    }

    /// Write an ack level whose write slot is already reserved
    fn spawn_ack_write(self: &Arc<Self>, level: i64) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _write = WriteGuard::adopt(&manager);
            let Some(lease) = manager.lease.get() else {
                return;
            };
            match manager
                .store
                .ack_up_to(&manager.id, lease.range_id, level)
                .await
            {
                Ok(()) => trace!(task_list = %manager.id, level, "Ack level persisted"),
                Err(err @ StoreError::LeaseLost { .. }) => {
                    warn!(task_list = %manager.id, error = %err, "Lease lost while persisting ack level");
                    manager.stop(StopReason::Unloaded).await;
                }
                Err(err) => {
                    warn!(task_list = %manager.id, level, error = %err, "Failed to persist ack level");
                }
            }
        });
    }

    fn record_expired(&self, expired: u64) {
        if expired == 0 {
            return;
        }
        debug!(task_list = %self.id, expired, "Dropped expired backlog tasks");
        self.metrics
            .add_counter(Scope::TaskListManager, Counter::ExpiredTasks, expired);
    }

    async fn run_reader(self: Arc<Self>) {
        debug!(task_list = %self.id, "Backlog reader started");
        loop {
            tokio::select! {
                _ = self.reader_notify.notified() => {}
                _ = self.shutdown.cancelled() => break,
            }
            if !self.fill_buffer().await {
                break;
            }
        }
        debug!(task_list = %self.id, "Backlog reader stopped");
    }

    /// Read pages until the buffer is full or the backlog is drained
    ///
    /// Returns false once the manager is stopping.
    async fn fill_buffer(self: &Arc<Self>) -> bool {
        loop {
            let (from, room) = {
                let state = self.state.lock();
                if state.stopped.is_some() {
                    return false;
                }
                let room = self
                    .config
                    .read_batch_size
                    .saturating_sub(state.buffer.len());
                if room == 0 || state.ack.read_level() >= state.max_task_id {
                    return true;
                }
                (state.ack.read_level() + 1, room)
            };

            let Some(tasks) = self.read_with_retry(from, room).await else {
                return false;
            };
            let fetched = tasks.len();

            let expired = {
                let mut state = self.state.lock();
                for task in tasks {
                    if state.ack.add_task(task.task_id) {
                        state.buffer.push_back(task);
                    }
                }
                state.dispatch(Utc::now())
            };
            trace!(task_list = %self.id, from, fetched, "Backlog page read");
            self.record_expired(expired);
            self.flush_ack();

            if fetched < room {
                return true;
            }
        }
    }

    /// Read one page, retrying with backoff
    ///
    /// Returns `None` when the manager stops while waiting. Once the retry
    /// policy is exhausted an empty page is returned and the failure flag
    /// stays set until a later read succeeds.
    async fn read_with_retry(&self, from: i64, count: usize) -> Option<Vec<PersistedTask>> {
        let policy = &self.config.read_retry;
        let mut attempt = 1;
        loop {
            match self.store.read_range(&self.id, from, count).await {
                Ok(tasks) => {
                    self.state.lock().read_failure = false;
                    return Some(tasks);
                }
                Err(err) => {
                    self.state.lock().read_failure = true;
                    self.metrics
                        .inc_counter(Scope::TaskListManager, Counter::BacklogReadFailures);
                    warn!(task_list = %self.id, attempt, error = %err, "Backlog read failed");

                    if !policy.has_attempts_remaining(attempt) {
                        error!(task_list = %self.id, attempt, "Giving up on backlog read");
                        return Some(Vec::new());
                    }
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return None,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskListManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskListManager")
            .field("id", &self.id)
            .field("lease", &self.lease.get())
            .finish()
    }
}

/// Reserved store write; releases the slot when dropped
struct WriteGuard<'a> {
    manager: &'a TaskListManager,
}

impl<'a> WriteGuard<'a> {
    /// Take over a slot already counted in `inflight_writes`
    fn adopt(manager: &'a TaskListManager) -> Self {
        Self { manager }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        state.inflight_writes = state.inflight_writes.saturating_sub(1);
        self.manager.signal_if_drained(&state);
    }
}

/// Pending offer of a producer; withdrawn if the producer goes away
struct OfferGuard<'a> {
    manager: &'a TaskListManager,
    offer_id: Option<u64>,
}

impl<'a> OfferGuard<'a> {
    fn new(manager: &'a TaskListManager, offer_id: u64) -> Self {
        Self {
            manager,
            offer_id: Some(offer_id),
        }
    }

    /// Withdraw the offer; false if a poller took it first
    ///
    /// With `then_write`, a store write slot is reserved in the same step so
    /// the manager cannot be unloaded between withdrawal and persistence.
    fn withdraw(&mut self, then_write: bool) -> bool {
        let Some(offer_id) = self.offer_id.take() else {
            return false;
        };
        let mut state = self.manager.state.lock();
        let pending = state.remove_offer(offer_id).is_some();
        if pending && then_write {
            state.inflight_writes += 1;
        }
        self.manager.signal_if_drained(&state);
        pending
    }
}

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        if let Some(offer_id) = self.offer_id.take() {
            let mut state = self.manager.state.lock();
            state.remove_offer(offer_id);
            self.manager.signal_if_drained(&state);
        }
    }
}

/// Registration of a blocked poll; recovers work if the call is dropped
struct PollGuard<'a> {
    manager: &'a TaskListManager,
    seq: u64,
    rx: oneshot::Receiver<MatchedTask>,
    done: bool,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.manager.state.lock();
        if state.pollers.remove(self.seq).is_some() {
            return;
        }
        if let Ok(item) = self.rx.try_recv() {
            debug!(task_list = %self.manager.id, "Requeueing task from abandoned poll");
            state.requeue(item);
            state.dispatch(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::persistence::InMemoryTaskStore;
    use crate::types::{TaskListKind, WorkflowExecution};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        metrics: Arc<InMemoryMetrics>,
        manager: Arc<TaskListManager>,
    }

    fn fixture(config: MatchingConfig) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = TaskListManager::new(
            TaskListId::new("d", "tl", TaskListKind::Activity),
            Arc::new(config),
            store.clone(),
            metrics.clone(),
            CancellationToken::new(),
        );
        Fixture {
            store,
            metrics,
            manager,
        }
    }

    fn info(schedule_id: i64) -> TaskInfo {
        TaskInfo {
            domain_id: "d".into(),
            execution: WorkflowExecution::new("wf", "run"),
            schedule_id,
            created_at: Utc::now(),
            schedule_to_start_timeout: None,
        }
    }

    fn schedule_id(outcome: PollOutcome) -> i64 {
        match outcome {
            PollOutcome::Matched(MatchedTask::Task(task)) => task.info.schedule_id,
            other => panic!("expected a task, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_without_poller_persists_after_window() {
        let f = fixture(MatchingConfig::default());
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));

        let matched = f.manager.add_task(&ctx, info(1)).await.unwrap();
        assert!(!matched);
        assert_eq!(f.store.write_count(), 1);
        assert_eq!(f.metrics.counter(Scope::TaskListManager, Counter::TasksPersisted), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_poller_gets_task_without_write() {
        let f = fixture(MatchingConfig::default());
        let manager = Arc::clone(&f.manager);
        let poll = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(10));
            manager.poll(&ctx, "worker", "p1").await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        assert!(f.manager.add_task(&ctx, info(7)).await.unwrap());
        assert_eq!(schedule_id(poll.await.unwrap().unwrap()), 7);
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_arriving_during_window_takes_offer() {
        let f = fixture(MatchingConfig::default().with_sync_match_wait(Duration::from_secs(1)));
        let manager = Arc::clone(&f.manager);
        let add = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(5));
            manager.add_task(&ctx, info(3)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let outcome = f.manager.poll(&ctx, "worker", "p1").await.unwrap();
        assert_eq!(schedule_id(outcome), 3);
        assert!(add.await.unwrap().unwrap());
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_is_served_in_order_and_acked() {
        let f = fixture(MatchingConfig::default().with_sync_match_wait(Duration::ZERO));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        for i in 1..=3 {
            assert!(!f.manager.add_task(&ctx, info(i)).await.unwrap());
        }

        for expected in 1..=3 {
            let ctx = RequestContext::with_timeout(Duration::from_secs(5));
            let outcome = f.manager.poll(&ctx, "worker", "").await.unwrap();
            assert_eq!(schedule_id(outcome), expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = f.manager.describe(true).await.unwrap().status.unwrap();
        assert_eq!(status.ack_level, 3);
        assert_eq!(status.read_level, 3);
        assert_eq!(f.store.ack_level(f.manager.id()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_and_cancel() {
        let f = fixture(MatchingConfig::default());
        let ctx = RequestContext::with_timeout(Duration::from_secs(2));
        let outcome = f.manager.poll(&ctx, "worker", "p1").await.unwrap();
        assert_eq!(outcome, PollOutcome::Timeout);

        let manager = Arc::clone(&f.manager);
        let poll = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(60));
            manager.poll(&ctx, "worker", "p2").await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.manager.cancel_poller("p2"));
        assert_eq!(poll.await.unwrap().unwrap(), PollOutcome::Canceled);
        assert!(!f.manager.cancel_poller("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_added_right_after_cancel_is_persisted() {
        let f = fixture(MatchingConfig::default());
        let manager = Arc::clone(&f.manager);
        let poll = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(60));
            manager.poll(&ctx, "worker", "p1").await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The poll task has not run since the cancel
        assert!(f.manager.cancel_poller("p1"));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        assert!(!f.manager.add_task(&ctx, info(42)).await.unwrap());

        assert_eq!(poll.await.unwrap().unwrap(), PollOutcome::Canceled);
        assert_eq!(f.store.write_count(), 1);
        let backlog = f.store.read_range(f.manager.id(), 0, 10).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].info.schedule_id, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_dispatch_skips_canceled_poller() {
        let f = fixture(MatchingConfig::default());
        let manager = Arc::clone(&f.manager);
        let poll = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(60));
            manager.poll(&ctx, "worker", "p1").await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(f.manager.cancel_poller("p1"));
        {
            let mut state = f.manager.state.lock();
            state.max_task_id = 1;
            state.ack.add_task(1);
            state.buffer.push_back(PersistedTask {
                task_id: 1,
                info: info(42),
            });
            state.dispatch(Utc::now());
            assert_eq!(state.buffer.len(), 1);
            assert_eq!(state.ack.ack_level(), 0);
        }

        assert_eq!(poll.await.unwrap().unwrap(), PollOutcome::Canceled);
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let outcome = f.manager.poll(&ctx, "worker", "p2").await.unwrap();
        assert_eq!(schedule_id(outcome), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_poll_requeues_task() {
        let f = fixture(MatchingConfig::default());
        let manager = Arc::clone(&f.manager);
        let poll = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(60));
            manager.poll(&ctx, "worker", "p1").await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Hand the task over while the poll task cannot run, then drop it
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        {
            let mut state = f.manager.state.lock();
            let item = MatchedTask::Task(PolledTask {
                task_id: None,
                info: info(5),
                source: TaskSource::SyncMatch,
            });
            assert!(state.offer_to_poller(item).is_ok());
        }
        poll.abort();
        let _ = poll.await;

        let outcome = f.manager.poll(&ctx, "worker", "p2").await.unwrap();
        assert_eq!(schedule_id(outcome), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_task_in_window() {
        let f = fixture(MatchingConfig::default().with_sync_match_wait(Duration::from_secs(1)));
        let manager = Arc::clone(&f.manager);
        let add = tokio::spawn(async move {
            let ctx = RequestContext::with_timeout(Duration::from_secs(5));
            manager.add_task(&ctx, info(3)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.manager.stop(StopReason::Shutdown).await;
        f.store.close().await;

        assert!(!add.await.unwrap().unwrap());
        assert_eq!(f.store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_unload() {
        let f = fixture(
            MatchingConfig::default().with_max_task_list_idle_time(Duration::from_secs(30)),
        );
        f.manager.ensure_started().await.unwrap();
        assert!(!f.manager.try_mark_unloaded());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(f.manager.try_mark_unloaded());

        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let err = f.manager.add_task(&ctx, info(1)).await.unwrap_err();
        assert!(matches!(err, MatchingError::TaskListUnloaded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_id_block() {
        let f = fixture(MatchingConfig::default());
        let describe = f.manager.describe(true).await.unwrap();
        let block = describe.status.unwrap().task_id_block;
        assert_eq!(block.start, 1);
        assert_eq!(block.end, 100_000);
        assert!(f.manager.describe(false).await.unwrap().status.is_none());
    }
}
