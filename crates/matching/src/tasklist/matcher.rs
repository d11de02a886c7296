//! Rendezvous state of one task list
//!
//! Everything that decides who gets which task lives in [`MatcherState`] and
//! is only touched under the manager's matcher lock. That makes each of
//! "hand to poller", "leave as pending offer", "buffer", and "unregister
//! poller" a single atomic step.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::ack::AckManager;
use super::pollers::OutstandingPollers;
use crate::types::{MatchedTask, PersistedTask, PolledTask, TaskSource};

/// Why a manager stopped serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// Engine shutdown
    Shutdown,
    /// Evicted or lost its lease; callers should re-resolve
    Unloaded,
}

/// A producer's item waiting for a poller during its sync-match window
#[derive(Debug)]
pub(crate) struct PendingOffer {
    pub item: MatchedTask,
    pub accepted: oneshot::Sender<()>,
}

/// Work handed to a poll call by [`MatcherState::take_available`]
#[derive(Debug)]
pub(crate) struct Taken {
    pub item: Option<MatchedTask>,
    /// Backlog tasks skipped because they expired while queued
    pub expired: u64,
}

#[derive(Debug)]
pub(crate) struct MatcherState {
    pub stopped: Option<StopReason>,
    pub pollers: OutstandingPollers,
    next_offer: u64,
    offers: BTreeMap<u64, PendingOffer>,
    /// Backlog tasks read from the store, ascending by task ID
    pub buffer: VecDeque<PersistedTask>,
    /// Items recovered from abandoned poll calls
    pub redelivery: VecDeque<MatchedTask>,
    pub ack: AckManager,
    /// Highest task ID assigned by the store, as far as this manager knows
    pub max_task_id: i64,
    /// Ack level last written to the store
    pub persisted_ack_level: i64,
    /// Store writes currently in progress
    pub inflight_writes: usize,
    /// Set while the backlog reader is failing
    pub read_failure: bool,
    pub last_activity: Instant,
}

impl MatcherState {
    pub fn new() -> Self {
        Self {
            stopped: None,
            pollers: OutstandingPollers::default(),
            next_offer: 0,
            offers: BTreeMap::new(),
            buffer: VecDeque::new(),
            redelivery: VecDeque::new(),
            ack: AckManager::default(),
            max_task_id: 0,
            persisted_ack_level: 0,
            inflight_writes: 0,
            read_failure: false,
            last_activity: Instant::now(),
        }
    }

    /// Reset cursors from a fresh lease
    pub fn load(&mut self, ack_level: i64, max_task_id: i64) {
        self.ack = AckManager::new(ack_level);
        self.persisted_ack_level = ack_level;
        self.max_task_id = max_task_id;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Hand an item to the longest-waiting poller
    ///
    /// Gives the item back if no poller is waiting.
    pub fn offer_to_poller(&mut self, mut item: MatchedTask) -> Result<(), MatchedTask> {
        while let Some(poller) = self.pollers.pop_next() {
            match poller.slot.send(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
        }
        Err(item)
    }

    pub fn push_offer(&mut self, offer: PendingOffer) -> u64 {
        self.next_offer += 1;
        self.offers.insert(self.next_offer, offer);
        self.next_offer
    }

    /// Withdraw a pending offer; `None` means a poller already took it
    pub fn remove_offer(&mut self, id: u64) -> Option<PendingOffer> {
        self.offers.remove(&id)
    }

    pub fn pending_offers(&self) -> usize {
        self.offers.len()
    }

    /// Work available right now, in priority order: recovered items,
    /// pending producer offers, then the backlog buffer
    ///
    /// Expired backlog tasks passed over on the way are acked and counted.
    pub fn take_available(&mut self, now: DateTime<Utc>) -> Taken {
        if let Some(item) = self.redelivery.pop_front() {
            return Taken {
                item: Some(item),
                expired: 0,
            };
        }

        if let Some((_, offer)) = self.offers.pop_first() {
            // The producer may have given up an instant ago; its receiver is
            // gone but the item is still deliverable.
            let _ = offer.accepted.send(());
            return Taken {
                item: Some(offer.item),
                expired: 0,
            };
        }

        let mut expired = 0;
        let item = self.pop_buffered(now, &mut expired).map(backlog_item);
        Taken { item, expired }
    }

    /// Hand buffered and recovered work to waiting pollers
    ///
    /// Returns the number of expired backlog tasks skipped.
    pub fn dispatch(&mut self, now: DateTime<Utc>) -> u64 {
        let mut expired = 0;
        while !self.pollers.is_empty() {
            let item = match self.redelivery.pop_front() {
                Some(item) => item,
                None => match self.pop_buffered(now, &mut expired) {
                    Some(task) => backlog_item(task),
                    None => break,
                },
            };
            if let Err(item) = self.offer_to_poller(item) {
                self.requeue(item);
                break;
            }
        }
        expired
    }

    /// Put back an item whose poll call went away
    pub fn requeue(&mut self, item: MatchedTask) {
        match item {
            MatchedTask::Task(PolledTask {
                task_id: Some(task_id),
                info,
                source: TaskSource::Backlog,
            }) => self.buffer.push_front(PersistedTask { task_id, info }),
            other => self.redelivery.push_front(other),
        }
    }

    /// Record delivery of an item; backlog tasks advance the ack cursor
    pub fn delivered(&mut self, item: &MatchedTask) {
        if let MatchedTask::Task(PolledTask {
            task_id: Some(task_id),
            source: TaskSource::Backlog,
            ..
        }) = item
        {
            self.ack.ack(*task_id);
        }
    }

    /// New ack level to write to the store, if it moved
    pub fn take_ack_to_persist(&mut self) -> Option<i64> {
        let level = self.ack.ack_level();
        if level > self.persisted_ack_level {
            self.persisted_ack_level = level;
            Some(level)
        } else {
            None
        }
    }

    /// Rough number of tasks in the store not yet delivered
    ///
    /// Unread IDs are counted as tasks, so gaps left by failed writes make
    /// this an overestimate.
    pub fn backlog_estimate(&self) -> u64 {
        let unread = (self.max_task_id - self.ack.read_level()).max(0) as u64;
        unread + self.ack.backlog_count_hint()
    }

    fn pop_buffered(&mut self, now: DateTime<Utc>, expired: &mut u64) -> Option<PersistedTask> {
        while let Some(task) = self.buffer.pop_front() {
            if task.info.is_expired_at(now) {
                self.ack.ack(task.task_id);
                *expired += 1;
                continue;
            }
            return Some(task);
        }
        None
    }
}

fn backlog_item(task: PersistedTask) -> MatchedTask {
    MatchedTask::Task(PolledTask {
        task_id: Some(task.task_id),
        info: task.info,
        source: TaskSource::Backlog,
    })
}
