//! Blocked poll calls and recently seen pollers

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::types::{MatchedTask, PollerInfo};

/// One blocked long-poll call
#[derive(Debug, Clone)]
pub struct PollerToken {
    pub poller_id: String,
    pub identity: String,
    pub registered_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl PollerToken {
    pub fn new(poller_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            poller_id: poller_id.into(),
            identity: identity.into(),
            registered_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Wake the blocked call with a canceled outcome; idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A registered poller and the single-slot channel it waits on
#[derive(Debug)]
pub(crate) struct WaitingPoller {
    pub token: PollerToken,
    pub slot: oneshot::Sender<MatchedTask>,
}

/// Live poller tokens of one task list
///
/// Pollers are served in arrival order. Lookup by poller ID is O(1) so
/// `CancelOutstandingPoll` does not scan the set. Not thread-safe on its
/// own; the task list manager keeps it under its matcher lock.
#[derive(Debug, Default)]
pub(crate) struct OutstandingPollers {
    next_seq: u64,
    order: VecDeque<u64>,
    waiting: HashMap<u64, WaitingPoller>,
    by_poller_id: HashMap<String, u64>,
}

impl OutstandingPollers {
    /// Add a poller; returns its registration sequence
    pub fn register(&mut self, token: PollerToken, slot: oneshot::Sender<MatchedTask>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        if !token.poller_id.is_empty() {
            self.by_poller_id.insert(token.poller_id.clone(), seq);
        }
        self.order.push_back(seq);
        self.waiting.insert(seq, WaitingPoller { token, slot });
        seq
    }

    /// Remove a poller by sequence; `None` if it was already matched or removed
    pub fn remove(&mut self, seq: u64) -> Option<WaitingPoller> {
        let poller = self.waiting.remove(&seq)?;
        self.unindex(&poller.token.poller_id, seq);
        Some(poller)
    }

    /// Take the longest-waiting poller that has not been canceled
    pub fn pop_next(&mut self) -> Option<WaitingPoller> {
        while let Some(seq) = self.order.pop_front() {
            if let Some(poller) = self.waiting.remove(&seq) {
                self.unindex(&poller.token.poller_id, seq);
                if poller.token.is_cancelled() {
                    continue;
                }
                return Some(poller);
            }
        }
        None
    }

    /// Unregister the poller with the given ID and wake it as canceled
    ///
    /// The poller leaves the set before its token fires, so no producer can
    /// match it afterwards. Returns whether a matching poller was waiting.
    pub fn cancel(&mut self, poller_id: &str) -> bool {
        let Some(seq) = self.by_poller_id.get(poller_id).copied() else {
            return false;
        };
        match self.remove(seq) {
            Some(poller) => {
                poller.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Remove every poller, dropping their slots
    pub fn drain(&mut self) -> Vec<WaitingPoller> {
        self.order.clear();
        self.by_poller_id.clear();
        self.waiting.drain().map(|(_, poller)| poller).collect()
    }

    fn unindex(&mut self, poller_id: &str, seq: u64) {
        if self.by_poller_id.get(poller_id) == Some(&seq) {
            self.by_poller_id.remove(poller_id);
        }
    }
}

/// Pollers seen recently on a task list, for `DescribeTaskList`
#[derive(Debug)]
pub struct PollerHistory {
    ttl: Duration,
    capacity: usize,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PollerHistory {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a poll from `identity`
    pub fn record(&self, identity: &str, now: DateTime<Utc>) {
        let mut seen = self.seen.lock();
        if !seen.contains_key(identity) && seen.len() >= self.capacity {
            self.prune(&mut seen, now);
            if seen.len() >= self.capacity {
                let oldest = seen
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    seen.remove(&oldest);
                }
            }
        }
        seen.insert(identity.to_string(), now);
    }

    /// Pollers seen within the TTL, most recent first
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<PollerInfo> {
        let mut seen = self.seen.lock();
        self.prune(&mut seen, now);
        let mut pollers: Vec<_> = seen
            .iter()
            .map(|(identity, at)| PollerInfo {
                identity: identity.clone(),
                last_access_time: *at,
            })
            .collect();
        pollers.sort_by(|a, b| {
            b.last_access_time
                .cmp(&a.last_access_time)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        pollers
    }

    fn prune(&self, seen: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return;
        };
        seen.retain(|_, at| *at + ttl > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(pollers: &mut OutstandingPollers, id: &str) -> (u64, oneshot::Receiver<MatchedTask>) {
        let (tx, rx) = oneshot::channel();
        (pollers.register(PollerToken::new(id, "worker"), tx), rx)
    }

    #[test]
    fn test_fifo_order_and_removal() {
        let mut pollers = OutstandingPollers::default();
        let (a, _ra) = register(&mut pollers, "a");
        let (b, _rb) = register(&mut pollers, "b");
        let (_c, _rc) = register(&mut pollers, "c");

        assert!(pollers.remove(a).is_some());
        assert!(pollers.remove(a).is_none());

        let next = pollers.pop_next().unwrap();
        assert_eq!(next.token.poller_id, "b");
        assert!(pollers.remove(b).is_none());
        assert_eq!(pollers.len(), 1);
    }

    #[test]
    fn test_cancel_by_poller_id() {
        let mut pollers = OutstandingPollers::default();
        let (seq, mut rx) = register(&mut pollers, "p1");

        assert!(!pollers.cancel("unknown"));
        assert!(pollers.cancel("p1"));
        assert!(!pollers.cancel("p1"));

        assert!(pollers.remove(seq).is_none());
        assert!(pollers.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_canceled_poller_is_never_popped() {
        let mut pollers = OutstandingPollers::default();
        let (_a, _ra) = register(&mut pollers, "a");
        let (_b, _rb) = register(&mut pollers, "b");

        assert!(pollers.cancel("a"));
        assert_eq!(pollers.pop_next().unwrap().token.poller_id, "b");
        assert!(pollers.pop_next().is_none());
    }

    #[test]
    fn test_reused_poller_id_tracks_latest() {
        let mut pollers = OutstandingPollers::default();
        let (first, _r1) = register(&mut pollers, "p");
        let (second, _r2) = register(&mut pollers, "p");

        pollers.remove(first);
        assert!(pollers.cancel("p"));
        assert!(pollers.remove(second).is_none());
        assert!(pollers.is_empty());
    }

    #[test]
    fn test_history_ttl_and_capacity() {
        let history = PollerHistory::new(Duration::from_secs(60), 2);
        let t0 = Utc::now();
        history.record("w1", t0);
        history.record("w2", t0 + chrono::Duration::seconds(1));
        history.record("w3", t0 + chrono::Duration::seconds(2));

        let identities: Vec<_> = history
            .snapshot(t0 + chrono::Duration::seconds(3))
            .into_iter()
            .map(|p| p.identity)
            .collect();
        assert_eq!(identities, vec!["w3", "w2"]);

        assert!(history
            .snapshot(t0 + chrono::Duration::seconds(120))
            .is_empty());
    }
}
