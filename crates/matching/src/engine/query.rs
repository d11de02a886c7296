//! Correlation of in-flight queries with their answers

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::MatchingError;
use crate::types::QueryResult;

/// Pending `QueryWorkflow` calls keyed by query ID
///
/// Each entry is single-use: whoever removes it first (the responder or the
/// timing-out caller) decides the outcome.
#[derive(Debug, Default)]
pub struct QueryDispatchTable {
    pending: DashMap<String, oneshot::Sender<QueryResult>>,
}

impl QueryDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh query ID and the channel its answer arrives on
    pub fn register(&self) -> (String, oneshot::Receiver<QueryResult>) {
        let query_id = Uuid::now_v7().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(query_id.clone(), tx);
        (query_id, rx)
    }

    /// Deliver the answer to a pending query
    ///
    /// Unknown, already answered, and timed-out query IDs are
    /// `EntityNotExists`.
    pub fn resolve(&self, query_id: &str, result: QueryResult) -> Result<(), MatchingError> {
        let (_, tx) = self.pending.remove(query_id).ok_or_else(|| {
            MatchingError::EntityNotExists(format!("query {query_id} not found or already answered"))
        })?;
        // The caller may have been dropped; the entry is consumed either way
        let _ = tx.send(result);
        Ok(())
    }

    /// Remove an entry; true if it was still pending
    pub fn remove(&self, query_id: &str) -> bool {
        self.pending.remove(query_id).is_some()
    }

    /// Drop every pending entry, waking their callers
    pub fn fail_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Removes a query's entry when the waiting call ends, however it ends
pub(crate) struct QueryRegistration<'a> {
    pub table: &'a QueryDispatchTable,
    pub query_id: String,
}

impl Drop for QueryRegistration<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.query_id);
    }
}
