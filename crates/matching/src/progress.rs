//! Progress checkpointing for long-running task handlers
//!
//! A handler that processes a task in many steps records its progress
//! through a [`ProgressManager`] so that a retry can resume where the last
//! attempt stopped. The manager is passed to the handler explicitly.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Payload sent with every recorded checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatPayload {
    pub details: serde_json::Value,
}

/// Error from progress operations
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Heartbeat channel closed (task abandoned or timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    #[error("task was cancelled")]
    Cancelled,
}

/// Records and restores the progress of one task
#[async_trait]
pub trait ProgressManager: Send + Sync {
    /// Persist a checkpoint
    async fn record_progress(&self, details: serde_json::Value) -> Result<(), ProgressError>;

    /// Most recent checkpoint, if any
    async fn load_progress(&self) -> Result<Option<serde_json::Value>, ProgressError>;
}

/// Typed wrappers over any [`ProgressManager`]
#[async_trait]
pub trait ProgressManagerExt: ProgressManager {
    async fn record<T>(&self, progress: &T) -> Result<(), ProgressError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.record_progress(serde_json::to_value(progress)?).await
    }

    async fn load<T>(&self) -> Result<Option<T>, ProgressError>
    where
        T: DeserializeOwned + Send,
    {
        match self.load_progress().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<M: ProgressManager + ?Sized> ProgressManagerExt for M {}

/// Progress recorded as heartbeats on a channel
///
/// Details from the previous attempt are seeded with
/// [`with_previous_details`](Self::with_previous_details) and returned by
/// `load_progress` until the first new checkpoint is recorded.
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = mpsc::channel(16);
/// let progress = HeartbeatProgressManager::new(tx);
///
/// for page in start..end {
///     archive_page(page).await?;
///     progress.record(&Checkpoint { page }).await?;
/// }
/// ```
#[derive(Debug)]
pub struct HeartbeatProgressManager {
    heartbeat_tx: mpsc::Sender<HeartbeatPayload>,
    last_details: Mutex<Option<serde_json::Value>>,
    cancellation: CancellationToken,
}

impl HeartbeatProgressManager {
    pub fn new(heartbeat_tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        Self {
            heartbeat_tx,
            last_details: Mutex::new(None),
            cancellation: CancellationToken::new(),
        }
    }

    /// Details carried over from a previous attempt
    pub fn with_previous_details(self, details: serde_json::Value) -> Self {
        *self.last_details.lock() = Some(details);
        self
    }

    /// Stop accepting checkpoints when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[async_trait]
impl ProgressManager for HeartbeatProgressManager {
    async fn record_progress(&self, details: serde_json::Value) -> Result<(), ProgressError> {
        if self.is_cancelled() {
            return Err(ProgressError::Cancelled);
        }

        self.heartbeat_tx
            .send(HeartbeatPayload {
                details: details.clone(),
            })
            .await
            .map_err(|_| ProgressError::ChannelClosed)?;

        *self.last_details.lock() = Some(details);
        Ok(())
    }

    async fn load_progress(&self) -> Result<Option<serde_json::Value>, ProgressError> {
        Ok(self.last_details.lock().clone())
    }
}

/// Progress kept in memory, shareable across attempts
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgressManager {
    details: Arc<Mutex<Option<serde_json::Value>>>,
}

impl InMemoryProgressManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressManager for InMemoryProgressManager {
    async fn record_progress(&self, details: serde_json::Value) -> Result<(), ProgressError> {
        *self.details.lock() = Some(details);
        Ok(())
    }

    async fn load_progress(&self) -> Result<Option<serde_json::Value>, ProgressError> {
        Ok(self.details.lock().clone())
    }
}
