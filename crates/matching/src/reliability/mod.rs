//! Reliability helpers
//!
//! - [`RetryPolicy`] - exponential backoff with jitter, used when the backlog
//!   reader cannot reach the task store

mod retry;

pub use retry::RetryPolicy;
