//! Persistence layer for queued tasks
//!
//! This module provides:
//! - [`TaskStore`] trait for the durable per-task-list backlog
//! - [`InMemoryTaskStore`] for testing and single-process deployments

mod memory;
mod store;

pub use memory::InMemoryTaskStore;
pub use store::{StoreError, TaskListLease, TaskStore};
