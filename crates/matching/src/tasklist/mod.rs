//! Per-task-list matching
//!
//! This module provides:
//! - [`TaskListManager`] owning the rendezvous and backlog of one task list
//! - [`PollerToken`] and [`PollerHistory`] for poller bookkeeping
//! - the read/ack cursor tracking of the durable backlog

mod ack;
mod manager;
mod matcher;
mod pollers;

pub use manager::TaskListManager;
pub(crate) use matcher::StopReason;
pub use pollers::{PollerHistory, PollerToken};
