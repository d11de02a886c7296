//! Matching engine
//!
//! The engine module provides the [`MatchingEngine`], which routes every
//! operation to the [`TaskListManager`](crate::tasklist::TaskListManager)
//! of its task list, creating managers on demand and evicting idle ones.

mod matching;
mod query;
mod registry;

pub use matching::MatchingEngine;
pub use query::QueryDispatchTable;
pub use registry::TaskListRegistry;
