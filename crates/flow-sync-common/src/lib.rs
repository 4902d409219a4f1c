//! Shared orchestration plumbing for the flowsync daemons.
//!
//! Small building blocks used by every subsystem of the agent:
//!
//! - [`TaskStatus`] / [`TaskError`]: classification of processing outcomes,
//!   including the dependency-wait and retry states the sync layer relies on
//! - [`RefMap`]: a keyed registry with explicit reference counting that
//!   never auto-creates entries

mod ref_map;
mod task;

pub use ref_map::{HasRefCount, RefMap, RefMapError};
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
