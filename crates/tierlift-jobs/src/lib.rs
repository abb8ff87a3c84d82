//! tierlift job queue — the boundary to the system that runs deployment jobs.
//!
//! The orchestrator never runs jobs itself. It submits them through the
//! [`JobQueue`] trait, cancels them best-effort, and learns of their results
//! through completion reports delivered at least once.
//!
//! # Components
//!
//! - **`queue`** — The `JobQueue` trait and its error type
//! - **`memory`** — In-memory queue with a retry budget, for tests and simulation

pub mod memory;
pub mod queue;

pub use memory::InMemoryJobQueue;
pub use queue::{CancelAck, JobQueue, JobQueueError, JobQueueResult};
