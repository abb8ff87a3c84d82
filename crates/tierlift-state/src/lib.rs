//! tierlift-state — version registry and job outcome history.
//!
//! Backed by [redb](https://docs.rs/redb), holds the applications known to
//! the orchestrator (tier, deployments, pending change, job status), the
//! current system version, and the append-only history of job outcomes the
//! confidence computation reads.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Outcome keys are prefixed by version (`{version}/{application}/{job}/{number}`)
//! so the history of one candidate version is a prefix scan, and history for
//! superseded versions can be dropped wholesale.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! It performs no locking of its own across read-modify-write sequences;
//! callers serialize those.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, epoch_secs};
pub use types::*;
