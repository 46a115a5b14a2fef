//! # prefork
//!
//! A forking work-dispatch supervisor: a long-lived parent process that
//! spawns, tracks, and reaps short-lived worker processes executing
//! user-supplied work, plus long-lived helper processes respawned on death.
//!
//! Work is partitioned into independently configured queues ("buckets").
//! The supervisor extracts bounded batches off a bucket's queue, forks a
//! worker per batch, and collects results over a per-child framed channel
//! (a 4-byte big-endian length prefix followed by a serde_json payload).
//! Signal handlers never mutate bookkeeping directly: they latch flags that
//! the main flow drains into ordinary reap/hangup/shutdown calls.
//!
//! ```no_run
//! use prefork::{Supervisor, SupervisorConfig, WorkBatch, DEFAULT_BUCKET};
//! use serde_json::json;
//!
//! fn main() -> prefork::Result<()> {
//!     let mut sup = Supervisor::new(SupervisorConfig::default())?;
//!     sup.set_store_result(true);
//!     sup.set_max_children(DEFAULT_BUCKET, 2)?;
//!     sup.set_max_work_per_child(DEFAULT_BUCKET, 3)?;
//!
//!     sup.register_child_run(DEFAULT_BUCKET, |batch: &WorkBatch| {
//!         // Runs in a forked child; the return value travels back to the
//!         // parent as one frame.
//!         match batch {
//!             WorkBatch::Items(items) => Some(json!({"processed": items.len()})),
//!             _ => None,
//!         }
//!     })?;
//!
//!     sup.add_work((1..=7).map(|n| json!(n)).collect(), None, DEFAULT_BUCKET, false)?;
//!     sup.process_work(true, DEFAULT_BUCKET, false)?;
//!
//!     while let Some(result) = sup.get_result(DEFAULT_BUCKET, None)? {
//!         println!("worker reported: {result}");
//!     }
//!     Ok(())
//! }
//! ```

mod bucket;
mod callback;
mod channel;
mod child;
mod error;
pub mod logging;
mod signals;
mod supervisor;

pub use bucket::{BucketConfig, DEFAULT_BUCKET, RunLimit, WorkBatch, WorkItem};
pub use callback::Severity;
pub use child::ChildStatus;
pub use error::{PreforkError, Result};
pub use supervisor::{Supervisor, SupervisorConfig};

// The public surface speaks in OS process ids and signals.
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
