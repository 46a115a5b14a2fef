//! Callback slots and the user-facing log sink.
//!
//! Every hook the supervisor can invoke is an explicit `Option<Arc<dyn Fn>>`
//! slot. Registration stores a value or it doesn't; there is no name-based
//! resolution step, so a registered callback is always invocable. Slots that
//! are contractually required emit a [`Severity::Crit`] event when empty and
//! the invocation becomes a no-op.

use std::fmt;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde_json::Value;

use crate::bucket::WorkBatch;

/// Executes one batch inside a freshly forked worker. A `Some` return value
/// is framed and sent to the parent.
pub type ChildRunFn = Arc<dyn Fn(&WorkBatch) -> Option<Value> + Send + Sync>;

/// Runs in a child when it receives an exit request; argument is the bucket id.
pub type ChildExitFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs in a child on hangup; argument is the bucket id.
pub type ChildHupFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs in the parent when a child overruns its bucket's run limit.
pub type ChildTimeoutFn = Arc<dyn Fn(Pid, &str) + Send + Sync>;

/// Resource-cleanup hook run in the parent immediately before every fork.
pub type PreforkFn = Arc<dyn Fn() + Send + Sync>;

/// Runs in the parent right after a worker fork; `(pid, identifier)`.
pub type ParentForkFn = Arc<dyn Fn(Pid, &str) + Send + Sync>;

/// Runs in the parent on hangup.
pub type ParentHupFn = Arc<dyn Fn() + Send + Sync>;

/// Runs in the parent when a worker has been reaped; `(pid, identifier)`.
pub type ParentChildExitedFn = Arc<dyn Fn(Pid, &str) + Send + Sync>;

/// Receives result frames when result storage is disabled; `(pid, value)`.
pub type ParentResultsFn = Arc<dyn Fn(Pid, &Value) + Send + Sync>;

/// Runs when the supervisor finishes a blocking pass or shuts down on a
/// signal; `(parent_pid, signal)`.
pub type ParentExitFn = Arc<dyn Fn(Pid, Option<Signal>) + Send + Sync>;

/// Long-lived helper body; receives the arguments captured at spawn time.
pub type HelperFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// User log sink; receives supervisor events at or above the registered
/// severity.
pub type LogSinkFn = Arc<dyn Fn(Severity, &str) + Send + Sync>;

/// Severity of a supervisor event delivered to the registered log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Crit,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Crit => write!(f, "crit"),
        }
    }
}

/// A registered log sink with its severity floor.
#[derive(Clone)]
pub(crate) struct LogSink {
    pub sink: LogSinkFn,
    pub min_severity: Severity,
}

/// The per-bucket callback slots.
///
/// Cloning shares the underlying callbacks; a new bucket starts from a clone
/// of the default bucket's slots and diverges from there.
#[derive(Clone, Default)]
pub struct BucketCallbacks {
    pub(crate) child_run: Option<ChildRunFn>,
    pub(crate) child_exit: Option<ChildExitFn>,
    pub(crate) child_sighup: Option<ChildHupFn>,
    pub(crate) child_timeout: Option<ChildTimeoutFn>,
    pub(crate) parent_fork: Option<ParentForkFn>,
    pub(crate) parent_child_exited: Option<ParentChildExitedFn>,
    pub(crate) parent_results: Option<ParentResultsFn>,
}

impl fmt::Debug for BucketCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketCallbacks")
            .field("child_run", &self.child_run.is_some())
            .field("child_exit", &self.child_exit.is_some())
            .field("child_sighup", &self.child_sighup.is_some())
            .field("child_timeout", &self.child_timeout.is_some())
            .field("parent_fork", &self.parent_fork.is_some())
            .field("parent_child_exited", &self.parent_child_exited.is_some())
            .field("parent_results", &self.parent_results.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Crit);
    }

    #[test]
    fn test_cloned_slots_share_callbacks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();

        let mut defaults = BucketCallbacks::default();
        defaults.child_exit = Some(Arc::new(move |_bucket| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        let derived = defaults.clone();
        (derived.child_exit.as_ref().unwrap())("default");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Replacing the derived slot must not affect the original.
        let mut derived = derived;
        derived.child_exit = None;
        assert!(defaults.child_exit.is_some());
    }
}
