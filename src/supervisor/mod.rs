//! The supervisor: a long-lived parent process that forks, tracks, and reaps
//! children executing bucketed work.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │  Parent process  │
//!                  │   (Supervisor)   │
//!                  └────────┬─────────┘
//!             bucket queues │ fork + framed channel
//!            ┌──────────────┼──────────────┐
//!            │              │              │
//!      ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!      │ Worker    │  │ Worker    │  │ Helper    │
//!      │ (batch,   │  │ (batch,   │  │ (long-    │
//!      │  exits)   │  │  exits)   │  │  lived)   │
//!      └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers drain a bucket's queue one batch per fork; helpers run a
//! long-lived function and are optionally respawned when they die. Results
//! travel back over per-child framed channels and are stored or posted to a
//! callback. Signals are latched by handlers and drained into ordinary
//! bookkeeping calls from the main flow.

mod dispatch;
mod reap;
mod shutdown;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{Pid, getpid};
use serde_json::Value;

use crate::bucket::{BucketRegistry, RunLimit, WorkBatch, WorkItem};
use crate::callback::{LogSink, ParentExitFn, ParentHupFn, PreforkFn, Severity};
use crate::child::{ChildStatus, ChildTable, HelperSpawn};
use crate::error::{PreforkError, Result};
use crate::logging;
use crate::signals;

/// Global supervisor knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Keep result frames in per-bucket storage for `get_result` instead of
    /// posting them to the parent-results callback.
    pub store_result: bool,
    /// How long a signal-driven shutdown waits before force-killing children.
    pub children_max_timeout: Duration,
    /// Minimum spacing between housekeeping passes.
    pub housekeeping_check_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            store_result: false,
            children_max_timeout: Duration::from_secs(30),
            housekeeping_check_interval: Duration::from_secs(5),
        }
    }
}

/// A forking work-dispatch supervisor.
///
/// Owns the bucket registry, the child table, and all work queues. All
/// methods that mutate that state are valid only in the original parent
/// process; they fail with [`PreforkError::NotParent`] elsewhere.
pub struct Supervisor {
    config: SupervisorConfig,
    parent_pid: Pid,
    pub(crate) buckets: BucketRegistry,
    pub(crate) children: ChildTable,
    pub(crate) prefork_hooks: Vec<PreforkFn>,
    pub(crate) parent_sighup: Option<ParentHupFn>,
    pub(crate) sighup_cascade: bool,
    pub(crate) parent_exit: Option<ParentExitFn>,
    log_sink: Option<LogSink>,
    /// Latest spawn record per helper identifier. Outlives the child table
    /// entries, which are swept once reaped and drained, so manual revival
    /// still works for a helper that died without the respawn flag.
    pub(crate) helper_specs: HashMap<String, HelperSpawn>,
    pub(crate) last_housekeeping: Option<Instant>,
    pub(crate) exit_requested: bool,
}

impl Supervisor {
    /// Build a supervisor, capture the parent identity, and install the
    /// signal surface (handlers for hangup, child-exit, interrupt and
    /// terminate; the rest of the fatal/ignorable set is ignored).
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        signals::install_handlers()?;
        let parent_pid = getpid();
        tracing::debug!(pid = parent_pid.as_raw(), "supervisor initialized");
        Ok(Self {
            config,
            parent_pid,
            buckets: BucketRegistry::new(),
            children: ChildTable::new(),
            prefork_hooks: Vec::new(),
            parent_sighup: None,
            sighup_cascade: false,
            parent_exit: None,
            log_sink: None,
            helper_specs: HashMap::new(),
            last_housekeeping: None,
            exit_requested: false,
        })
    }

    /// The effective global knobs.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Pid of the supervising parent process.
    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    /// True when called from a forked child of any supervisor in this
    /// process family.
    pub fn is_child() -> bool {
        signals::is_child_process()
    }

    /// The bucket a forked child belongs to. `None` in the parent.
    pub fn child_bucket_get() -> Option<String> {
        signals::child_bucket()
    }

    /// Send one result value from a forked child to its parent. The frame
    /// lands in result storage or the parent-results callback.
    pub fn child_send_result_to_parent(value: &Value) -> Result<()> {
        signals::child_send(value)
    }

    pub(crate) fn ensure_parent(&self) -> Result<()> {
        if signals::is_child_process() || getpid() != self.parent_pid {
            return Err(PreforkError::NotParent);
        }
        Ok(())
    }

    /// Deliver a supervisor event to tracing and the registered log sink.
    pub(crate) fn log_event(&self, severity: Severity, message: &str) {
        logging::emit(severity, message);
        if let Some(log_sink) = &self.log_sink
            && severity >= log_sink.min_severity
        {
            (log_sink.sink)(severity, message);
        }
    }

    /// Convert latched signal flags into bookkeeping calls. Runs at every
    /// public entry point and once per idle-wait tick.
    pub(crate) fn drain_signals(&mut self) {
        if signals::take_hup_pending() {
            self.handle_hangup();
        }
        if signals::take_reap_pending() {
            self.reap();
        }
        if let Some(signal) = signals::take_exit_signal() {
            self.shutdown_on_signal(signal);
        }
    }

    // ---- Buckets & work ------------------------------------------------

    /// Create a bucket (a snapshot of the default bucket's knobs and
    /// callback slots). A no-op if it already exists.
    pub fn add_bucket(&mut self, id: &str) -> Result<()> {
        self.ensure_parent()?;
        self.buckets.ensure(id);
        Ok(())
    }

    /// Queue work on a bucket, creating the bucket on demand.
    ///
    /// Single-item buckets require `identifier` and treat the call as one
    /// identified unit; ordered buckets append the items as-is. With `sort`,
    /// the queue is re-sorted by canonical payload text.
    pub fn add_work(
        &mut self,
        items: Vec<Value>,
        identifier: Option<&str>,
        bucket: &str,
        sort: bool,
    ) -> Result<()> {
        self.ensure_parent()?;
        self.buckets.add_work(bucket, items, identifier, sort)
    }

    /// Whether a child is currently running the work unit with this
    /// identifier.
    pub fn is_work_running(&self, identifier: &str, bucket: &str) -> bool {
        self.children
            .iter()
            .any(|r| r.is_active() && r.bucket == bucket && r.ident == identifier)
    }

    /// Number of workers currently executing batches for a bucket.
    pub fn work_running(&self, bucket: &str) -> usize {
        self.children
            .iter()
            .filter(|r| r.is_active() && r.status == ChildStatus::Worker && r.bucket == bucket)
            .count()
    }

    /// The batches the dispatcher would extract from a bucket, in order,
    /// without consuming them.
    pub fn work_sets(&self, bucket: &str) -> Vec<Vec<WorkItem>> {
        self.buckets.work_sets(bucket)
    }

    /// Count of queued work sets in one bucket, or across all buckets.
    pub fn work_sets_count(&self, bucket: &str, all: bool) -> usize {
        if all {
            self.buckets
                .ids(true)
                .iter()
                .map(|id| self.buckets.work_sets(id).len())
                .sum()
        } else {
            self.buckets.work_sets(bucket).len()
        }
    }

    /// Known bucket ids.
    pub fn bucket_list(&self, include_default: bool) -> Vec<String> {
        self.buckets.ids(include_default)
    }

    pub fn bucket_exists(&self, id: &str) -> bool {
        self.buckets.exists(id)
    }

    /// Number of non-stopped children, optionally limited to one bucket.
    pub fn active_children(&self, bucket: Option<&str>) -> usize {
        self.children.count_active(bucket)
    }

    /// Active children plus reaped ones whose channels may still hold
    /// frames.
    pub fn pending_children(&self, bucket: Option<&str>) -> usize {
        self.children.count_pending(bucket)
    }

    // ---- Per-bucket knobs ----------------------------------------------

    pub fn max_children(&self, bucket: &str) -> Result<usize> {
        Ok(self.buckets.config(bucket)?.max_children)
    }

    /// Set a bucket's concurrency budget. Lowering the budget of a
    /// persistent bucket asks the excess workers to exit.
    pub fn set_max_children(&mut self, bucket: &str, value: usize) -> Result<()> {
        self.ensure_parent()?;
        let entry = self.buckets.ensure(bucket);
        let old = entry.config.max_children;
        entry.config.max_children = value;
        let persistent = entry.config.persistent_mode;

        if persistent && value < old {
            let excess = old - value;
            let victims: Vec<Pid> = self
                .children
                .iter()
                .filter(|r| {
                    r.is_active() && r.status == ChildStatus::Worker && r.bucket == bucket
                })
                .map(|r| r.pid)
                .take(excess)
                .collect();
            self.log_event(
                Severity::Info,
                &format!(
                    "bucket '{bucket}' shrank from {old} to {value} children; \
                     interrupting {} workers",
                    victims.len()
                ),
            );
            for pid in victims {
                self.safe_kill(pid, Signal::SIGINT);
            }
        }
        Ok(())
    }

    pub fn max_work_per_child(&self, bucket: &str) -> Result<usize> {
        Ok(self.buckets.config(bucket)?.max_work_per_child)
    }

    pub fn set_max_work_per_child(&mut self, bucket: &str, value: usize) -> Result<()> {
        self.ensure_parent()?;
        let single = self.buckets.ensure(bucket).config.single_work_item;
        let effective = if value == 0 {
            self.log_event(
                Severity::Warn,
                &format!("max_work_per_child on '{bucket}' clamped from 0 to 1"),
            );
            1
        } else if single && value > 1 {
            self.log_event(
                Severity::Warn,
                &format!("bucket '{bucket}' is in single-item mode; max_work_per_child stays 1"),
            );
            1
        } else {
            value
        };
        self.buckets.ensure(bucket).config.max_work_per_child = effective;
        Ok(())
    }

    /// The bucket's run limit in knob encoding: -1 is unlimited.
    pub fn child_max_run_time(&self, bucket: &str) -> Result<i64> {
        Ok(self.buckets.config(bucket)?.child_max_run_time.as_knob())
    }

    pub fn set_child_max_run_time(&mut self, bucket: &str, secs: i64) -> Result<()> {
        self.ensure_parent()?;
        let (limit, clamped) = RunLimit::from_knob(secs);
        if clamped {
            self.log_event(
                Severity::Warn,
                &format!("child_max_run_time {secs} on '{bucket}' clamped to unlimited"),
            );
        }
        if limit == RunLimit::Secs(0) {
            self.log_event(
                Severity::Warn,
                &format!(
                    "child_max_run_time 0 on '{bucket}': every child is overdue at the next \
                     housekeeping pass"
                ),
            );
        }
        self.buckets.ensure(bucket).config.child_max_run_time = limit;
        Ok(())
    }

    pub fn child_single_work_item(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.config(bucket)?.single_work_item)
    }

    pub fn set_child_single_work_item(&mut self, bucket: &str, value: bool) -> Result<()> {
        self.ensure_parent()?;
        let config = &mut self.buckets.ensure(bucket).config;
        config.single_work_item = value;
        if value {
            config.max_work_per_child = 1;
        }
        Ok(())
    }

    pub fn child_persistent_mode(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.config(bucket)?.persistent_mode)
    }

    pub fn set_child_persistent_mode(&mut self, bucket: &str, value: bool) -> Result<()> {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).config.persistent_mode = value;
        Ok(())
    }

    pub fn child_persistent_mode_data(&self, bucket: &str) -> Result<Value> {
        Ok(self.buckets.config(bucket)?.persistent_mode_data.clone())
    }

    pub fn set_child_persistent_mode_data(&mut self, bucket: &str, data: Value) -> Result<()> {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).config.persistent_mode_data = data;
        Ok(())
    }

    // ---- Global knobs --------------------------------------------------

    pub fn store_result(&self) -> bool {
        self.config.store_result
    }

    pub fn set_store_result(&mut self, value: bool) {
        self.config.store_result = value;
    }

    pub fn children_max_timeout(&self) -> Duration {
        self.config.children_max_timeout
    }

    pub fn set_children_max_timeout(&mut self, value: Duration) {
        self.config.children_max_timeout = value;
    }

    pub fn housekeeping_check_interval(&self) -> Duration {
        self.config.housekeeping_check_interval
    }

    pub fn set_housekeeping_check_interval(&mut self, value: Duration) {
        self.config.housekeeping_check_interval = value;
    }

    // ---- Callback registration -----------------------------------------

    /// Register the batch executor for a bucket's children. Required for
    /// dispatch: a bucket without it drops its batches with a crit event.
    pub fn register_child_run<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(&WorkBatch) -> Option<Value> + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.child_run = Some(Arc::new(f));
        Ok(())
    }

    /// Runs in a child of this bucket when it receives an exit request.
    pub fn register_child_exit<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.child_exit = Some(Arc::new(f));
        Ok(())
    }

    /// Runs in a child of this bucket on hangup.
    pub fn register_child_sighup<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.child_sighup = Some(Arc::new(f));
        Ok(())
    }

    /// Runs in the parent when a child of this bucket overruns its limit.
    pub fn register_child_timeout<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(Pid, &str) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.child_timeout = Some(Arc::new(f));
        Ok(())
    }

    /// Append a resource-cleanup hook run before every fork, in registration
    /// order.
    pub fn register_parent_prefork<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.prefork_hooks.push(Arc::new(f));
        Ok(())
    }

    /// Runs in the parent right after a worker fork for this bucket.
    pub fn register_parent_fork<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(Pid, &str) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.parent_fork = Some(Arc::new(f));
        Ok(())
    }

    /// Runs in the parent on hangup; with `cascade`, the hangup is forwarded
    /// to every tracked child.
    pub fn register_parent_sighup<F>(&mut self, f: F, cascade: bool) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.parent_sighup = Some(Arc::new(f));
        self.sighup_cascade = cascade;
        Ok(())
    }

    /// Runs in the parent when a worker of this bucket has been reaped.
    pub fn register_parent_child_exit<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(Pid, &str) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.parent_child_exited = Some(Arc::new(f));
        Ok(())
    }

    /// Receives result frames for this bucket when result storage is off.
    pub fn register_parent_results<F>(&mut self, bucket: &str, f: F) -> Result<()>
    where
        F: Fn(Pid, &Value) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.buckets.ensure(bucket).callbacks.parent_results = Some(Arc::new(f));
        Ok(())
    }

    /// Runs when a blocking pass completes or a signal-driven shutdown ends.
    pub fn register_parent_exit<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(Pid, Option<Signal>) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.parent_exit = Some(Arc::new(f));
        Ok(())
    }

    /// Register a log sink receiving supervisor events at or above
    /// `min_severity`.
    pub fn register_logging<F>(&mut self, f: F, min_severity: Severity) -> Result<()>
    where
        F: Fn(Severity, &str) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        self.log_sink = Some(LogSink {
            sink: Arc::new(f),
            min_severity,
        });
        Ok(())
    }

    // ---- Results -------------------------------------------------------

    /// Whether a stored result is ready for this bucket. Polls channels
    /// first so freshly arrived frames count.
    pub fn has_result(&mut self, bucket: &str) -> bool {
        if self.ensure_parent().is_err() {
            return false;
        }
        self.post_results(Some(bucket));
        self.buckets
            .get(bucket)
            .is_some_and(|b| !b.pending_results.is_empty())
    }

    /// Pop the oldest stored result for a bucket, waiting up to `wait` for
    /// one to arrive (`None` returns immediately).
    pub fn get_result(&mut self, bucket: &str, wait: Option<Duration>) -> Result<Option<Value>> {
        self.ensure_parent()?;
        let deadline = wait.map(|d| Instant::now() + d);
        loop {
            self.drain_signals();
            self.post_results(Some(bucket));
            if let Some(entry) = self.buckets.get_mut(bucket)
                && let Some(value) = entry.pending_results.pop_front()
            {
                return Ok(Some(value));
            }
            // Nothing can arrive anymore: no child of this bucket is alive
            // or holds undrained frames.
            if self.children.count_pending(Some(bucket)) == 0 {
                return Ok(None);
            }
            match deadline {
                Some(d) if Instant::now() < d => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => return Ok(None),
            }
        }
    }

    /// Drain every stored result for a bucket.
    pub fn get_all_results(&mut self, bucket: &str) -> Result<Vec<Value>> {
        self.ensure_parent()?;
        self.drain_signals();
        self.post_results(Some(bucket));
        Ok(self
            .buckets
            .get_mut(bucket)
            .map(|b| b.pending_results.drain(..).collect())
            .unwrap_or_default())
    }

    // ---- Helpers -------------------------------------------------------

    /// Fork a long-lived helper running `f(args)`. With `respawn`, the
    /// reaper re-forks it from the stored function and arguments whenever it
    /// dies.
    pub fn helper_process_spawn<F>(
        &mut self,
        f: F,
        args: Value,
        ident: &str,
        respawn: bool,
    ) -> Result<Pid>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.ensure_parent()?;
        let spawn = HelperSpawn {
            func: Arc::new(f),
            args,
            respawn,
        };
        self.fork_helper(spawn, ident)
    }

    /// Manually re-fork the helper last spawned with this identifier from
    /// its retained function and arguments, regardless of its respawn flag.
    /// Works even after the dead helper's table record has been swept.
    pub fn helper_process_respawn(&mut self, ident: &str) -> Result<Pid> {
        self.ensure_parent()?;
        let spawn = self
            .helper_specs
            .get(ident)
            .cloned()
            .ok_or_else(|| PreforkError::HelperNotFound(ident.to_string()))?;
        self.fork_helper(spawn, ident)
    }

    // ---- Exit state ----------------------------------------------------

    /// Whether an interrupt has been observed (drained or still latched).
    pub fn received_exit_request(&self) -> bool {
        self.exit_requested || signals::exit_signal_pending()
    }

    /// Override the recorded exit-request state.
    pub fn set_exit_requested(&mut self, value: bool) {
        self.exit_requested = value;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Only the parent cleans up; forked children exit without running
        // destructors and never own the process family.
        if signals::is_child_process() || getpid() != self.parent_pid {
            return;
        }
        for record in self.children.iter_mut() {
            if let Some(helper) = &mut record.helper {
                helper.respawn = false;
            }
        }
        let pids = self.children.active_pids(None);
        if pids.is_empty() {
            return;
        }
        tracing::debug!(
            count = pids.len(),
            "supervisor dropped with live children; force-killing"
        );
        for pid in pids {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::DEFAULT_BUCKET;
    use serde_json::json;

    fn supervisor() -> Supervisor {
        Supervisor::new(SupervisorConfig::default()).expect("supervisor init")
    }

    #[test]
    fn test_bucket_lifecycle() {
        let mut sup = supervisor();
        assert!(sup.bucket_exists(DEFAULT_BUCKET));
        assert!(!sup.bucket_exists("resize"));

        sup.add_bucket("resize").unwrap();
        assert!(sup.bucket_exists("resize"));
        assert_eq!(sup.bucket_list(false), vec!["resize".to_string()]);
        assert_eq!(sup.bucket_list(true).len(), 2);
    }

    #[test]
    fn test_add_work_auto_creates_bucket() {
        let mut sup = supervisor();
        sup.add_work(vec![json!(1)], None, "adhoc", false).unwrap();
        assert!(sup.bucket_exists("adhoc"));
        assert_eq!(sup.work_sets_count("adhoc", false), 1);
    }

    #[test]
    fn test_knob_clamps() {
        let mut sup = supervisor();
        sup.set_max_work_per_child(DEFAULT_BUCKET, 0).unwrap();
        assert_eq!(sup.max_work_per_child(DEFAULT_BUCKET).unwrap(), 1);

        sup.set_child_max_run_time(DEFAULT_BUCKET, -5).unwrap();
        assert_eq!(sup.child_max_run_time(DEFAULT_BUCKET).unwrap(), -1);

        sup.set_child_max_run_time(DEFAULT_BUCKET, 30).unwrap();
        assert_eq!(sup.child_max_run_time(DEFAULT_BUCKET).unwrap(), 30);
    }

    #[test]
    fn test_single_work_item_forces_batch_of_one() {
        let mut sup = supervisor();
        sup.set_max_work_per_child("jobs", 8).unwrap();
        sup.set_child_single_work_item("jobs", true).unwrap();
        assert_eq!(sup.max_work_per_child("jobs").unwrap(), 1);

        // And it stays pinned while single-item mode is on.
        sup.set_max_work_per_child("jobs", 8).unwrap();
        assert_eq!(sup.max_work_per_child("jobs").unwrap(), 1);
    }

    #[test]
    fn test_unknown_bucket_knob_read() {
        let sup = supervisor();
        assert!(matches!(
            sup.max_children("nope"),
            Err(PreforkError::UnknownBucket(_))
        ));
    }

    #[test]
    fn test_log_sink_severity_floor() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<(Severity, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();

        let mut sup = supervisor();
        sup.register_logging(
            move |sev, msg| sink_seen.lock().unwrap().push((sev, msg.to_string())),
            Severity::Warn,
        )
        .unwrap();

        sup.log_event(Severity::Info, "below the floor");
        sup.log_event(Severity::Crit, "above the floor");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Severity::Crit);
    }

    #[test]
    fn test_received_exit_request_override() {
        let mut sup = supervisor();
        assert!(!sup.received_exit_request());
        sup.set_exit_requested(true);
        assert!(sup.received_exit_request());
        sup.set_exit_requested(false);
        assert!(!sup.received_exit_request());
    }

    #[test]
    fn test_get_result_empty_bucket_returns_immediately() {
        let mut sup = supervisor();
        sup.add_bucket("quiet").unwrap();
        let started = Instant::now();
        let result = sup
            .get_result("quiet", Some(Duration::from_secs(5)))
            .unwrap();
        assert!(result.is_none());
        // No children, no pending frames: must not sit out the full wait.
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
