//! The reaper and the periodic housekeeper.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde_json::Value;

use crate::bucket::RunLimit;
use crate::callback::Severity;
use crate::child::ChildStatus;
use crate::signals::analyze_wait_status;

use super::Supervisor;

/// Settling pause between force-killing an overdue child and reaping it.
const KILL_SETTLE_TIME: Duration = Duration::from_secs(3);

impl Supervisor {
    /// Drain every exited child without blocking and fold the exits into the
    /// table.
    ///
    /// Invoked opportunistically from every wait loop and whenever a
    /// child-exit signal has been latched; an empty pass is cheap and the
    /// no-child case is expected.
    pub(crate) fn reap(&mut self) {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => match status.pid() {
                    Some(pid) => self.fold_exit(pid, status),
                    None => break,
                },
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::warn!(error = %errno, "waitpid failed");
                    break;
                }
            }
        }
        self.children.sweep_drained();
    }

    /// Fold one reaped pid into the table: exit callback for workers, stop
    /// transition, helper respawn, result drain.
    fn fold_exit(&mut self, pid: Pid, status: WaitStatus) {
        let reason = analyze_wait_status(status);
        let Some(record) = self.children.lookup(pid) else {
            // User code may fork its own subprocesses; they are not ours to
            // track.
            self.log_event(
                Severity::Info,
                &format!("reaped unknown pid {pid} ({reason}); ignoring"),
            );
            return;
        };

        let bucket = record.bucket.clone();
        let ident = record.ident.clone();
        let was_worker = record.status == ChildStatus::Worker;
        let helper = if record.status == ChildStatus::Helper {
            record.helper.clone()
        } else {
            None
        };

        if reason.is_clean() {
            tracing::debug!(pid = pid.as_raw(), bucket = %bucket, "reaped child");
        } else {
            tracing::warn!(pid = pid.as_raw(), bucket = %bucket, outcome = %reason, "reaped child");
        }

        if was_worker {
            let on_exited = self
                .buckets
                .get(&bucket)
                .and_then(|b| b.callbacks.parent_child_exited.clone());
            if let Some(on_exited) = on_exited {
                on_exited(pid, &ident);
            }
        }

        self.children.mark_stopped(pid);

        if let Some(spawn) = helper
            && spawn.respawn
        {
            self.log_event(
                Severity::Info,
                &format!("helper '{ident}' (pid {pid}) died; respawning"),
            );
            if let Err(e) = self.fork_helper(spawn, &ident) {
                self.log_event(
                    Severity::Crit,
                    &format!("failed to respawn helper '{ident}': {e}"),
                );
            }
        }

        self.post_results(Some(bucket.as_str()));
    }

    /// Drain result frames from child channels without blocking.
    ///
    /// Frames are stored per bucket when result storage is on, otherwise
    /// posted to the bucket's parent-results callback. Channel failures drop
    /// the affected frames; the pid stays reapable.
    pub(crate) fn post_results(&mut self, bucket: Option<&str>) {
        let mut harvested: Vec<(Pid, String, Vec<Value>)> = Vec::new();
        let mut failures: Vec<(Pid, String)> = Vec::new();

        for record in self.children.iter_mut() {
            if let Some(filter) = bucket
                && record.bucket != filter
            {
                continue;
            }
            match record.channel.poll() {
                Ok(frames) => {
                    if !frames.is_empty() {
                        record.last_active = Instant::now();
                        harvested.push((record.pid, record.bucket.clone(), frames));
                    }
                }
                Err(e) => failures.push((record.pid, e.to_string())),
            }
        }

        for (pid, error) in failures {
            self.log_event(
                Severity::Crit,
                &format!("channel drain for pid {pid} failed: {error}"),
            );
        }

        let store = self.config.store_result;
        for (pid, bucket_id, frames) in harvested {
            let on_results = self
                .buckets
                .get(&bucket_id)
                .and_then(|b| b.callbacks.parent_results.clone());
            for value in frames {
                if store {
                    if let Some(entry) = self.buckets.get_mut(&bucket_id) {
                        entry.pending_results.push_back(value);
                    }
                } else if let Some(on_results) = &on_results {
                    on_results(pid, &value);
                } else {
                    self.log_event(
                        Severity::Crit,
                        &format!(
                            "result from pid {pid} dropped: 'parent_results' is not registered \
                             on bucket '{bucket_id}' and result storage is off"
                        ),
                    );
                }
            }
        }
    }

    /// Timer-bounded maintenance pass: enforce per-bucket run limits and
    /// re-drive the reaper. `force` skips the interval gate.
    pub(crate) fn run_housekeeping(&mut self, force: bool) {
        if !force
            && let Some(last) = self.last_housekeeping
            && last.elapsed() < self.config.housekeeping_check_interval
        {
            return;
        }

        let now = Instant::now();
        let mut overdue: Vec<(Pid, String, String)> = Vec::new();
        for record in self.children.iter() {
            if !record.is_active() {
                continue;
            }
            let Ok(config) = self.buckets.config(&record.bucket) else {
                continue;
            };
            let RunLimit::Secs(limit) = config.child_max_run_time else {
                continue;
            };
            if now.duration_since(record.ctime) > Duration::from_secs(limit) {
                overdue.push((record.pid, record.bucket.clone(), record.ident.clone()));
            }
        }

        for (pid, bucket, ident) in overdue {
            self.log_event(
                Severity::Warn,
                &format!("child {pid} in bucket '{bucket}' exceeded its run limit; force-killing"),
            );
            let on_timeout = self
                .buckets
                .get(&bucket)
                .and_then(|b| b.callbacks.child_timeout.clone());
            if let Some(on_timeout) = on_timeout {
                on_timeout(pid, &ident);
            }
            self.safe_kill(pid, Signal::SIGKILL);
            std::thread::sleep(KILL_SETTLE_TIME);
            self.reap();
        }

        self.reap();
        self.last_housekeeping = Some(Instant::now());
    }
}
