//! Batch extraction, the fork transaction, and the work-processing loops.

use std::sync::Mutex;
use std::time::Duration;

use nix::unistd::{ForkResult, Pid, fork};

use crate::bucket::{DEFAULT_BUCKET, WorkBatch};
use crate::callback::{BucketCallbacks, ChildRunFn, Severity};
use crate::channel::Channel;
use crate::child::{ChildRecord, HelperSpawn};
use crate::error::{PreforkError, Result};
use crate::signals::{self, ChildContext, SignalMask};

use super::Supervisor;

/// Pause before a worker exits, so a parent that is already reaping does not
/// race the last frame still in the socket buffer.
const WORKER_EXIT_LINGER: Duration = Duration::from_micros(500);

impl Supervisor {
    /// Dispatch queued work.
    ///
    /// Non-blocking mode forks until the bucket's budget is full or its
    /// queue is empty (persistent buckets ignore the queue), then returns.
    /// Blocking mode keeps dispatching until the queue is drained and every
    /// child of the bucket has exited, then invokes the parent-exit
    /// callback. With `all_buckets`, every known bucket is processed in
    /// turn.
    pub fn process_work(&mut self, blocking: bool, bucket: &str, all_buckets: bool) -> Result<()> {
        self.ensure_parent()?;
        if all_buckets {
            for id in self.buckets.ids(true) {
                self.process_work(blocking, &id, false)?;
            }
            return Ok(());
        }

        self.buckets.ensure(bucket);
        self.drain_signals();
        self.run_housekeeping(false);

        if blocking {
            self.process_work_blocking(bucket)
        } else {
            self.process_work_nonblocking(bucket)
        }
    }

    fn process_work_blocking(&mut self, bucket: &str) -> Result<()> {
        if self.buckets.config(bucket)?.persistent_mode {
            // A persistent bucket has no queue to drain; fill the budget
            // once and fall through to the wait below.
            self.process_work_nonblocking(bucket)?;
        } else {
            loop {
                let max_children = self.buckets.config(bucket)?.max_children;
                if max_children == 0 {
                    if self.buckets.queue_len(bucket) > 0 {
                        self.log_event(
                            Severity::Warn,
                            &format!(
                                "bucket '{bucket}' has queued work but max_children is 0; \
                                 leaving the queue untouched"
                            ),
                        );
                    }
                    break;
                }
                if self.buckets.queue_len(bucket) == 0 {
                    break;
                }
                if self.children.count_active(Some(bucket)) >= max_children {
                    self.idle_wait();
                    continue;
                }
                self.dispatch_one(bucket)?;
            }
        }

        while self.children.count_active(Some(bucket)) > 0 {
            self.idle_wait();
        }
        self.post_results(Some(bucket));

        if let Some(on_exit) = self.parent_exit.clone() {
            on_exit(self.parent_pid, None);
        }
        Ok(())
    }

    fn process_work_nonblocking(&mut self, bucket: &str) -> Result<()> {
        loop {
            let config = self.buckets.config(bucket)?;
            let max_children = config.max_children;
            let persistent = config.persistent_mode;

            if self.children.count_active(Some(bucket)) >= max_children {
                break;
            }
            if !persistent && self.buckets.queue_len(bucket) == 0 {
                break;
            }
            if !self.dispatch_one(bucket)? {
                break;
            }
        }
        Ok(())
    }

    /// One tick of the blocking loops: sleep, then run every housekeeping
    /// duty that may free a slot.
    fn idle_wait(&mut self) {
        std::thread::sleep(Duration::from_secs(1));
        self.drain_signals();
        self.run_housekeeping(false);
        self.reap();
    }

    /// Extract one batch and fork a worker for it.
    ///
    /// Returns `Ok(false)` when the bucket had nothing to dispatch. A fork
    /// failure requeues the batch at the head of the queue so no work is
    /// lost.
    pub(crate) fn dispatch_one(&mut self, bucket: &str) -> Result<bool> {
        let Some((batch, ident)) = self.buckets.extract_batch(bucket)? else {
            return Ok(false);
        };

        for hook in self.prefork_hooks.clone() {
            hook();
        }

        let callbacks = self
            .buckets
            .get(bucket)
            .map(|b| b.callbacks.clone())
            .unwrap_or_default();
        let Some(run) = callbacks.child_run.clone() else {
            self.log_event(
                Severity::Crit,
                &format!(
                    "required callback 'child_run' is not registered on bucket '{bucket}'; \
                     dropping a batch of {}",
                    batch.len()
                ),
            );
            return Ok(true);
        };

        let (parent_end, child_end) = Channel::pair()?;
        let mask = SignalMask::block()?;
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(child_end);
                self.children
                    .insert(ChildRecord::worker(child, ident.clone(), bucket, parent_end));
                drop(mask);
                tracing::info!(
                    pid = child.as_raw(),
                    bucket,
                    ident = %ident,
                    batch_size = batch.len(),
                    "forked worker"
                );
                if let Some(on_fork) = &callbacks.parent_fork {
                    on_fork(child, &ident);
                }
                Ok(true)
            }
            Ok(ForkResult::Child) => {
                drop(mask);
                self.enter_worker_child(bucket, batch, run, callbacks, parent_end, child_end)
            }
            Err(errno) => {
                drop(mask);
                self.log_event(
                    Severity::Crit,
                    &format!("fork failed for bucket '{bucket}': {errno}"),
                );
                self.buckets.requeue_front(bucket, batch);
                Err(PreforkError::Fork(errno))
            }
        }
    }

    /// The worker's side of the fork: shed the parent's bookkeeping, run the
    /// batch, ship the result, exit 0.
    fn enter_worker_child(
        &mut self,
        bucket: &str,
        batch: WorkBatch,
        run: ChildRunFn,
        callbacks: BucketCallbacks,
        parent_end: Channel,
        child_end: Channel,
    ) -> ! {
        // The fork copied the parent's queues and sibling records; this
        // process must not act on them.
        self.children.clear();
        self.buckets.clear_runtime_state();
        drop(parent_end);

        signals::enter_child(ChildContext {
            bucket: bucket.to_string(),
            on_exit: callbacks.child_exit.clone(),
            on_sighup: callbacks.child_sighup.clone(),
            channel: Mutex::new(child_end),
        });

        if let Some(result) = run(&batch)
            && let Err(e) = signals::child_send(&result)
        {
            tracing::error!(error = %e, "failed to deliver result frame to parent");
        }

        std::thread::sleep(WORKER_EXIT_LINGER);
        std::process::exit(0);
    }

    /// Fork a helper child from a spawn record. Shared by the public spawn
    /// call, manual respawn, and the reaper's automatic respawn.
    pub(crate) fn fork_helper(&mut self, spawn: HelperSpawn, ident: &str) -> Result<Pid> {
        // Retained past the table sweep so this identifier can be revived
        // manually after the child record is gone.
        self.helper_specs.insert(ident.to_string(), spawn.clone());

        for hook in self.prefork_hooks.clone() {
            hook();
        }

        let callbacks = self
            .buckets
            .get(DEFAULT_BUCKET)
            .map(|b| b.callbacks.clone())
            .unwrap_or_default();

        let (parent_end, child_end) = Channel::pair()?;
        let mask = SignalMask::block()?;
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(child_end);
                let respawn = spawn.respawn;
                self.children.insert(ChildRecord::helper(
                    child,
                    ident.to_string(),
                    DEFAULT_BUCKET,
                    parent_end,
                    spawn,
                ));
                drop(mask);
                tracing::info!(pid = child.as_raw(), ident, respawn, "forked helper");
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                drop(mask);
                self.enter_helper_child(spawn, callbacks, parent_end, child_end)
            }
            Err(errno) => {
                drop(mask);
                self.log_event(
                    Severity::Crit,
                    &format!("fork failed for helper '{ident}': {errno}"),
                );
                Err(PreforkError::Fork(errno))
            }
        }
    }

    fn enter_helper_child(
        &mut self,
        spawn: HelperSpawn,
        callbacks: BucketCallbacks,
        parent_end: Channel,
        child_end: Channel,
    ) -> ! {
        self.children.clear();
        self.buckets.clear_runtime_state();
        drop(parent_end);

        signals::enter_child(ChildContext {
            bucket: DEFAULT_BUCKET.to_string(),
            on_exit: callbacks.child_exit.clone(),
            on_sighup: callbacks.child_sighup.clone(),
            channel: Mutex::new(child_end),
        });

        (spawn.func)(&spawn.args);
        std::process::exit(0);
    }
}
