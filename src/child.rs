//! Per-child records and the pid-keyed child table.

#![allow(dead_code)] // Some table operations are for monitoring and tests

use std::collections::HashMap;
use std::time::Instant;

use nix::unistd::Pid;
use serde_json::Value;

use crate::callback::HelperFn;
use crate::channel::Channel;

/// Lifecycle state of one tracked child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Executing one batch of bucket work; exits when done.
    Worker,
    /// Long-lived process running a user function; may be respawned.
    Helper,
    /// Reaped (or locally declared dead); kept only until its channel drains.
    Stopped,
}

/// Everything a helper needs to be spawned again.
#[derive(Clone)]
pub(crate) struct HelperSpawn {
    pub func: HelperFn,
    pub args: Value,
    pub respawn: bool,
}

/// Bookkeeping for one live or recently exited child.
pub(crate) struct ChildRecord {
    pub pid: Pid,
    pub ctime: Instant,
    pub ident: String,
    pub bucket: String,
    pub status: ChildStatus,
    pub channel: Channel,
    pub last_active: Instant,
    pub helper: Option<HelperSpawn>,
}

impl ChildRecord {
    pub fn worker(pid: Pid, ident: String, bucket: &str, channel: Channel) -> Self {
        let now = Instant::now();
        Self {
            pid,
            ctime: now,
            ident,
            bucket: bucket.to_string(),
            status: ChildStatus::Worker,
            channel,
            last_active: now,
            helper: None,
        }
    }

    pub fn helper(pid: Pid, ident: String, bucket: &str, channel: Channel, spawn: HelperSpawn) -> Self {
        let now = Instant::now();
        Self {
            pid,
            ctime: now,
            ident,
            bucket: bucket.to_string(),
            status: ChildStatus::Helper,
            channel,
            last_active: now,
            helper: Some(spawn),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != ChildStatus::Stopped
    }

    /// Reaped and nothing left to read: safe to forget.
    pub fn removable(&self) -> bool {
        self.status == ChildStatus::Stopped && self.channel.drained()
    }

    /// Stopped but with frames possibly still in flight.
    pub fn has_pending_io(&self) -> bool {
        !self.channel.is_closed() || self.channel.has_buffered()
    }
}

/// Mapping from OS process id to child record. Mutated only by the parent.
pub(crate) struct ChildTable {
    records: HashMap<Pid, ChildRecord>,
    active: usize,
}

impl ChildTable {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            active: 0,
        }
    }

    pub fn insert(&mut self, record: ChildRecord) {
        if let Some(old) = self.records.insert(record.pid, record) {
            // A reused pid can only collide with a record we failed to sweep;
            // keep the active counter honest.
            if old.is_active() {
                self.active = self.active.saturating_sub(1);
                tracing::warn!(pid = old.pid.as_raw(), "replaced an unreaped child record");
            }
        }
        self.active += 1;
    }

    /// Transition a record into `Stopped`. The active counter is decremented
    /// exactly once per record; repeated calls are no-ops.
    pub fn mark_stopped(&mut self, pid: Pid) -> bool {
        match self.records.get_mut(&pid) {
            Some(record) if record.is_active() => {
                record.status = ChildStatus::Stopped;
                self.active = self.active.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, pid: Pid) -> Option<&ChildRecord> {
        self.records.get(&pid)
    }

    pub fn lookup_mut(&mut self, pid: Pid) -> Option<&mut ChildRecord> {
        self.records.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ChildRecord> {
        let record = self.records.remove(&pid)?;
        if record.is_active() {
            self.active = self.active.saturating_sub(1);
        }
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChildRecord> {
        self.records.values_mut()
    }

    /// Pids of every non-stopped child, optionally limited to one bucket.
    pub fn active_pids(&self, bucket: Option<&str>) -> Vec<Pid> {
        self.records
            .values()
            .filter(|r| r.is_active())
            .filter(|r| bucket.is_none_or(|b| r.bucket == b))
            .map(|r| r.pid)
            .collect()
    }

    /// Number of records whose status is not `Stopped`.
    pub fn count_active(&self, bucket: Option<&str>) -> usize {
        match bucket {
            None => self.active,
            Some(b) => self
                .records
                .values()
                .filter(|r| r.is_active() && r.bucket == b)
                .count(),
        }
    }

    /// Active children plus stopped ones whose channels are not yet drained.
    pub fn count_pending(&self, bucket: Option<&str>) -> usize {
        self.records
            .values()
            .filter(|r| bucket.is_none_or(|b| r.bucket == b))
            .filter(|r| r.is_active() || r.has_pending_io())
            .count()
    }

    /// Forget every record that is both reaped and fully drained.
    pub fn sweep_drained(&mut self) {
        self.records.retain(|_, record| !record.removable());
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.active = 0;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
