//! Safe signalling and the interrupt-driven shutdown coordinator.

use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpid};

use crate::callback::Severity;
use crate::error::Result;
use crate::signals::SIGNAL_EXIT_CODE;

use super::Supervisor;

/// The OS parent of `pid`, from `/proc/<pid>/stat`. The comm field may
/// contain spaces and parentheses, so the line is split at the last `)`.
#[cfg(target_os = "linux")]
fn os_parent_of(pid: Pid) -> Option<Pid> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid.as_raw())).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid: i32 = fields.next()?.parse().ok()?;
    Some(Pid::from_raw(ppid))
}

#[cfg(not(target_os = "linux"))]
fn os_parent_of(_pid: Pid) -> Option<Pid> {
    None
}

impl Supervisor {
    /// Signal a child, but only if it is in our table and the OS agrees it
    /// is still our child. A pid that was reused by an unrelated process
    /// must never be signalled.
    ///
    /// Returns false, with a warn event, when the kill was refused or
    /// failed.
    pub fn safe_kill(&self, pid: Pid, signal: Signal) -> bool {
        if self.children.lookup(pid).is_none() {
            self.log_event(
                Severity::Warn,
                &format!("refusing to signal pid {pid}: not in the child table"),
            );
            return false;
        }

        match os_parent_of(pid) {
            Some(ppid) if ppid != getpid() => {
                self.log_event(
                    Severity::Warn,
                    &format!("refusing to signal pid {pid}: its parent is {ppid}, not us"),
                );
                return false;
            }
            None if cfg!(target_os = "linux") => {
                self.log_event(
                    Severity::Warn,
                    &format!("refusing to signal pid {pid}: no longer in the OS process table"),
                );
                return false;
            }
            // Off Linux the parentage probe is unavailable; table
            // membership alone gates the kill.
            _ => {}
        }

        match kill(pid, signal) {
            Ok(()) => true,
            Err(errno) => {
                self.log_event(
                    Severity::Warn,
                    &format!("kill(pid {pid}, {signal:?}) failed: {errno}"),
                );
                false
            }
        }
    }

    /// Ask a set of children to exit with an interrupt, wait up to `delay`
    /// while reaping, then force-kill whatever is still alive.
    pub fn kill_child_pid(&mut self, pids: &[Pid], delay: Duration) -> Result<()> {
        self.ensure_parent()?;
        for &pid in pids {
            self.safe_kill(pid, Signal::SIGINT);
        }

        let deadline = Instant::now() + delay;
        loop {
            self.reap();
            let outstanding: Vec<Pid> = pids
                .iter()
                .copied()
                .filter(|pid| self.children.lookup(*pid).is_some_and(|r| r.is_active()))
                .collect();
            if outstanding.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.log_event(
                    Severity::Warn,
                    &format!(
                        "{} children ignored the exit request; force-killing",
                        outstanding.len()
                    ),
                );
                for pid in outstanding {
                    self.safe_kill(pid, Signal::SIGKILL);
                }
                self.reap();
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// React to a drained hangup: parent callback first, then the optional
    /// cascade to every tracked child.
    pub(crate) fn handle_hangup(&mut self) {
        tracing::info!("received hangup");
        if let Some(on_hup) = self.parent_sighup.clone() {
            on_hup();
        }
        if self.sighup_cascade {
            for pid in self.children.active_pids(None) {
                self.safe_kill(pid, Signal::SIGHUP);
            }
        }
    }

    /// The shutdown coordinator: ask every child to exit, wait out the
    /// deadline, force-kill the rest, notify the embedder, leave.
    pub(crate) fn shutdown_on_signal(&mut self, signal: Signal) -> ! {
        self.exit_requested = true;
        self.log_event(
            Severity::Info,
            &format!("received {signal:?}; shutting down the process family"),
        );

        // A helper must not be brought back while we are tearing down.
        for record in self.children.iter_mut() {
            if let Some(helper) = &mut record.helper {
                helper.respawn = false;
            }
        }
        for pid in self.children.active_pids(None) {
            self.safe_kill(pid, Signal::SIGINT);
        }

        std::thread::sleep(Duration::from_secs(1));
        self.reap();

        let deadline = Instant::now() + self.config.children_max_timeout;
        while self.children.count_active(None) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_secs(1));
            self.run_housekeeping(true);
        }

        let stragglers = self.children.active_pids(None);
        if !stragglers.is_empty() {
            self.log_event(
                Severity::Warn,
                &format!(
                    "{} children outlived the shutdown deadline; force-killing",
                    stragglers.len()
                ),
            );
            for pid in stragglers {
                self.safe_kill(pid, Signal::SIGKILL);
                self.children.mark_stopped(pid);
            }
        }

        if let Some(on_exit) = self.parent_exit.clone() {
            on_exit(self.parent_pid, Some(signal));
        }
        std::process::exit(SIGNAL_EXIT_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorConfig;

    #[test]
    fn test_safe_kill_refuses_untracked_pid() {
        let sup = Supervisor::new(SupervisorConfig::default()).unwrap();
        // pid 1 is certainly not in our table.
        assert!(!sup.safe_kill(Pid::from_raw(1), Signal::SIGHUP));
        // Nor is a pid that almost certainly does not exist.
        assert!(!sup.safe_kill(Pid::from_raw(i32::MAX - 1), Signal::SIGHUP));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_os_parent_of_self() {
        let ppid = os_parent_of(getpid()).expect("own stat must be readable");
        assert_eq!(ppid, nix::unistd::getppid());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_os_parent_of_missing_pid() {
        assert_eq!(os_parent_of(Pid::from_raw(i32::MAX - 1)), None);
    }
}
