//! Signal routing for the supervisor process family.
//!
//! The parent never runs bookkeeping inside a signal handler. Handlers only
//! latch atomic flags; the main flow drains them into ordinary calls (reap,
//! hangup handling, shutdown), so multi-step table updates cannot be torn by
//! re-entrancy. Forked children flip a process-wide flag and route signals
//! through a per-process context instead: hangup runs the bucket's sighup
//! callback, an exit request runs the bucket's exit callback and leaves.

use std::os::raw::c_int;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow, sigaction, sigprocmask,
};
use nix::sys::wait::WaitStatus;
use serde_json::Value;

use crate::callback::{ChildExitFn, ChildHupFn};
use crate::channel::Channel;
use crate::error::{PreforkError, Result};

/// Exit code used after a signal-driven shutdown, in parent and child alike.
pub(crate) const SIGNAL_EXIT_CODE: i32 = -1;

/// Signals the supervisor routes through handlers.
pub(crate) const SUPERVISED_SIGNALS: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
];

/// Signals the supervisor explicitly ignores.
const IGNORED_SIGNALS: [Signal; 10] = [
    Signal::SIGALRM,
    Signal::SIGUSR2,
    Signal::SIGBUS,
    Signal::SIGPIPE,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGQUIT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

static REAP_PENDING: AtomicBool = AtomicBool::new(false);
static HUP_PENDING: AtomicBool = AtomicBool::new(false);
static EXIT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static CHILD_PROCESS: AtomicBool = AtomicBool::new(false);
static CHILD_CONTEXT: AtomicPtr<ChildContext> = AtomicPtr::new(ptr::null_mut());

/// Everything a forked child keeps reachable for its signal path and its
/// parent-facing channel.
pub(crate) struct ChildContext {
    pub bucket: String,
    pub on_exit: Option<ChildExitFn>,
    pub on_sighup: Option<ChildHupFn>,
    pub channel: Mutex<Channel>,
}

extern "C" fn route_signal(raw: c_int) {
    let Ok(signal) = Signal::try_from(raw) else {
        return;
    };
    if CHILD_PROCESS.load(Ordering::SeqCst) {
        route_in_child(signal);
        return;
    }
    match signal {
        Signal::SIGCHLD => REAP_PENDING.store(true, Ordering::SeqCst),
        Signal::SIGHUP => HUP_PENDING.store(true, Ordering::SeqCst),
        Signal::SIGINT | Signal::SIGTERM => EXIT_SIGNAL.store(raw, Ordering::SeqCst),
        _ => {}
    }
}

fn route_in_child(signal: Signal) {
    let ctx = CHILD_CONTEXT.load(Ordering::SeqCst);
    match signal {
        Signal::SIGHUP => {
            if !ctx.is_null() {
                let ctx = unsafe { &*ctx };
                if let Some(on_sighup) = &ctx.on_sighup {
                    on_sighup(&ctx.bucket);
                }
            }
        }
        Signal::SIGINT | Signal::SIGTERM => {
            if !ctx.is_null() {
                let ctx = unsafe { &*ctx };
                if let Some(on_exit) = &ctx.on_exit {
                    on_exit(&ctx.bucket);
                }
            }
            std::process::exit(SIGNAL_EXIT_CODE);
        }
        _ => {}
    }
}

/// Install the supervisor's handler and ignore sets. Idempotent.
pub(crate) fn install_handlers() -> Result<()> {
    let routed = SigAction::new(
        SigHandler::Handler(route_signal),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    for signal in SUPERVISED_SIGNALS {
        unsafe { sigaction(signal, &routed) }.map_err(PreforkError::SignalSetup)?;
    }

    let ignored = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for signal in IGNORED_SIGNALS {
        unsafe { sigaction(signal, &ignored) }.map_err(PreforkError::SignalSetup)?;
    }
    Ok(())
}

/// Consume the pending-reap flag.
pub(crate) fn take_reap_pending() -> bool {
    REAP_PENDING.swap(false, Ordering::SeqCst)
}

/// Consume the pending-hangup flag.
pub(crate) fn take_hup_pending() -> bool {
    HUP_PENDING.swap(false, Ordering::SeqCst)
}

/// Consume a pending exit request, if one arrived.
pub(crate) fn take_exit_signal() -> Option<Signal> {
    let raw = EXIT_SIGNAL.swap(0, Ordering::SeqCst);
    if raw == 0 {
        return None;
    }
    Signal::try_from(raw).ok()
}

/// Whether an exit request arrived but has not been drained yet.
pub(crate) fn exit_signal_pending() -> bool {
    EXIT_SIGNAL.load(Ordering::SeqCst) != 0
}

/// Whether this process is a forked child of the supervisor.
pub(crate) fn is_child_process() -> bool {
    CHILD_PROCESS.load(Ordering::SeqCst)
}

/// Flip the process into child mode and publish its signal context. Called
/// exactly once, in the child branch right after fork; the allocation is
/// intentionally leaked so the handler can read it without locking.
pub(crate) fn enter_child(ctx: ChildContext) {
    let leaked = Box::into_raw(Box::new(ctx));
    CHILD_CONTEXT.store(leaked, Ordering::SeqCst);
    CHILD_PROCESS.store(true, Ordering::SeqCst);
}

/// The bucket this child process belongs to.
pub(crate) fn child_bucket() -> Option<String> {
    let ctx = CHILD_CONTEXT.load(Ordering::SeqCst);
    if ctx.is_null() {
        return None;
    }
    Some(unsafe { &*ctx }.bucket.clone())
}

/// Send one result frame from the child to its parent.
pub(crate) fn child_send(value: &Value) -> Result<()> {
    let ctx = CHILD_CONTEXT.load(Ordering::SeqCst);
    if ctx.is_null() {
        return Err(PreforkError::NotChild);
    }
    let ctx = unsafe { &*ctx };
    let mut channel = ctx
        .channel
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    channel.send(value)
}

/// RAII block of supervised-signal delivery around multi-step updates (frame
/// I/O, the fork transaction). Restores the previous mask on drop.
pub(crate) struct SignalMask {
    previous: SigSet,
}

impl SignalMask {
    pub fn block() -> Result<Self> {
        let mut set = SigSet::empty();
        for signal in SUPERVISED_SIGNALS {
            set.add(signal);
        }
        let mut previous = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(PreforkError::SignalSetup)?;
        Ok(Self { previous })
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

/// Why a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(Signal::SIGKILL) => {
                write!(f, "killed by SIGKILL (forced or out of memory)")
            }
            Self::Signaled(signal) => write!(f, "killed by signal {signal:?}"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Classify a `WaitStatus` from the reaper.
pub(crate) fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));
        assert!(analyze_wait_status(status).is_clean());

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
        assert!(!analyze_wait_status(status).is_clean());

        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_signal_mask_restores_on_drop() {
        let before = SigSet::thread_get_mask().unwrap();
        {
            let _mask = SignalMask::block().unwrap();
            let during = SigSet::thread_get_mask().unwrap();
            assert!(during.contains(Signal::SIGCHLD));
        }
        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(
            after.contains(Signal::SIGCHLD),
            before.contains(Signal::SIGCHLD)
        );
    }

}
