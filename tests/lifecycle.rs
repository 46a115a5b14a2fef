//! Child lifecycle tests: helper respawn, run-limit enforcement, graceful
//! kill, and persistent-mode pools. One test function, sequential phases,
//! one supervisor alive at a time (the reaper waits on any child).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use prefork::{DEFAULT_BUCKET, Pid, PreforkError, Supervisor, SupervisorConfig, WorkBatch};
use serde_json::json;

fn settle() {
    std::thread::sleep(Duration::from_millis(400));
}

#[test]
fn child_lifecycle_phases() {
    helper_respawn_phase();
    manual_revival_phase();
    run_limit_phase();
    graceful_kill_phase();
    persistent_pool_phase();
}

/// A helper with respawn set comes back after an external kill; manual
/// respawn forks another copy from the stored function and arguments.
fn helper_respawn_phase() {
    let mut sup = Supervisor::new(SupervisorConfig::default()).unwrap();

    let first = sup
        .helper_process_spawn(
            |_args| std::thread::sleep(Duration::from_secs(30)),
            json!({"role": "watcher"}),
            "watch",
            true,
        )
        .unwrap();
    assert_eq!(sup.active_children(None), 1);

    // Kill it out from under the supervisor; the reaper must bring it back.
    kill(first, Signal::SIGKILL).unwrap();
    settle();
    sup.process_work(false, DEFAULT_BUCKET, false).unwrap();
    assert_eq!(
        sup.active_children(None),
        1,
        "helper respawned within one reaper cycle"
    );

    // Manual respawn adds a second copy of the same helper.
    sup.helper_process_respawn("watch").unwrap();
    assert_eq!(sup.active_children(None), 2);

    assert!(matches!(
        sup.helper_process_respawn("nosuch"),
        Err(PreforkError::HelperNotFound(_))
    ));
    // Dropping the supervisor clears respawn flags and kills the family.
}

/// A helper spawned without the respawn flag stays down after death; manual
/// revival still works once its table record has been reaped and swept.
fn manual_revival_phase() {
    let mut sup = Supervisor::new(SupervisorConfig::default()).unwrap();

    let first = sup
        .helper_process_spawn(
            |_args| std::thread::sleep(Duration::from_secs(30)),
            json!(null),
            "oneshot",
            false,
        )
        .unwrap();
    assert_eq!(sup.active_children(None), 1);

    kill(first, Signal::SIGKILL).unwrap();
    settle();
    sup.process_work(false, DEFAULT_BUCKET, false).unwrap();
    assert_eq!(
        sup.active_children(None),
        0,
        "respawn=false helpers stay down"
    );

    let revived = sup.helper_process_respawn("oneshot").unwrap();
    assert_ne!(revived, first);
    assert_eq!(sup.active_children(None), 1);
}

/// A child that outlives its bucket's run limit is killed by housekeeping
/// and the timeout callback fires exactly once.
fn run_limit_phase() {
    let mut sup = Supervisor::new(SupervisorConfig::default()).unwrap();
    sup.set_housekeeping_check_interval(Duration::from_secs(1));
    sup.set_max_children("slow", 1).unwrap();
    sup.set_child_max_run_time("slow", 1).unwrap();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let counted = timeouts.clone();
    sup.register_child_timeout("slow", move |_pid, _ident| {
        counted.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    sup.register_child_run("slow", |_batch: &WorkBatch| {
        std::thread::sleep(Duration::from_secs(30));
        None
    })
    .unwrap();

    sup.add_work(vec![json!("sleepy")], None, "slow", false).unwrap();
    sup.process_work(false, "slow", false).unwrap();
    assert_eq!(sup.active_children(Some("slow")), 1);

    // Drive housekeeping until the limit is enforced (the enforcement pass
    // itself includes a settling sleep before reaping).
    for _ in 0..20 {
        sup.process_work(false, "slow", false).unwrap();
        if timeouts.load(Ordering::SeqCst) > 0 && sup.active_children(Some("slow")) == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(300));
    }

    assert_eq!(timeouts.load(Ordering::SeqCst), 1, "timeout fires exactly once");
    assert_eq!(sup.active_children(Some("slow")), 0);
}

/// kill_child_pid interrupts a worker, which runs its exit callback and
/// leaves before the force-kill deadline.
fn graceful_kill_phase() {
    let mut sup = Supervisor::new(SupervisorConfig::default()).unwrap();
    sup.set_store_result(true);
    sup.set_max_children("sleepy", 1).unwrap();

    let forked: Arc<Mutex<Vec<Pid>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = forked.clone();
    sup.register_parent_fork("sleepy", move |pid, _ident| {
        sink.lock().unwrap().push(pid);
    })
    .unwrap();
    sup.register_child_exit("sleepy", |bucket| {
        let _ = Supervisor::child_send_result_to_parent(&json!({ "exiting": bucket }));
    })
    .unwrap();
    sup.register_child_run("sleepy", |_batch: &WorkBatch| {
        std::thread::sleep(Duration::from_secs(30));
        None
    })
    .unwrap();

    sup.add_work(vec![json!("nap")], None, "sleepy", false).unwrap();
    sup.process_work(false, "sleepy", false).unwrap();

    let pid = forked.lock().unwrap()[0];
    sup.kill_child_pid(&[pid], Duration::from_secs(3)).unwrap();
    assert_eq!(sup.active_children(Some("sleepy")), 0);
    assert_eq!(sup.work_running("sleepy"), 0);

    // The child's exit callback ran and its farewell frame made it back.
    let farewell = sup
        .get_result("sleepy", Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(farewell, Some(json!({ "exiting": "sleepy" })));
}

/// A persistent bucket holds a steady pool of workers fed the fixed
/// payload; shrinking the budget interrupts the excess.
fn persistent_pool_phase() {
    let mut sup = Supervisor::new(SupervisorConfig::default()).unwrap();
    sup.set_store_result(true);
    sup.set_max_children("pool", 3).unwrap();
    sup.set_child_persistent_mode("pool", true).unwrap();
    sup.set_child_persistent_mode_data("pool", json!({"cfg": 1}))
        .unwrap();

    sup.register_child_run("pool", |batch: &WorkBatch| {
        let WorkBatch::Persistent(data) = batch else {
            panic!("persistent bucket produced {batch:?}");
        };
        let _ = Supervisor::child_send_result_to_parent(data);
        std::thread::sleep(Duration::from_secs(30));
        None
    })
    .unwrap();

    sup.process_work(false, "pool", false).unwrap();
    assert_eq!(sup.active_children(Some("pool")), 3);

    // Every pool worker received the configured payload.
    for _ in 0..3 {
        let received = sup
            .get_result("pool", Some(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(received, Some(json!({"cfg": 1})));
    }

    // Shrinking the pool interrupts the two excess workers.
    sup.set_max_children("pool", 1).unwrap();
    settle();
    sup.process_work(false, "pool", false).unwrap();
    assert_eq!(sup.active_children(Some("pool")), 1);
    // The survivor is killed when the supervisor drops.
}
