//! Crash-recovery: persist through a FileStore, "restart" by rebuilding the
//! engine from the same file, and re-attach runners the way the server does.

mod common;

use common::{Harness, ScriptedProcs, user_file};
use spoolq_core::protocol::{JobSelector, JobState, NewJob};
use spoolq_engine::{Engine, EngineConfig, FileStore, Outbox, RespawnMode};

fn cfg() -> EngineConfig {
    EngineConfig {
        max_slots: 2,
        sched_seed: Some(7),
        ..EngineConfig::default()
    }
}

#[test]
fn restart_restores_order_jobs_and_ids() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");

    // First server lifetime: a finished job, two survivors mid-run, one
    // locked job, one queued job moved to the head.
    let store = Box::new(FileStore::open(state.clone()).unwrap());
    let mut h = Harness::with_config(cfg(), &[("ana", 1001, 4)], store);

    let (_, running) = h.submit(1001, Harness::simple_job("sleep 600"));
    let running = running.unwrap();
    let (_, filler) = h.submit(1001, Harness::simple_job("true"));
    let filler = filler.unwrap();
    h.run_orders();
    h.start(running, 3100);
    h.start(filler, 3101);
    h.finish(filler, 0);

    let (_, blocker) = h.submit(1001, Harness::simple_job("sleep 600"));
    let blocker = blocker.unwrap();
    h.run_orders();
    h.start(blocker, 3102);

    let (_, q1) = h.submit(1001, Harness::simple_job("echo q1"));
    let (_, q2) = h.submit(1001, Harness::simple_job("echo q2"));
    let (q1, q2) = (q1.unwrap(), q2.unwrap());

    let owner = h.client();
    h.engine.hold_job(owner, 1001, JobSelector::Id(q1), &mut h.out);
    assert_eq!(h.engine.job_state(q1), Some(JobState::Locked));
    h.engine.move_urgent(owner, 1001, JobSelector::Id(q2), &mut h.out);

    let expected_active = h.engine.active_ids();
    assert_eq!(expected_active[0], q2);
    let last_id = h.engine.last_allocated_id();

    // "Crash": drop the engine, keep the file; both running pids survive.
    drop(h);
    let procs = ScriptedProcs::default();
    procs.spawn(3100, 1001);
    procs.spawn(3102, 1001);

    let store = Box::new(FileStore::open(state).unwrap());
    let mut engine = Engine::new(cfg(), &user_file(&[("ana", 1001, 4)]), store, Box::new(procs.clone()));
    let respawns = engine.recover();

    assert_eq!(engine.active_ids(), expected_active);
    assert_eq!(engine.finished_ids(), vec![filler]);
    assert_eq!(engine.last_allocated_id(), last_id);
    assert_eq!(engine.job_state(running), Some(JobState::Delink));
    assert_eq!(engine.job_state(blocker), Some(JobState::Delink));
    assert_eq!(engine.job_state(q1), Some(JobState::Locked));
    assert_eq!(engine.job_state(q2), Some(JobState::Wait));
    assert_eq!(engine.busy_slots(), 0, "nothing is charged until re-attach");
    engine.assert_invariants();

    assert!(respawns
        .iter()
        .any(|r| r.jobid == running && r.mode == RespawnMode::Relink { pid: 3100 }));
    assert!(respawns
        .iter()
        .any(|r| r.jobid == blocker && r.mode == RespawnMode::Relink { pid: 3102 }));
    assert!(respawns
        .iter()
        .any(|r| r.jobid == q2 && r.mode == RespawnMode::Fresh));
    assert!(respawns
        .iter()
        .any(|r| r.jobid == q1 && r.mode == RespawnMode::Fresh));

    // The respawned runners re-register.
    let mut out = Outbox::new();
    let relink_runner = spoolq_engine::ClientId(900);
    engine.submit(
        relink_runner,
        1001,
        NewJob {
            supplied_id: Some(running),
            taskpid: Some(3100),
            num_slots: 1,
            command: String::new(),
            ..NewJob::default()
        },
        &mut out,
    );
    assert_eq!(engine.job_state(running), Some(JobState::Running));
    assert_eq!(engine.busy_slots(), 1);
    engine.assert_invariants();

    let fresh_runner = spoolq_engine::ClientId(901);
    engine.submit(
        fresh_runner,
        1001,
        NewJob {
            supplied_id: Some(q2),
            num_slots: 1,
            command: String::new(),
            ..NewJob::default()
        },
        &mut out,
    );
    // q2 queues and, with a slot free, dispatches straight away.
    assert_eq!(engine.job_state(q2), Some(JobState::Running));
    engine.assert_invariants();

    // The locked job re-registers but stays locked.
    let locked_runner = spoolq_engine::ClientId(902);
    engine.submit(
        locked_runner,
        1001,
        NewJob {
            supplied_id: Some(q1),
            num_slots: 1,
            command: String::new(),
            ..NewJob::default()
        },
        &mut out,
    );
    assert_eq!(engine.job_state(q1), Some(JobState::Locked));
    engine.assert_invariants();
}

#[test]
fn dead_pid_records_are_dropped_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");

    let store = Box::new(FileStore::open(state.clone()).unwrap());
    let mut h = Harness::with_config(cfg(), &[("ana", 1001, 4)], store);
    let (_, id) = h.submit(1001, Harness::simple_job("sleep 600"));
    let id = id.unwrap();
    h.run_orders();
    h.start(id, 3200);
    drop(h);

    // Nothing alive this time.
    let procs = ScriptedProcs::default();
    let store = Box::new(FileStore::open(state.clone()).unwrap());
    let mut engine = Engine::new(cfg(), &user_file(&[("ana", 1001, 4)]), store, Box::new(procs));
    let respawns = engine.recover();

    assert!(respawns.is_empty());
    assert!(engine.job(id).is_none());

    // And the deletion is durable.
    let store = FileStore::open(state).unwrap();
    use spoolq_engine::{JobStore, Table};
    assert!(store.read_all_ids_in_table(Table::Jobs).is_empty());
}

#[test]
fn pid_owned_by_someone_else_is_not_relinked() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");

    let store = Box::new(FileStore::open(state.clone()).unwrap());
    let mut h = Harness::with_config(cfg(), &[("ana", 1001, 4)], store);
    let (_, id) = h.submit(1001, Harness::simple_job("sleep 600"));
    let id = id.unwrap();
    h.run_orders();
    h.start(id, 3300);
    drop(h);

    // The pid was recycled by another user between server lifetimes.
    let procs = ScriptedProcs::default();
    procs.spawn(3300, 4444);
    let store = Box::new(FileStore::open(state).unwrap());
    let mut engine = Engine::new(cfg(), &user_file(&[("ana", 1001, 4)]), store, Box::new(procs));
    let respawns = engine.recover();

    assert!(respawns.is_empty());
    assert!(engine.job(id).is_none());
}

#[test]
fn recovered_paused_pid_comes_back_paused() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");

    let store = Box::new(FileStore::open(state.clone()).unwrap());
    let mut h = Harness::with_config(cfg(), &[("ana", 1001, 4)], store);
    let (_, id) = h.submit(1001, Harness::simple_job("sleep 600"));
    let id = id.unwrap();
    h.run_orders();
    h.start(id, 3400);
    let owner = h.client();
    h.engine.hold_job(owner, 1001, JobSelector::Id(id), &mut h.out);
    assert_eq!(h.engine.job_state(id), Some(JobState::Paused));
    drop(h);

    // The stopped process survives the restart, still stopped.
    let procs = ScriptedProcs::default();
    procs.spawn(3400, 1001);
    procs.stop_by_hand(3400);
    let store = Box::new(FileStore::open(state).unwrap());
    let mut engine = Engine::new(cfg(), &user_file(&[("ana", 1001, 4)]), store, Box::new(procs));
    let respawns = engine.recover();
    assert_eq!(respawns.len(), 1);
    assert_eq!(engine.job_state(id), Some(JobState::Delink));

    let mut out = Outbox::new();
    engine.submit(
        spoolq_engine::ClientId(910),
        1001,
        NewJob {
            supplied_id: Some(id),
            taskpid: Some(3400),
            num_slots: 1,
            command: String::new(),
            ..NewJob::default()
        },
        &mut out,
    );
    assert_eq!(engine.job_state(id), Some(JobState::Paused));
    assert_eq!(engine.busy_slots(), 0);
    engine.assert_invariants();
}
