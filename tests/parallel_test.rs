//! Fork/join behaviour of parallel tasks.

mod common;

use common::{add_all, probe, Journal, Mode};
use daq_sequencer::{Engine, Outcome, TaskState};

#[test]
fn test_finishes_after_last_branch() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let fork = engine.parallel(2);
    let (a, a_ctl) = probe(&mut engine, &journal, "a", Mode::Manual);
    let (b, b_ctl) = probe(&mut engine, &journal, "b", Mode::Manual);
    engine.add_branch_task(fork, 0, a).unwrap();
    engine.add_branch_task(fork, 1, b).unwrap();

    engine.start(fork).unwrap();
    assert!(journal.contains("a:start") && journal.contains("b:start"));

    b_ctl.complete();
    engine.run_until_idle();
    assert_eq!(engine.state(fork), Some(TaskState::Running));

    a_ctl.complete();
    engine.run_until_idle();
    assert_eq!(engine.outcome(fork), Some(Outcome::Succeeded));
}

#[test]
fn test_stop_after_one_branch_finished_waits_for_the_other() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let fork = engine.parallel(2);
    let (a, a_ctl) = probe(&mut engine, &journal, "a", Mode::Manual);
    let (b, b_ctl) = probe(&mut engine, &journal, "b", Mode::IgnoreStop);
    engine.add_branch_task(fork, 0, a).unwrap();
    engine.add_branch_task(fork, 1, b).unwrap();

    engine.start(fork).unwrap();
    a_ctl.complete();
    engine.run_until_idle();

    engine.stop(fork).unwrap();
    assert!(journal.contains("b:stop"));
    assert_eq!(
        engine.state(fork),
        Some(TaskState::Running),
        "fork must wait for branch 2 to acknowledge"
    );

    b_ctl.complete();
    engine.run_until_idle();
    assert_eq!(engine.outcome(fork), Some(Outcome::Failed));
}

#[test]
fn test_failing_branch_stops_siblings() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let fork = engine.parallel(2);
    let (slow, _) = probe(&mut engine, &journal, "slow", Mode::Manual);
    let (bad, bad_ctl) = probe(&mut engine, &journal, "bad", Mode::Manual);
    let (after, _) = probe(&mut engine, &journal, "after", Mode::Immediate);
    engine.add_branch_task(fork, 0, slow).unwrap();
    engine.add_branch_task(fork, 1, bad).unwrap();
    engine.add_branch_task(fork, 1, after).unwrap();

    engine.start(fork).unwrap();
    bad_ctl.fail();
    engine.run_until_idle();

    assert!(journal.contains("slow:stop"));
    assert!(!journal.contains("after:start"));
    assert_eq!(engine.outcome(fork), Some(Outcome::Failed));
}

#[test]
fn test_branches_run_nested_lists() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let fork = engine.parallel(2);
    let inner = engine.task_list();
    let (a, _) = probe(&mut engine, &journal, "a", Mode::Immediate);
    let (b, _) = probe(&mut engine, &journal, "b", Mode::Immediate);
    add_all(&mut engine, inner, &[a, b]);
    engine.add_branch_task(fork, 0, inner).unwrap();
    let (c, _) = probe(&mut engine, &journal, "c", Mode::Immediate);
    engine.add_branch_task(fork, 1, c).unwrap();

    engine.start(fork).unwrap();

    assert_eq!(engine.outcome(fork), Some(Outcome::Succeeded));
    assert!(journal.position("a:start") < journal.position("b:start"));
    assert!(journal.contains("c:start"));
}

#[test]
fn test_repeated_fork_inside_list() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let list = engine.task_list();
    let fork = engine.parallel(2);
    engine.set_repeat(fork, 2).unwrap();
    let (a, _) = probe(&mut engine, &journal, "a", Mode::Immediate);
    let (b, _) = probe(&mut engine, &journal, "b", Mode::Immediate);
    engine.add_branch_task(fork, 0, a).unwrap();
    engine.add_branch_task(fork, 1, b).unwrap();
    add_all(&mut engine, list, &[fork]);

    engine.start(list).unwrap();

    assert_eq!(journal.count("a:start"), 2);
    assert_eq!(journal.count("b:start"), 2);
    assert_eq!(engine.outcome(list), Some(Outcome::Succeeded));
    assert!(!engine.contains(fork));
}

#[test]
fn test_stop_of_idle_fork_is_ignored() {
    let mut engine: Engine = Engine::default();
    let fork = engine.parallel(1);
    engine.stop(fork).unwrap();
    assert_eq!(engine.state(fork), Some(TaskState::Idle));
}
