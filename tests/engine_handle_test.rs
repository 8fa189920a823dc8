//! Engines moved into their own task and controlled through a handle.

mod common;

use common::{add_all, probe, FlagCondition, Journal, Mode};
use daq_sequencer::messages::EventKind;
use daq_sequencer::{Engine, Outcome, TaskState};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_events_follow_task_lifecycle() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let list = engine.task_list();
    let (a, _) = probe(&mut engine, &journal, "a", Mode::Immediate);
    add_all(&mut engine, list, &[a]);

    let mut events = engine.subscribe();
    let (_handle, task) = engine.spawn(list);
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push((event.task, event.kind));
    }
    assert_eq!(
        seen,
        vec![
            (list, EventKind::Started),
            (a, EventKind::Started),
            (
                a,
                EventKind::Finished {
                    outcome: Outcome::Succeeded
                }
            ),
            (
                list,
                EventKind::Finished {
                    outcome: Outcome::Succeeded
                }
            ),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_through_handle_unwinds_scheduler() {
    let journal = Journal::new();
    let mut engine: Engine = Engine::default();
    let root = engine.wait_scheduler();
    let (condition, _busy) = FlagCondition::new(&journal, "stage", true);
    let wait = engine.wait_for(condition);
    let barrier = engine.barrier();
    add_all(&mut engine, root, &[wait, barrier]);

    let (handle, task) = engine.spawn(root);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.state(root).await.unwrap(), Some(TaskState::Running));

    handle.stop(root).await.unwrap();
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.outcome, Outcome::Failed);
    assert!(journal.contains("stage:stop"));
    assert!(journal.contains("stage:finish"));
}
