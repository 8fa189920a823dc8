//! Procedure files end to end: parse, build and run.

use daq_sequencer::procedure::{Procedure, RunState};
use daq_sequencer::{Engine, Outcome, SequencerError};
use std::io::Write;
use tempfile::NamedTempFile;

const SCAN: &str = r#"
name = "raman scan"

[[steps]]
type = "log"
message = "begin"

[[steps]]
type = "wait_start"
label = "grating"
duration = "800ms"
kind = "grating"

[[steps]]
type = "wait_start"
label = "laser"
duration = "1500ms"
initial_delay = "200ms"

[[steps]]
type = "barrier"

[[steps]]
type = "list"
repeat = 4

[[steps.steps]]
type = "delay"
duration = "50ms"

[[steps.steps]]
type = "count"

[[steps]]
type = "log"
message = "end"
"#;

fn write_procedure(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[tokio::test(start_paused = true)]
async fn test_scan_from_file_runs() {
    let file = write_procedure(SCAN);
    let procedure = Procedure::from_file(file.path()).unwrap();

    let mut engine = Engine::new(RunState::default());
    let root = procedure.build(&mut engine).unwrap();
    assert_eq!(engine.label(root).as_deref(), Some("raman scan"));

    assert_eq!(engine.run(root).await.unwrap(), Outcome::Succeeded);
    assert_eq!(engine.shared().repetition, 4);
    assert_eq!(engine.shared().log, vec!["begin".to_string(), "end".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_fail_step_ends_procedure() {
    let procedure = Procedure::from_toml_str(
        r#"
name = "broken"

[[steps]]
type = "count"

[[steps]]
type = "fail"
message = "detector saturated"

[[steps]]
type = "count"
"#,
    )
    .unwrap();

    let mut engine = Engine::new(RunState::default());
    let root = procedure.build(&mut engine).unwrap();

    assert_eq!(engine.run(root).await.unwrap(), Outcome::Failed);
    assert_eq!(engine.shared().repetition, 1);
}

const THREE_TIMES: &str = r#"
name = "three times"
repeat = 3

[[steps]]
type = "wait_start"
label = "lamp"
duration = "100ms"

[[steps]]
type = "barrier"

[[steps]]
type = "count"
"#;

#[tokio::test(start_paused = true)]
async fn test_repeated_procedure_runs_from_root() {
    let procedure = Procedure::from_toml_str(THREE_TIMES).unwrap();
    let mut engine = Engine::new(RunState::default());
    let root = procedure.build(&mut engine).unwrap();

    assert_eq!(engine.run(root).await.unwrap(), Outcome::Succeeded);
    assert_eq!(engine.shared().repetition, 3);
    assert!(engine.children(root).is_empty(), "scheduler is retired after its last run");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_procedure_runs_when_spawned() {
    let procedure = Procedure::from_toml_str(THREE_TIMES).unwrap();
    let mut engine = Engine::new(RunState::default());
    let root = procedure.build(&mut engine).unwrap();

    let (_handle, task) = engine.spawn(root);
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.shared.repetition, 3);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Procedure::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, SequencerError::Io(_)));
}

#[test]
fn test_check_tree_dump() {
    let procedure = Procedure::from_toml_str(SCAN).unwrap();
    let mut engine = Engine::new(RunState::default());
    let root = procedure.build(&mut engine).unwrap();

    let dump = engine.describe(root);
    assert!(dump.starts_with("wait scheduler \"raman scan\""));
    assert!(dump.contains("wait adapter \"grating\" [condition 0]"));
    assert!(dump.contains("barrier \"barrier\" {0, 1}"));
    assert!(dump.contains("task list \"list\" x4"));
}
