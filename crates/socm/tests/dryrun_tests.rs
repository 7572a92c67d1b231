//! The dry-run enactor: no-op submission, instant completion.

mod common;

use common::{session, testbed, wait_until, workflow};
use parking_lot::Mutex;
use socm::enactor::StateUpdate;
use socm::{DryrunEnactor, Enactor, ExecutionSchema, State};
use std::sync::Arc;
use std::time::Duration;

fn collecting_enactor() -> (tempfile::TempDir, DryrunEnactor, Arc<Mutex<Vec<StateUpdate>>>) {
    let (dir, session) = session();
    let enactor = DryrunEnactor::with_tick(&session, Duration::from_millis(5));
    let updates: Arc<Mutex<Vec<StateUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    enactor.register_state_cb(
        "collect",
        Arc::new(move |update: &StateUpdate| {
            sink.lock().push(update.clone());
        }),
    );
    (dir, enactor, updates)
}

#[test]
fn workflows_execute_and_complete_immediately() {
    let (_dir, enactor, updates) = collecting_enactor();
    let resource = testbed(1, 4, 1_000);
    enactor
        .setup(&resource, 60, 2, ExecutionSchema::Batch, None)
        .unwrap();

    enactor.enact(&[workflow(1, "W1", 1, 100, 10.0), workflow(2, "W2", 1, 100, 10.0)]);

    wait_until(Duration::from_secs(2), || {
        let status = enactor.get_status(None);
        status.len() == 2 && status.values().all(|state| *state == State::Done)
    });

    let updates = updates.lock();
    // Two EXECUTING singletons, then DONE for both (possibly batched).
    let executing: Vec<&StateUpdate> = updates
        .iter()
        .filter(|u| u.new_state == State::Executing)
        .collect();
    assert_eq!(executing.len(), 2);
    assert!(executing.iter().all(|u| u.step_ids == vec![None]));
    let done_ids: Vec<u32> = updates
        .iter()
        .filter(|u| u.new_state == State::Done)
        .flat_map(|u| u.workflow_ids.clone())
        .collect();
    assert_eq!(done_ids.len(), 2);

    enactor.terminate();
}

#[test]
fn done_updates_carry_step_ids() {
    let (_dir, enactor, updates) = collecting_enactor();
    enactor.enact(&[workflow(1, "W1", 1, 100, 10.0)]);
    wait_until(Duration::from_secs(2), || {
        enactor.get_status(Some(&[1])).get(&1) == Some(&State::Done)
    });
    enactor.terminate();

    let updates = updates.lock();
    let done = updates
        .iter()
        .find(|u| u.new_state == State::Done)
        .expect("a DONE update");
    assert_eq!(done.step_ids, vec![Some("0".to_string())]);
    let record = enactor.execution_record(1).unwrap();
    assert_eq!(record.state, State::Done);
    assert!(record.end_time.is_some());
}

#[test]
fn repeated_enact_is_skipped() {
    let (_dir, enactor, updates) = collecting_enactor();
    let wf = workflow(1, "W1", 1, 100, 10.0);
    enactor.enact(std::slice::from_ref(&wf));
    enactor.enact(std::slice::from_ref(&wf));

    wait_until(Duration::from_secs(2), || {
        enactor.get_status(Some(&[1])).get(&1) == Some(&State::Done)
    });
    enactor.terminate();

    let executing = updates
        .lock()
        .iter()
        .filter(|u| u.new_state == State::Executing)
        .count();
    assert_eq!(executing, 1);
}

#[test]
fn status_snapshot_filters_by_id() {
    let (_dir, enactor, _updates) = collecting_enactor();
    enactor.enact(&[workflow(1, "W1", 1, 100, 10.0), workflow(2, "W2", 1, 100, 10.0)]);
    wait_until(Duration::from_secs(2), || enactor.get_status(None).len() == 2);

    let only_one = enactor.get_status(Some(&[2]));
    assert_eq!(only_one.len(), 1);
    assert!(only_one.contains_key(&2));
    // Unknown ids are simply absent.
    assert!(enactor.get_status(Some(&[99])).is_empty());

    enactor.terminate();
}
