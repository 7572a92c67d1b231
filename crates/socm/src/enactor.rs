//! The enactor contract: the submission and monitoring boundary.
//!
//! An enactor owns the batch-system endpoint for one campaign. The
//! bookkeeper drives it through this trait and learns about progress via
//! registered state callbacks; it never talks to the batch system itself.

use crate::models::{ExecutionSchema, Workflow};
use crate::resource::{QosPolicy, Resource};
use crate::states::State;
use crate::CampaignError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// A batched state-change notification.
///
/// `step_ids` lines up with `workflow_ids`; entries are `None` until the
/// batch system has reported a job/step id for the workflow.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub workflow_ids: Vec<u32>,
    pub new_state: State,
    pub step_ids: Vec<Option<String>>,
}

/// Callback invoked by an enactor after a state change is committed.
/// Callbacks run on the enactor's monitor thread and must not block
/// indefinitely.
pub type StateCallback = Arc<dyn Fn(&StateUpdate) + Send + Sync>;

/// Execution bookkeeping for one enacted workflow.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub state: State,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub step_id: Option<String>,
}

impl ExecutionRecord {
    /// Observed wall-clock runtime in minutes, once finished.
    pub fn elapsed_minutes(&self) -> Option<f64> {
        let end = self.end_time?;
        Some((end - self.start_time).num_milliseconds() as f64 / 60_000.0)
    }
}

/// The submission endpoint the bookkeeper depends on.
pub trait Enactor: Send + Sync {
    /// Allocate one pilot of `cores` cores for `walltime_minutes` on the
    /// resource. Blocks until the pilot is live. Idempotent per instance.
    fn setup(
        &self,
        resource: &Resource,
        walltime_minutes: u32,
        cores: u32,
        schema: ExecutionSchema,
        qos: Option<&QosPolicy>,
    ) -> Result<(), CampaignError>;

    /// Submit workflows for execution. Already-tracked workflows are
    /// skipped; a failed submission leaves its workflows untracked so the
    /// bookkeeper retries them on the next tick.
    fn enact(&self, workflows: &[Workflow]);

    /// Register a state callback under a name; re-registering a name
    /// replaces the previous callback.
    fn register_state_cb(&self, name: &str, callback: StateCallback);

    /// Snapshot of workflow states, restricted to `ids` when given.
    fn get_status(&self, ids: Option<&[u32]>) -> HashMap<u32, State>;

    /// Execution record of one tracked workflow.
    fn execution_record(&self, id: u32) -> Option<ExecutionRecord>;

    /// Stop monitoring and tear the pilot down.
    fn terminate(&self);
}

/// State shared by the concrete enactors: tracked workflows, the monitor
/// list, and the callback table. Two locks, per the concurrency design:
/// `status` guards the monitor list and per-workflow records, `callbacks`
/// guards the callback table.
pub(crate) struct EnactorCore {
    status: Mutex<EnactorStatus>,
    callbacks: Mutex<HashMap<String, StateCallback>>,
    terminate: AtomicBool,
    pub(crate) uid: String,
}

pub(crate) struct EnactorStatus {
    pub(crate) records: HashMap<u32, ExecutionRecord>,
    pub(crate) to_monitor: Vec<u32>,
}

impl EnactorCore {
    pub(crate) fn new(uid: String) -> Self {
        Self {
            status: Mutex::new(EnactorStatus {
                records: HashMap::new(),
                to_monitor: Vec::new(),
            }),
            callbacks: Mutex::new(HashMap::new()),
            terminate: AtomicBool::new(false),
            uid,
        }
    }

    pub(crate) fn is_tracked(&self, id: u32) -> bool {
        self.status.lock().records.contains_key(&id)
    }

    /// Commit a workflow as executing and add it to the monitor list.
    pub(crate) fn track_executing(&self, id: u32) {
        let mut status = self.status.lock();
        status.records.insert(
            id,
            ExecutionRecord {
                state: State::Executing,
                start_time: Utc::now(),
                end_time: None,
                step_id: None,
            },
        );
        status.to_monitor.push(id);
    }

    /// Commit final states for a batch of workflows and drop them from the
    /// monitor list. Returns the ids actually transitioned.
    pub(crate) fn finish(&self, ids: &[u32], new_state: State, step_ids: &[Option<String>]) -> Vec<u32> {
        let mut status = self.status.lock();
        let mut transitioned = Vec::with_capacity(ids.len());
        for (id, step_id) in ids.iter().zip(step_ids) {
            if let Some(record) = status.records.get_mut(id) {
                if record.state.is_final() {
                    continue;
                }
                record.state = new_state;
                record.end_time = Some(Utc::now());
                record.step_id = step_id.clone();
                transitioned.push(*id);
            }
        }
        status.to_monitor.retain(|id| !transitioned.contains(id));
        transitioned
    }

    pub(crate) fn monitor_snapshot(&self) -> Vec<u32> {
        self.status.lock().to_monitor.clone()
    }

    pub(crate) fn record(&self, id: u32) -> Option<ExecutionRecord> {
        self.status.lock().records.get(&id).cloned()
    }

    pub(crate) fn status_snapshot(&self, ids: Option<&[u32]>) -> HashMap<u32, State> {
        let status = self.status.lock();
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| status.records.get(id).map(|record| (*id, record.state)))
                .collect(),
            None => status
                .records
                .iter()
                .map(|(id, record)| (*id, record.state))
                .collect(),
        }
    }

    pub(crate) fn register_callback(&self, name: &str, callback: StateCallback) {
        info!(uid = %self.uid, callback = name, "registering state callback");
        self.callbacks.lock().insert(name.to_string(), callback);
    }

    /// Invoke every registered callback. The caller must have committed
    /// the corresponding status change and released the status lock.
    pub(crate) fn fire(&self, update: &StateUpdate) {
        let callbacks: Vec<StateCallback> = self.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(update);
        }
    }

    pub(crate) fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub(crate) fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}
