//! The opaque boundary to the batch system.
//!
//! The orchestration core talks to the cluster through [`BatchClient`]
//! only: one pilot allocation is submitted up front, workflows are then
//! submitted as task steps inside it and polled until they reach a final
//! state. Concrete clients (SLURM adapters, in-process fakes) live outside
//! the core.

use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by a batch-system client.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("pilot submission failed: {reason}")]
    PilotSubmit { reason: String },

    #[error("pilot never became active: {reason}")]
    PilotWait { reason: String },

    #[error("task submission failed: {reason}")]
    TaskSubmit { reason: String },

    #[error("task poll failed: {reason}")]
    Poll { reason: String },
}

/// Request for one long-running pilot allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PilotDescription {
    /// Resource name as the batch system knows it.
    pub resource: String,
    /// Access schema, e.g. `"batch"` or `"remote"`.
    pub access_schema: String,
    /// Pilot runtime budget in minutes.
    pub runtime_minutes: u32,
    /// Pilot size in cores.
    pub cores: u32,
    /// QoS to cite at submission, when the planner selected one.
    pub qos: Option<String>,
}

/// Handle to a submitted pilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PilotHandle {
    pub id: Uuid,
}

impl PilotHandle {
    pub fn generate() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

/// One workflow rendered as a batch task step.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescription {
    /// Stable task uid, `workflow.<id>`.
    pub uid: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub ranks: u32,
    pub cores_per_rank: u32,
    /// Memory per rank in megabytes.
    pub memory_per_rank_mb: u64,
    pub environment: BTreeMap<String, String>,
    /// Shell fragment run after the task; used to echo the job/step id.
    pub post_exec: Option<String>,
}

/// Batch-system view of a task's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_final(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Canceled)
    }
}

/// Poll snapshot of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub state: TaskState,
    /// Captured stdout; the last whitespace-separated token is the
    /// job/step id echoed by the post-exec hook.
    pub stdout: String,
}

/// The submission and poll interface the enactor depends on.
pub trait BatchClient: Send + Sync {
    /// Submit one pilot allocation.
    fn submit_pilot(&self, pilot: &PilotDescription) -> Result<PilotHandle, BatchError>;

    /// Block until the pilot is live.
    fn wait_pilot(&self, pilot: &PilotHandle) -> Result<(), BatchError>;

    /// Submit a batch of task steps into the pilot.
    fn submit_tasks(&self, tasks: &[TaskDescription]) -> Result<(), BatchError>;

    /// Uids of every task the batch system knows about.
    fn list_tasks(&self) -> Vec<String>;

    /// Poll one task.
    fn get_task(&self, uid: &str) -> Result<Option<TaskRecord>, BatchError>;

    /// Tear the session down.
    fn close(&self);
}
