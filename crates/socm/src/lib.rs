//! Campaign orchestration for batch-scheduled HPC clusters.
//!
//! This crate plans and executes a deadline-bounded campaign of workflows
//! on a shared cluster:
//! - HEFT-based planning onto contiguous core ranges under memory and QoS
//!   constraints (`planner`, `resource`)
//! - a bookkeeper control loop that gates submission on the plan DAG and
//!   verifies the deadline continuously (`bookkeeper`)
//! - an enactor boundary owning submission and monitoring against the
//!   batch system (`enactor`, `pilot`, `dryrun`, `batch`)
//!
//! Runtime prediction and recording is an opaque collaborator
//! (`predictor`), passed in at bookkeeper construction.

pub mod batch;
pub mod bookkeeper;
pub mod config;
pub mod dryrun;
pub mod enactor;
pub mod models;
pub mod pilot;
pub mod planner;
pub mod predictor;
pub mod resource;
pub mod session;
pub mod states;
pub mod viz;

pub use bookkeeper::{Bookkeeper, BookkeeperConfig};
pub use dryrun::DryrunEnactor;
pub use enactor::{Enactor, ExecutionRecord, StateCallback, StateUpdate};
pub use models::{Campaign, ExecutionSchema, Requirements, ResourceRequest, Workflow};
pub use pilot::PilotEnactor;
pub use planner::{HeftPlanner, PlanEntry, PlanGraph, PlanOutcome, StartTimes};
pub use predictor::{JobMetadata, JobRecord, NullPredictor, Prediction, PredictionOutcome, Predictor};
pub use resource::{registered_resources, QosPolicy, Resource};
pub use session::{Profiler, Session};
pub use states::{State, FINAL_STATES};

use thiserror::Error;

/// Errors raised while planning or executing a campaign.
///
/// Planner failures are campaign-fatal; submission and recording failures
/// are recoverable and handled where they occur.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign cannot finish by the deadline: makespan {makespan} min, deadline {deadline} min")]
    DeadlineUnreachable { makespan: f64, deadline: f64 },

    #[error("cannot place workflow {workflow} within the allocation ({required_mb} MB requested)")]
    InfeasibleMemory { workflow: String, required_mb: u64 },

    #[error("no QoS policy admits {cores} cores for {walltime_minutes} min")]
    NoMatchingQos { cores: u32, walltime_minutes: f64 },

    #[error("workflow {workflow} depends on unknown workflow {dependency}")]
    UnknownDependency { workflow: String, dependency: String },

    #[error("dependency cycle detected in the campaign")]
    CyclicDependency,

    #[error("unknown resource {name}")]
    UnknownResource { name: String },

    #[error("submission failed: {0}")]
    Submit(#[from] batch::BatchError),

    #[error("recorder rejected job data: {reason}")]
    Record { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}
