//! Core data model: workflows, campaigns, and resource requests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared resource request of a single workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Number of MPI ranks.
    pub ranks: u32,
    /// Threads per rank.
    pub threads: u32,
    /// Memory in megabytes over the whole workflow.
    pub memory_mb: u64,
    /// Declared runtime in minutes.
    pub runtime_minutes: f64,
}

/// A single batch-submittable unit of compute.
///
/// The orchestration core never interprets the payload: `executable`,
/// `arguments` and `environment` are passed through verbatim to the batch
/// system when the workflow is enacted. How a command line is put together
/// for a particular pipeline is the driver's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique within the campaign, assigned by the driver.
    pub id: u32,
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub subcommand: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub resources: ResourceRequest,
    /// Names of workflows that must reach `Done` before this one may start.
    #[serde(default)]
    pub depends: Vec<String>,
}

impl Workflow {
    /// Total cores this workflow occupies.
    pub fn cores(&self) -> u32 {
        self.resources.ranks * self.resources.threads
    }

    /// The full command line, used for prediction and recording only.
    pub fn command(&self) -> String {
        let mut parts = Vec::with_capacity(2 + self.arguments.len());
        parts.push(self.executable.clone());
        if let Some(sub) = &self.subcommand {
            parts.push(sub.clone());
        }
        parts.extend(self.arguments.iter().cloned());
        parts.join(" ")
    }

    /// Numeric fields handed to the recorder.
    pub fn numeric_fields(&self) -> BTreeMap<String, f64> {
        let mut fields = BTreeMap::new();
        fields.insert("ranks".to_string(), f64::from(self.resources.ranks));
        fields.insert("threads".to_string(), f64::from(self.resources.threads));
        fields
    }

    /// Categorical fields handed to the recorder.
    pub fn categorical_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        if let Some(sub) = &self.subcommand {
            fields.insert("subcommand".to_string(), sub.clone());
        }
        if !self.arguments.is_empty() {
            fields.insert("arguments".to_string(), self.arguments.join(" "));
        }
        fields
    }
}

/// How the pilot allocation is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSchema {
    /// The caller fixes the core count up front.
    Batch,
    /// The planner sizes the allocation against the deadline and QoS limits.
    Remote,
}

impl ExecutionSchema {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionSchema::Batch => "batch",
            ExecutionSchema::Remote => "remote",
        }
    }
}

/// A deadline-bounded, DAG-structured collection of workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: u32,
    pub workflows: Vec<Workflow>,
    /// Maximum walltime for the whole campaign, in minutes.
    pub deadline_minutes: f64,
    /// Name of the target resource in the registry.
    pub resource: String,
    pub execution_schema: ExecutionSchema,
    /// Core count for `Batch` mode; ignored in `Remote` mode.
    #[serde(default)]
    pub requested_cores: Option<u32>,
    /// Scheduling policy. `"time"` is the only value the core reads.
    pub policy: String,
}

/// Planner-facing requirements for one workflow, either predicted or
/// derived from the declared request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Requirements {
    pub cpus: u32,
    pub memory_mb: u64,
    pub walltime_minutes: f64,
}
