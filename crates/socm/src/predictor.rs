//! The runtime-prediction and recording collaborator.
//!
//! The core never introspects how predictions are made or where records
//! land: the [`Predictor`] is handed in at bookkeeper construction and
//! treated as opaque. When it cannot predict (or predicts with warnings),
//! the bookkeeper falls back to the workflow's declared resources.

use crate::CampaignError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A predicted resource footprint for one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub runtime_minutes: f64,
    pub memory_mb: u64,
}

/// Outcome of a prediction query. A present prediction accompanied by
/// warnings is treated as untrusted.
#[derive(Debug, Clone, Default)]
pub struct PredictionOutcome {
    pub prediction: Option<Prediction>,
    pub warnings: Vec<String>,
}

/// Accounting metadata for a finished batch step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobMetadata {
    /// Peak resident memory in megabytes.
    pub max_rss_mb: u64,
    pub elapsed_minutes: f64,
}

/// One finished workflow's record, fed back for future predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_name: String,
    pub cluster_step_id: Option<String>,
    pub categorical: BTreeMap<String, String>,
    pub numerical: BTreeMap<String, f64>,
    pub memory_mb: u64,
    pub runtime_minutes: f64,
    pub command: String,
}

pub trait Predictor: Send + Sync {
    /// Predict the footprint of `command` submitted under `job_name`.
    fn predict(&self, command: &str, job_name: &str) -> PredictionOutcome;

    /// Look up accounting metadata for a finished step, when the backing
    /// store has it.
    fn job_metadata(&self, step_id: &str) -> Option<JobMetadata>;

    /// Persist one finished workflow's record.
    fn raw_record(&self, record: &JobRecord) -> Result<(), CampaignError>;
}

/// Predictor that never predicts and records nowhere; the dry-run
/// collaborator.
#[derive(Debug, Default)]
pub struct NullPredictor;

impl Predictor for NullPredictor {
    fn predict(&self, _command: &str, _job_name: &str) -> PredictionOutcome {
        PredictionOutcome::default()
    }

    fn job_metadata(&self, _step_id: &str) -> Option<JobMetadata> {
        None
    }

    fn raw_record(&self, _record: &JobRecord) -> Result<(), CampaignError> {
        Ok(())
    }
}
