//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use socm::enactor::{Enactor, ExecutionRecord, StateCallback, StateUpdate};
use socm::predictor::{JobMetadata, JobRecord, Predictor, PredictionOutcome};
use socm::resource::{QosPolicy, Resource};
use socm::states::State;
use socm::{CampaignError, ExecutionSchema, ResourceRequest, Session, Workflow};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn session() -> (tempfile::TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create_in(dir.path()).unwrap();
    (dir, session)
}

pub fn workflow(id: u32, name: &str, cpus: u32, memory_mb: u64, runtime_minutes: f64) -> Workflow {
    Workflow {
        id,
        name: name.to_string(),
        executable: "so-site-pipeline".to_string(),
        subcommand: Some("make-filterbin-map".to_string()),
        arguments: vec![format!("config{id}.yaml")],
        environment: BTreeMap::new(),
        resources: ResourceRequest {
            ranks: cpus,
            threads: 1,
            memory_mb,
            runtime_minutes,
        },
        depends: vec![],
    }
}

/// A small cluster: one QoS, plenty of room.
pub fn testbed(nodes: u32, cores_per_node: u32, memory_per_node_mb: u64) -> Resource {
    Resource::new(
        "testbed",
        nodes,
        cores_per_node,
        memory_per_node_mb,
        vec![QosPolicy::new("main", Some(100_000), None, None)],
    )
}

/// Poll until `condition` holds, or panic after `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// An enactor whose completions are driven by the test: `enact` marks
/// workflows executing, nothing finishes until `complete` is called.
pub struct ManualEnactor {
    records: Mutex<HashMap<u32, ExecutionRecord>>,
    enact_log: Mutex<Vec<Vec<u32>>>,
    callbacks: Mutex<HashMap<String, StateCallback>>,
}

impl ManualEnactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            enact_log: Mutex::new(Vec::new()),
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Every workflow id ever enacted, in submission order.
    pub fn enacted(&self) -> Vec<u32> {
        self.enact_log.lock().iter().flatten().copied().collect()
    }

    /// Batches as they were submitted.
    pub fn batches(&self) -> Vec<Vec<u32>> {
        self.enact_log.lock().clone()
    }

    /// Flip workflows to `Done` and notify, as the batch system would.
    pub fn complete(&self, ids: &[u32]) {
        self.finish(ids, State::Done);
    }

    /// Flip workflows to `Failed` and notify.
    pub fn fail(&self, ids: &[u32]) {
        self.finish(ids, State::Failed);
    }

    fn finish(&self, ids: &[u32], state: State) {
        {
            let mut records = self.records.lock();
            for id in ids {
                if let Some(record) = records.get_mut(id) {
                    record.state = state;
                    record.end_time = Some(chrono::Utc::now());
                    record.step_id = Some("1000.0".to_string());
                }
            }
        }
        self.fire(&StateUpdate {
            workflow_ids: ids.to_vec(),
            new_state: state,
            step_ids: vec![Some("1000.0".to_string()); ids.len()],
        });
    }

    fn fire(&self, update: &StateUpdate) {
        let callbacks: Vec<StateCallback> = self.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(update);
        }
    }
}

impl Enactor for ManualEnactor {
    fn setup(
        &self,
        _resource: &Resource,
        _walltime_minutes: u32,
        _cores: u32,
        _schema: ExecutionSchema,
        _qos: Option<&QosPolicy>,
    ) -> Result<(), CampaignError> {
        Ok(())
    }

    fn enact(&self, workflows: &[Workflow]) {
        let mut batch = Vec::new();
        {
            let mut records = self.records.lock();
            for workflow in workflows {
                if records.contains_key(&workflow.id) {
                    continue;
                }
                records.insert(
                    workflow.id,
                    ExecutionRecord {
                        state: State::Executing,
                        start_time: chrono::Utc::now(),
                        end_time: None,
                        step_id: None,
                    },
                );
                batch.push(workflow.id);
            }
        }
        if batch.is_empty() {
            return;
        }
        self.enact_log.lock().push(batch.clone());
        for id in batch {
            self.fire(&StateUpdate {
                workflow_ids: vec![id],
                new_state: State::Executing,
                step_ids: vec![None],
            });
        }
    }

    fn register_state_cb(&self, name: &str, callback: StateCallback) {
        self.callbacks.lock().insert(name.to_string(), callback);
    }

    fn get_status(&self, ids: Option<&[u32]>) -> HashMap<u32, State> {
        let records = self.records.lock();
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| records.get(id).map(|record| (*id, record.state)))
                .collect(),
            None => records
                .iter()
                .map(|(id, record)| (*id, record.state))
                .collect(),
        }
    }

    fn execution_record(&self, id: u32) -> Option<ExecutionRecord> {
        self.records.lock().get(&id).cloned()
    }

    fn terminate(&self) {}
}

/// Predictor that never predicts but remembers every record it is handed.
pub struct CountingPredictor {
    records: Mutex<Vec<JobRecord>>,
}

impl CountingPredictor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn records(&self) -> Vec<JobRecord> {
        self.records.lock().clone()
    }
}

impl Predictor for CountingPredictor {
    fn predict(&self, _command: &str, _job_name: &str) -> PredictionOutcome {
        PredictionOutcome::default()
    }

    fn job_metadata(&self, _step_id: &str) -> Option<JobMetadata> {
        None
    }

    fn raw_record(&self, record: &JobRecord) -> Result<(), CampaignError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
