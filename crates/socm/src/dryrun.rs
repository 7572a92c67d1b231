//! Dry-run enactor: plan verification without touching the cluster.
//!
//! This is not a test artifact. `--dry-run` exercises the whole planning
//! and submission pipeline with an enactor whose submit is a no-op and
//! whose monitor reports success immediately, so a campaign configuration
//! can be validated end to end before burning allocation hours.

use crate::enactor::{Enactor, EnactorCore, ExecutionRecord, StateCallback, StateUpdate};
use crate::models::{ExecutionSchema, Workflow};
use crate::resource::{QosPolicy, Resource};
use crate::session::{Profiler, Session};
use crate::states::State;
use crate::CampaignError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

pub struct DryrunEnactor {
    inner: Arc<DryrunInner>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
}

struct DryrunInner {
    core: EnactorCore,
    profiler: Profiler,
    resource: Mutex<Option<String>>,
    tick: Duration,
}

impl DryrunEnactor {
    pub fn new(session: &Session) -> Self {
        Self::with_tick(session, Duration::from_secs(1))
    }

    /// A dry-run enactor whose monitor polls at `tick` intervals.
    pub fn with_tick(session: &Session, tick: Duration) -> Self {
        let uid = session.uid("enactor");
        let profiler = Profiler::new(session, &uid);
        profiler.prof("enactor_setup");
        info!(%uid, "dry-run enactor is ready");
        Self {
            inner: Arc::new(DryrunInner {
                core: EnactorCore::new(uid),
                profiler,
                resource: Mutex::new(None),
                tick,
            }),
            monitor_thread: Mutex::new(None),
        }
    }

    fn ensure_monitor(&self) {
        let mut guard = self.monitor_thread.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        info!(uid = %inner.core.uid, "starting monitor thread");
        *guard = Some(
            thread::Builder::new()
                .name("dryrun-monitor".to_string())
                .spawn(move || inner.monitor())
                .expect("spawning the dry-run monitor thread"),
        );
    }
}

impl DryrunInner {
    /// Every tracked workflow completes on the next pass.
    fn monitor(&self) {
        while !self.core.should_terminate() {
            let snapshot = self.core.monitor_snapshot();
            if !snapshot.is_empty() {
                self.profiler.prof("workflow_monitor_start");
                let step_ids: Vec<Option<String>> =
                    vec![Some("0".to_string()); snapshot.len()];
                let transitioned = self.core.finish(&snapshot, State::Done, &step_ids);
                if !transitioned.is_empty() {
                    debug!(uid = %self.core.uid, workflows = ?transitioned, "workflows done");
                    let step_ids = vec![Some("0".to_string()); transitioned.len()];
                    self.core.fire(&StateUpdate {
                        workflow_ids: transitioned,
                        new_state: State::Done,
                        step_ids,
                    });
                    self.profiler.prof("workflow_success");
                }
                self.profiler.prof("workflow_monitor_end");
            }
            thread::sleep(self.tick);
        }
        debug!(uid = %self.core.uid, "monitor thread stopped");
    }
}

impl Enactor for DryrunEnactor {
    fn setup(
        &self,
        resource: &Resource,
        walltime_minutes: u32,
        cores: u32,
        _schema: ExecutionSchema,
        _qos: Option<&QosPolicy>,
    ) -> Result<(), CampaignError> {
        info!(
            uid = %self.inner.core.uid,
            resource = %resource.name,
            walltime_minutes,
            cores,
            "dry-run setup"
        );
        *self.inner.resource.lock() = Some(resource.name.clone());
        Ok(())
    }

    fn enact(&self, workflows: &[Workflow]) {
        self.inner.profiler.prof("enacting_start");
        for workflow in workflows {
            if self.inner.core.is_tracked(workflow.id) {
                info!(
                    uid = %self.inner.core.uid,
                    workflow = workflow.id,
                    "workflow already enacted, skipping"
                );
                continue;
            }
            self.inner.core.track_executing(workflow.id);
            info!(uid = %self.inner.core.uid, workflow = workflow.id, "enacting workflow");
            self.inner.core.fire(&StateUpdate {
                workflow_ids: vec![workflow.id],
                new_state: State::Executing,
                step_ids: vec![None],
            });
        }
        self.inner.profiler.prof("enacting_stop");
        self.ensure_monitor();
    }

    fn register_state_cb(&self, name: &str, callback: StateCallback) {
        self.inner.core.register_callback(name, callback);
    }

    fn get_status(&self, ids: Option<&[u32]>) -> HashMap<u32, State> {
        self.inner.core.status_snapshot(ids)
    }

    fn execution_record(&self, id: u32) -> Option<ExecutionRecord> {
        self.inner.core.record(id)
    }

    fn terminate(&self) {
        info!(uid = %self.inner.core.uid, "start terminating procedure");
        self.inner.profiler.prof("str_terminating");
        self.inner.core.request_terminate();
        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }
        self.inner.profiler.prof("monitor_terminated");
        debug!(uid = %self.inner.core.uid, "enactor terminated");
    }
}
