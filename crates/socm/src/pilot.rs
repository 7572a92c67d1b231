//! The pilot-backed enactor: real submission through a [`BatchClient`].
//!
//! One pilot allocation is requested during `setup`; workflows are then
//! submitted as task steps inside it. A background poll thread watches the
//! batch system, captures job/step ids from the post-exec echo, and fires
//! state callbacks as workflows reach final states.

use crate::batch::{
    BatchClient, PilotDescription, PilotHandle, TaskDescription, TaskState,
};
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
use tracing::{debug, error, info, warn};

/// Shell fragment appended to every task so the monitor can recover the
/// batch job/step id from stdout.
const STEP_ID_ECHO: &str = "echo ${SLURM_JOB_ID}.${SLURM_STEP_ID}";

pub struct PilotEnactor<C: BatchClient + 'static> {
    inner: Arc<PilotInner<C>>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
}

struct PilotInner<C> {
    core: EnactorCore,
    client: C,
    profiler: Profiler,
    pilot: Mutex<Option<PilotHandle>>,
    tick: Duration,
}

impl<C: BatchClient + 'static> PilotEnactor<C> {
    pub fn new(session: &Session, client: C) -> Self {
        Self::with_tick(session, client, Duration::from_secs(1))
    }

    /// A pilot enactor whose poll thread runs at `tick` intervals.
    pub fn with_tick(session: &Session, client: C, tick: Duration) -> Self {
        let uid = session.uid("enactor");
        let profiler = Profiler::new(session, &uid);
        profiler.prof("enactor_setup");
        info!(%uid, "pilot enactor is ready");
        Self {
            inner: Arc::new(PilotInner {
                core: EnactorCore::new(uid),
                client,
                profiler,
                pilot: Mutex::new(None),
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
                .name("pilot-monitor".to_string())
                .spawn(move || inner.monitor())
                .expect("spawning the pilot monitor thread"),
        );
    }

    fn task_description(workflow: &Workflow) -> TaskDescription {
        let mut arguments = Vec::with_capacity(1 + workflow.arguments.len());
        if let Some(sub) = &workflow.subcommand {
            arguments.push(sub.clone());
        }
        arguments.extend(workflow.arguments.iter().cloned());
        TaskDescription {
            uid: format!("workflow.{}", workflow.id),
            executable: workflow.executable.clone(),
            arguments,
            ranks: workflow.resources.ranks,
            cores_per_rank: workflow.resources.threads,
            memory_per_rank_mb: workflow.resources.memory_mb,
            environment: workflow.environment.clone(),
            post_exec: Some(STEP_ID_ECHO.to_string()),
        }
    }
}

impl<C: BatchClient> PilotInner<C> {
    /// Poll thread: drive every tracked workflow to a final state.
    fn monitor(&self) {
        while !self.core.should_terminate() {
            let snapshot = self.core.monitor_snapshot();
            if !snapshot.is_empty() {
                self.profiler.prof("workflow_monitor_start");
                let known = self.client.list_tasks();
                // Workflows completing on this tick, grouped by outcome so
                // each group gets one batched callback.
                let mut finished: HashMap<State, (Vec<u32>, Vec<Option<String>>)> =
                    HashMap::new();

                for id in snapshot {
                    let uid = format!("workflow.{id}");
                    if !known.contains(&uid) {
                        continue;
                    }
                    match self.client.get_task(&uid) {
                        Ok(Some(record)) if record.state.is_final() => {
                            let step_id = record
                                .stdout
                                .split_whitespace()
                                .last()
                                .map(str::to_string);
                            let state = match record.state {
                                TaskState::Failed => State::Failed,
                                TaskState::Canceled => State::Canceled,
                                _ => State::Done,
                            };
                            debug!(
                                uid = %self.core.uid,
                                workflow = id,
                                %state,
                                step_id = step_id.as_deref().unwrap_or("-"),
                                "workflow reached final state"
                            );
                            let slot = finished.entry(state).or_default();
                            slot.0.push(id);
                            slot.1.push(step_id);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            // Transient poll failures must not kill the
                            // monitor; the next tick retries.
                            warn!(uid = %self.core.uid, workflow = id, %err, "task poll failed");
                        }
                    }
                }

                for (state, (ids, step_ids)) in finished {
                    let transitioned = self.core.finish(&ids, state, &step_ids);
                    if transitioned.is_empty() {
                        continue;
                    }
                    let (ids, step_ids): (Vec<u32>, Vec<Option<String>>) = ids
                        .into_iter()
                        .zip(step_ids)
                        .filter(|(id, _)| transitioned.contains(id))
                        .unzip();
                    self.profiler.prof("workflow_success");
                    self.core.fire(&StateUpdate {
                        workflow_ids: ids,
                        new_state: state,
                        step_ids,
                    });
                }
                self.profiler.prof("workflow_monitor_end");
            }
            thread::sleep(self.tick);
        }
        debug!(uid = %self.core.uid, "monitor thread stopped");
    }
}

impl<C: BatchClient + 'static> Enactor for PilotEnactor<C> {
    fn setup(
        &self,
        resource: &Resource,
        walltime_minutes: u32,
        cores: u32,
        schema: ExecutionSchema,
        qos: Option<&QosPolicy>,
    ) -> Result<(), CampaignError> {
        let mut pilot = self.inner.pilot.lock();
        if pilot.is_some() {
            debug!(uid = %self.inner.core.uid, "pilot already set up");
            return Ok(());
        }
        let description = PilotDescription {
            resource: resource.name.clone(),
            access_schema: schema.as_str().to_string(),
            runtime_minutes: walltime_minutes,
            cores,
            qos: qos.map(|policy| policy.name.clone()),
        };
        info!(
            uid = %self.inner.core.uid,
            resource = %description.resource,
            cores,
            walltime_minutes,
            qos = description.qos.as_deref().unwrap_or("-"),
            "submitting pilot"
        );
        let handle = self.inner.client.submit_pilot(&description)?;
        self.inner.client.wait_pilot(&handle)?;
        *pilot = Some(handle);
        info!(uid = %self.inner.core.uid, "pilot is ready");
        Ok(())
    }

    fn enact(&self, workflows: &[Workflow]) {
        self.inner.profiler.prof("enacting_start");
        let fresh: Vec<&Workflow> = workflows
            .iter()
            .filter(|workflow| {
                if self.inner.core.is_tracked(workflow.id) {
                    info!(
                        uid = %self.inner.core.uid,
                        workflow = workflow.id,
                        "workflow already enacted, skipping"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        if fresh.is_empty() {
            return;
        }

        let descriptions: Vec<TaskDescription> = fresh
            .iter()
            .map(|workflow| Self::task_description(workflow))
            .collect();
        // Submit before committing state: a failed submission leaves the
        // workflows untracked, so the bookkeeper re-enacts them next tick.
        if let Err(err) = self.inner.client.submit_tasks(&descriptions) {
            error!(uid = %self.inner.core.uid, %err, "task submission failed");
            return;
        }

        for workflow in fresh {
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
        self.inner.client.close();
        debug!(uid = %self.inner.core.uid, "enactor terminated");
    }
}
