//! The bookkeeper: lifecycle controller for one campaign.
//!
//! The bookkeeper drives planning, gates submission on the plan DAG,
//! verifies the deadline continuously, and records completed workflows.
//! Three threads cooperate per campaign: the caller blocks in [`Bookkeeper::run`],
//! a work thread plans and submits, and a monitor thread records
//! completions and releases cores. The enactor contributes its own poll
//! thread.

use crate::enactor::{Enactor, StateUpdate};
use crate::models::{Campaign, Requirements, Workflow};
use crate::planner::{HeftPlanner, PlanOutcome, StartTimes};
use crate::predictor::{JobRecord, Predictor};
use crate::resource::{registered_resources, Resource};
use crate::session::{Profiler, Session};
use crate::states::State;
use crate::CampaignError;
use parking_lot::Mutex;
use petgraph::Direction;
use std::collections::HashMap;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Loop pacing for the bookkeeper threads.
///
/// `tick` is the sleep at the end of each work/monitor iteration. `minute`
/// is the length of one campaign-clock minute; dry runs and tests compress
/// it to re-verify deadlines against simulated time.
#[derive(Debug, Clone)]
pub struct BookkeeperConfig {
    pub tick: Duration,
    pub minute: Duration,
}

impl Default for BookkeeperConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            minute: Duration::from_secs(60),
        }
    }
}

/// Top-level lifecycle controller for one campaign.
pub struct Bookkeeper {
    inner: Arc<Inner>,
}

struct Inner {
    campaign: Campaign,
    resource: Arc<Resource>,
    planner: HeftPlanner,
    enactor: Arc<dyn Enactor>,
    predictor: Arc<dyn Predictor>,
    shared: Arc<Shared>,
    profiler: Profiler,
    uid: String,
    config: BookkeeperConfig,
    threads: Mutex<Threads>,
}

#[derive(Default)]
struct Threads {
    work: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

/// State bags shared with the enactor callbacks and between threads.
struct Shared {
    campaign_state: Mutex<State>,
    workflows_state: Mutex<HashMap<u32, State>>,
    workflow_step_ids: Mutex<HashMap<u32, String>>,
    to_monitor: Mutex<Vec<Workflow>>,
    unavail_cores: Mutex<Vec<(u32, Range<u32>)>>,
    plan: Mutex<Option<Arc<PlanOutcome>>>,
    /// Refined walltime objective in minutes.
    objective: Mutex<f64>,
    /// Set when the campaign enters `Executing`; drives the campaign clock.
    clock_start: Mutex<Option<Instant>>,
    /// Workflows handed to the enactor and tracked for monitoring.
    submitted: AtomicUsize,
    terminate: AtomicBool,
}

impl Bookkeeper {
    /// Build a bookkeeper for `campaign`, resolving its target resource
    /// against the registry. The predictor and enactor are explicit
    /// collaborators owned by the caller.
    pub fn new(
        campaign: Campaign,
        enactor: Arc<dyn Enactor>,
        predictor: Arc<dyn Predictor>,
        session: &Session,
        config: BookkeeperConfig,
    ) -> Result<Self, CampaignError> {
        let resource = registered_resources()
            .remove(&campaign.resource)
            .ok_or_else(|| CampaignError::UnknownResource {
                name: campaign.resource.clone(),
            })?;
        let uid = session.uid("bookkeeper");
        let profiler = Profiler::new(session, &uid);
        let planner = HeftPlanner::new(
            session,
            Arc::clone(&resource),
            &campaign.policy,
            campaign.deadline_minutes,
        );
        debug!(%uid, deadline = campaign.deadline_minutes, "bookkeeper created");

        let shared = Arc::new(Shared {
            campaign_state: Mutex::new(State::New),
            workflows_state: Mutex::new(HashMap::new()),
            workflow_step_ids: Mutex::new(HashMap::new()),
            to_monitor: Mutex::new(Vec::new()),
            unavail_cores: Mutex::new(Vec::new()),
            plan: Mutex::new(None),
            objective: Mutex::new(campaign.deadline_minutes),
            clock_start: Mutex::new(None),
            submitted: AtomicUsize::new(0),
            terminate: AtomicBool::new(false),
        });

        let states = Arc::clone(&shared);
        enactor.register_state_cb(
            "state_update",
            Arc::new(move |update: &StateUpdate| {
                debug!(workflows = ?update.workflow_ids, state = %update.new_state, "state update");
                let mut workflows_state = states.workflows_state.lock();
                for id in &update.workflow_ids {
                    let state = workflows_state.entry(*id).or_insert(State::New);
                    if !state.is_final() {
                        *state = update.new_state;
                    }
                }
            }),
        );
        let step_ids = Arc::clone(&shared);
        enactor.register_state_cb(
            "step_id_update",
            Arc::new(move |update: &StateUpdate| {
                let mut table = step_ids.workflow_step_ids.lock();
                for (id, step_id) in update.workflow_ids.iter().zip(&update.step_ids) {
                    if let Some(step_id) = step_id {
                        table.insert(*id, step_id.clone());
                    }
                }
            }),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                campaign,
                resource,
                planner,
                enactor,
                predictor,
                shared,
                profiler,
                uid,
                config,
                threads: Mutex::new(Threads::default()),
            }),
        })
    }

    /// Run the campaign to completion and return its final state.
    ///
    /// Spawns the work and monitor threads, waits for every workflow to
    /// reach a final state, then terminates. A panic in either thread is
    /// logged and fails the campaign.
    pub fn run(&self) -> State {
        {
            let mut states = self.inner.shared.workflows_state.lock();
            for workflow in &self.inner.campaign.workflows {
                states.insert(workflow.id, State::New);
            }
        }
        self.inner.profiler.prof("bookkeeper_start");

        info!(uid = %self.inner.uid, "starting work thread");
        let work_inner = Arc::clone(&self.inner);
        let work = thread::Builder::new()
            .name(format!("{}-work", self.inner.uid))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| work_inner.work())).is_err() {
                    error!(uid = %work_inner.uid, "work thread panicked");
                    work_inner.fail_campaign();
                }
            })
            .expect("spawning the work thread");

        info!(uid = %self.inner.uid, "starting monitor thread");
        let monitor_inner = Arc::clone(&self.inner);
        let monitor = thread::Builder::new()
            .name(format!("{}-monitor", self.inner.uid))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| monitor_inner.monitor())).is_err() {
                    error!(uid = %monitor_inner.uid, "monitor thread panicked");
                    monitor_inner.fail_campaign();
                }
            })
            .expect("spawning the monitor thread");

        {
            let mut threads = self.inner.threads.lock();
            threads.work = Some(work);
            threads.monitor = Some(monitor);
        }
        self.inner.profiler.prof("bookkeeper_started");

        // Wait until the campaign resolves, folding workflow outcomes into
        // the campaign state.
        loop {
            if self.get_campaign_state().is_final() {
                break;
            }
            let mut all_final = true;
            let mut failed = false;
            {
                let states = self.inner.shared.workflows_state.lock();
                for workflow in &self.inner.campaign.workflows {
                    match states.get(&workflow.id) {
                        Some(State::Failed) => {
                            failed = true;
                            break;
                        }
                        Some(state) if state.is_final() => {}
                        _ => all_final = false,
                    }
                }
            }
            if failed {
                self.inner.fail_campaign();
                break;
            }
            // Done only once every workflow was handed over, finished, and
            // drained from the monitor list (so completions are recorded).
            let all_submitted = self.inner.shared.submitted.load(Ordering::SeqCst)
                == self.inner.campaign.workflows.len();
            if all_final && all_submitted && self.inner.shared.to_monitor.lock().is_empty() {
                let mut state = self.inner.shared.campaign_state.lock();
                if !state.is_final() {
                    *state = State::Done;
                }
                break;
            }
            thread::sleep(self.inner.config.tick);
        }

        self.inner.profiler.prof("bookkeeper_stopping");
        self.terminate();
        self.get_campaign_state()
    }

    /// Gracefully shut down the enactor and both bookkeeper threads.
    pub fn terminate(&self) {
        info!(uid = %self.inner.uid, "start terminating procedure");
        self.inner.profiler.prof("bookkeeper_terminating");
        self.inner.enactor.terminate();
        debug!(uid = %self.inner.uid, "enactor terminated, terminating threads");
        self.inner.shared.terminate.store(true, Ordering::SeqCst);

        let (work, monitor) = {
            let mut threads = self.inner.threads.lock();
            (threads.work.take(), threads.monitor.take())
        };
        if let Some(handle) = monitor {
            let _ = handle.join();
        }
        debug!(uid = %self.inner.uid, "monitor thread terminated");
        if let Some(handle) = work {
            let _ = handle.join();
        }
        debug!(uid = %self.inner.uid, "work thread terminated");
        self.inner.profiler.prof("bookkeeper_terminated");
    }

    pub fn get_campaign_state(&self) -> State {
        *self.inner.shared.campaign_state.lock()
    }

    /// Current state of every workflow in the campaign.
    pub fn get_workflows_state(&self) -> HashMap<u32, State> {
        let states = self.inner.shared.workflows_state.lock();
        self.inner
            .campaign
            .workflows
            .iter()
            .map(|workflow| {
                (
                    workflow.id,
                    states.get(&workflow.id).copied().unwrap_or(State::New),
                )
            })
            .collect()
    }

    /// The computed plan, once the work thread has produced one.
    pub fn get_plan(&self) -> Option<Arc<PlanOutcome>> {
        self.inner.shared.plan.lock().clone()
    }

    /// Estimated makespan of the campaign in minutes, once planned.
    pub fn get_makespan(&self) -> f64 {
        self.inner
            .shared
            .plan
            .lock()
            .as_ref()
            .map(|plan| plan.makespan())
            .unwrap_or(0.0)
    }
}

impl Inner {
    fn fail_campaign(&self) {
        let mut state = self.shared.campaign_state.lock();
        if !state.is_final() {
            *state = State::Failed;
        }
    }

    /// Per-workflow requirements: predictions when trusted, declared
    /// resources with a 10% runtime buffer otherwise.
    fn campaign_requirements(&self) -> HashMap<u32, Requirements> {
        let mut requirements = HashMap::new();
        for workflow in &self.campaign.workflows {
            let outcome = self.predictor.predict(&workflow.command(), &workflow.name);
            let requirement = match outcome.prediction {
                Some(prediction) if outcome.warnings.is_empty() => Requirements {
                    cpus: workflow.cores(),
                    memory_mb: prediction.memory_mb,
                    walltime_minutes: prediction.runtime_minutes * 1.1,
                },
                _ => {
                    if !outcome.warnings.is_empty() {
                        warn!(
                            uid = %self.uid,
                            workflow = workflow.id,
                            warnings = ?outcome.warnings,
                            "prediction untrusted, using declared resources"
                        );
                    }
                    Requirements {
                        cpus: workflow.cores(),
                        memory_mb: workflow.resources.memory_mb,
                        walltime_minutes: workflow.resources.runtime_minutes * 1.1,
                    }
                }
            };
            requirements.insert(workflow.id, requirement);
        }
        requirements
    }

    /// Minutes elapsed on the campaign clock, once executing.
    fn campaign_minutes(&self) -> Option<f64> {
        let start = (*self.shared.clock_start.lock())?;
        Some(start.elapsed().as_secs_f64() / self.config.minute.as_secs_f64())
    }

    /// Check the plan still meets the walltime objective. A workflow that
    /// is not final after its planned end pushes the effective makespan to
    /// the campaign clock.
    fn verify_objective(&self, plan: &PlanOutcome) -> bool {
        let mut makespan = plan.makespan();
        if let Some(now) = self.campaign_minutes() {
            let states = self.shared.workflows_state.lock();
            let late = plan.entries.iter().any(|entry| {
                let state = states.get(&entry.workflow.id).copied().unwrap_or(State::New);
                !state.is_final() && entry.end_minutes < now
            });
            if late {
                makespan = makespan.max(now);
            }
        }
        makespan <= *self.shared.objective.lock()
    }

    /// Work thread: plan, set up the pilot, then submit DAG-ready
    /// workflows once per tick until terminated.
    fn work(&self) {
        debug!(uid = %self.uid, "campaign state to PLANNING");
        self.profiler.prof("planning_start");
        {
            let mut state = self.shared.campaign_state.lock();
            if !state.is_final() {
                *state = State::Planning;
            }
        }

        let requirements = self.campaign_requirements();
        let plan = match self.planner.plan(
            &self.campaign.workflows,
            &requirements,
            self.campaign.execution_schema,
            self.campaign.requested_cores,
            &StartTimes::default(),
        ) {
            Ok(plan) => Arc::new(plan),
            Err(err) => {
                error!(uid = %self.uid, %err, "planning failed");
                self.fail_campaign();
                return;
            }
        };
        self.profiler.prof("planning_ended");
        info!(
            uid = %self.uid,
            qos = plan.qos.as_ref().map(|q| q.name.as_str()).unwrap_or("-"),
            cores = plan.cores_allocated,
            makespan = plan.makespan(),
            "calculated campaign plan"
        );
        *self.shared.plan.lock() = Some(Arc::clone(&plan));

        let makespan = plan.makespan();
        if makespan > self.campaign.deadline_minutes {
            error!(
                uid = %self.uid,
                makespan,
                deadline = self.campaign.deadline_minutes,
                "objective cannot be satisfied, ending execution"
            );
            self.fail_campaign();
            return;
        }

        // Refine the walltime budget: a fixed margin over the plan, capped
        // by the deadline.
        let objective = (makespan * 1.25).min(self.campaign.deadline_minutes).ceil();
        *self.shared.objective.lock() = objective;
        debug!(uid = %self.uid, makespan, objective, "refined walltime objective");

        if !plan.entries.is_empty() {
            if let Err(err) = self.enactor.setup(
                &self.resource,
                objective as u32,
                plan.cores_allocated,
                self.campaign.execution_schema,
                plan.qos.as_ref(),
            ) {
                error!(uid = %self.uid, %err, "enactor setup failed");
                self.fail_campaign();
                return;
            }
        }

        {
            let mut state = self.shared.campaign_state.lock();
            if !state.is_final() {
                *state = State::Executing;
            }
        }
        *self.shared.clock_start.lock() = Some(Instant::now());
        debug!(uid = %self.uid, "campaign state to EXECUTING");

        self.profiler.prof("work_start");
        while !self.shared.terminate.load(Ordering::SeqCst) {
            if !self.verify_objective(&plan) {
                error!(uid = %self.uid, "objective cannot be satisfied, ending execution");
                self.fail_campaign();
                break;
            }
            self.submit_ready(&plan);
            thread::sleep(self.config.tick);
        }
        debug!(uid = %self.uid, "work thread stopped");
    }

    /// Submit every workflow whose plan-graph predecessors are all done.
    fn submit_ready(&self, plan: &PlanOutcome) {
        self.profiler.prof("work_submit");
        let ready_ids: Vec<u32> = {
            let states = self.shared.workflows_state.lock();
            plan.graph
                .node_indices()
                .filter(|&node| {
                    let id = plan.graph[node];
                    if states.get(&id).copied() != Some(State::New) {
                        return false;
                    }
                    plan.graph
                        .neighbors_directed(node, Direction::Incoming)
                        .all(|pred| {
                            states.get(&plan.graph[pred]).copied() == Some(State::Done)
                        })
                })
                .map(|node| plan.graph[node])
                .collect()
        };
        if ready_ids.is_empty() {
            return;
        }

        let workflows: Vec<Workflow> = ready_ids
            .iter()
            .filter_map(|id| plan.entry(*id))
            .map(|entry| entry.workflow.clone())
            .collect();
        info!(
            uid = %self.uid,
            workflows = ?ready_ids,
            "submitting workflows"
        );
        self.profiler.prof("enactor_submit");
        self.enactor.enact(&workflows);
        self.profiler.prof("enactor_submitted");

        // Only track what the enactor actually accepted; anything left
        // `New` is retried on the next tick.
        let accepted = self.enactor.get_status(Some(&ready_ids));
        let mut to_monitor = self.shared.to_monitor.lock();
        let mut unavail = self.shared.unavail_cores.lock();
        for workflow in workflows {
            if !accepted.contains_key(&workflow.id) {
                continue;
            }
            if let Some(entry) = plan.entry(workflow.id) {
                unavail.push((workflow.id, entry.cores.clone()));
            }
            to_monitor.push(workflow);
            self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        }
        debug!(
            uid = %self.uid,
            monitored = to_monitor.len(),
            "workflows under monitoring"
        );
        self.profiler.prof("work_submitted");
    }

    /// Monitor thread: record finished workflows and release their cores.
    fn monitor(&self) {
        info!(uid = %self.uid, "monitor thread started");
        while !self.shared.terminate.load(Ordering::SeqCst) {
            let snapshot: Vec<Workflow> = self.shared.to_monitor.lock().clone();
            if !snapshot.is_empty() {
                self.profiler.prof("workflow_monitor");
                let mut finished: Vec<u32> = Vec::new();
                for workflow in &snapshot {
                    let state = self
                        .shared
                        .workflows_state
                        .lock()
                        .get(&workflow.id)
                        .copied()
                        .unwrap_or(State::New);
                    if state.is_final() {
                        self.record(workflow);
                        info!(uid = %self.uid, workflow = workflow.id, "workflow finished");
                        finished.push(workflow.id);
                    }
                }
                if !finished.is_empty() {
                    let mut to_monitor = self.shared.to_monitor.lock();
                    let mut unavail = self.shared.unavail_cores.lock();
                    to_monitor.retain(|workflow| !finished.contains(&workflow.id));
                    unavail.retain(|(id, _)| !finished.contains(id));
                    self.profiler.prof("workflow_finished");
                }
            }
            thread::sleep(self.config.tick);
        }
        debug!(uid = %self.uid, "monitor thread stopped");
    }

    /// Feed one finished workflow back to the recorder. Accounting
    /// metadata wins; the enactor's wall clock and the declared request
    /// are the fallbacks.
    fn record(&self, workflow: &Workflow) {
        let step_id = self
            .shared
            .workflow_step_ids
            .lock()
            .get(&workflow.id)
            .cloned();
        debug!(
            uid = %self.uid,
            workflow = workflow.id,
            step_id = step_id.as_deref().unwrap_or("-"),
            "recording workflow"
        );
        let metadata = step_id
            .as_deref()
            .and_then(|step_id| self.predictor.job_metadata(step_id));
        let execution = self.enactor.execution_record(workflow.id);

        let runtime_minutes = metadata
            .map(|meta| meta.elapsed_minutes)
            .or_else(|| execution.as_ref().and_then(|record| record.elapsed_minutes()))
            .unwrap_or(workflow.resources.runtime_minutes);
        let memory_mb = metadata
            .map(|meta| meta.max_rss_mb)
            .unwrap_or(workflow.resources.memory_mb);

        let record = JobRecord {
            job_name: workflow.name.clone(),
            cluster_step_id: step_id,
            categorical: workflow.categorical_fields(),
            numerical: workflow.numeric_fields(),
            memory_mb,
            runtime_minutes,
            command: workflow.command(),
        };
        if let Err(err) = self.predictor.raw_record(&record) {
            warn!(uid = %self.uid, workflow = workflow.id, %err, "recording failed");
        }
    }
}
