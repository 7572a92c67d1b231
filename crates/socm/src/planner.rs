//! HEFT-based campaign planning.
//!
//! The planner assigns every workflow a contiguous core range and a time
//! window on one cluster, longest workflows first, and derives the
//! dependency DAG implied by core sharing. In remote mode it also selects
//! a QoS policy and binary-searches for the smallest allocation that meets
//! the deadline.
//!
//! Reference: H. Topcuoglu, S. Hariri, Min-You Wu. Performance-effective
//! and low-complexity task scheduling for heterogeneous computing. IEEE
//! TPDS, March 2002.

use crate::models::{ExecutionSchema, Requirements, Workflow};
use crate::resource::{QosPolicy, Resource};
use crate::session::Session;
use crate::CampaignError;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

/// One workflow's committed placement.
///
/// Entries are immutable once emitted: `end = start + walltime` and the
/// core range covers exactly `ranks * threads` cores.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub workflow: Workflow,
    pub cores: Range<u32>,
    pub memory_mb: u64,
    pub start_minutes: f64,
    pub end_minutes: f64,
}

/// The dependency DAG over workflow ids derived from a plan. Node weights
/// are workflow ids.
pub type PlanGraph = DiGraph<u32, ()>;

/// The planner's product.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Plan entries sorted by workflow id for stable external ordering.
    pub entries: Vec<PlanEntry>,
    /// Submission-gating DAG: an edge `u -> v` means `v` must wait for `u`.
    pub graph: PlanGraph,
    /// QoS selected in remote mode.
    pub qos: Option<QosPolicy>,
    /// Size of the pilot allocation the plan assumes.
    pub cores_allocated: u32,
}

impl PlanOutcome {
    /// Latest end time over all entries, in minutes.
    pub fn makespan(&self) -> f64 {
        self.entries
            .iter()
            .map(|entry| entry.end_minutes)
            .fold(0.0, f64::max)
    }

    /// Look up the entry for a workflow id.
    pub fn entry(&self, workflow_id: u32) -> Option<&PlanEntry> {
        self.entries
            .iter()
            .find(|entry| entry.workflow.id == workflow_id)
    }
}

/// Warm-start availability for the core pool.
#[derive(Debug, Clone)]
pub enum StartTimes {
    /// Every core becomes free at the same time.
    Uniform(f64),
    /// Per-core free times; shorter vectors are padded with zeros.
    PerCore(Vec<f64>),
}

impl Default for StartTimes {
    fn default() -> Self {
        StartTimes::Uniform(0.0)
    }
}

impl StartTimes {
    fn materialize(&self, ncores: usize) -> Vec<f64> {
        match self {
            StartTimes::Uniform(t) => vec![*t; ncores],
            StartTimes::PerCore(times) => {
                let mut free = times.clone();
                free.resize(ncores, 0.0);
                free.truncate(ncores);
                free
            }
        }
    }
}

/// Campaign planner implementing HEFT-style list scheduling.
pub struct HeftPlanner {
    resource: Arc<Resource>,
    #[allow(dead_code)]
    policy: String,
    /// Campaign deadline in minutes.
    objective: f64,
    uid: String,
}

impl HeftPlanner {
    pub fn new(session: &Session, resource: Arc<Resource>, policy: &str, objective: f64) -> Self {
        let uid = session.uid("planner");
        Self {
            resource,
            policy: policy.to_string(),
            objective,
            uid,
        }
    }

    /// Compute a plan for the campaign.
    ///
    /// In `Batch` mode the caller fixes the allocation via
    /// `requested_cores` (defaulting to the whole cluster). In `Remote`
    /// mode the planner selects a QoS for the largest workflow and
    /// binary-searches the smallest allocation that meets the deadline.
    pub fn plan(
        &self,
        workflows: &[Workflow],
        requirements: &HashMap<u32, Requirements>,
        schema: ExecutionSchema,
        requested_cores: Option<u32>,
        start_times: &StartTimes,
    ) -> Result<PlanOutcome, CampaignError> {
        if workflows.is_empty() {
            return Ok(PlanOutcome {
                entries: Vec::new(),
                graph: PlanGraph::new(),
                qos: None,
                cores_allocated: 0,
            });
        }

        match schema {
            ExecutionSchema::Batch => {
                let ncores = requested_cores.unwrap_or_else(|| self.resource.total_cores());
                let placed = self.place(workflows, requirements, ncores, start_times)?;
                self.finish(workflows, placed, None, ncores)
            }
            ExecutionSchema::Remote => {
                let (qos, ncores, placed) =
                    self.size_allocation(workflows, requirements, start_times)?;
                self.finish(workflows, placed, Some(qos), ncores)
            }
        }
    }

    /// Remote mode: pick the QoS that admits the largest single workflow,
    /// then binary-search `[max_ncores, min(2 * max_ncores, qos.max_cores)]`
    /// for the smallest allocation whose makespan meets the deadline.
    fn size_allocation(
        &self,
        workflows: &[Workflow],
        requirements: &HashMap<u32, Requirements>,
        start_times: &StartTimes,
    ) -> Result<(QosPolicy, u32, Vec<PlanEntry>), CampaignError> {
        let max_ncores = workflows
            .iter()
            .map(|wf| self.requirement(requirements, wf).cpus)
            .max()
            .unwrap_or(1);

        let qos = self
            .resource
            .fits_in_qos(self.objective, max_ncores)
            .ok_or(CampaignError::NoMatchingQos {
                cores: max_ncores,
                walltime_minutes: self.objective,
            })?;
        debug!(uid = %self.uid, qos = %qos.name, cores = max_ncores, "selected QoS");

        let deadline = match qos.max_walltime {
            Some(max_walltime) => self.objective.min(f64::from(max_walltime)),
            None => self.objective,
        };
        let upper = match qos.max_cores {
            Some(max_cores) => (2 * max_ncores).min(max_cores),
            None => 2 * max_ncores,
        };

        let fits = |ncores: u32| -> Option<Vec<PlanEntry>> {
            let placed = self.place(workflows, requirements, ncores, start_times).ok()?;
            let makespan = placed.iter().map(|e| e.end_minutes).fold(0.0, f64::max);
            (makespan <= deadline).then_some(placed)
        };

        // The widest allocation must meet the deadline for any narrower one
        // to be worth probing.
        let widest = self.place(workflows, requirements, upper, start_times)?;
        let makespan = widest.iter().map(|e| e.end_minutes).fold(0.0, f64::max);
        if makespan > deadline {
            return Err(CampaignError::DeadlineUnreachable { makespan, deadline });
        }

        let mut best = widest;
        let mut lo = max_ncores;
        let mut hi = upper;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match fits(mid) {
                Some(placed) => {
                    best = placed;
                    hi = mid;
                }
                None => lo = mid + 1,
            }
        }
        info!(uid = %self.uid, qos = %qos.name, cores = hi, "sized pilot allocation");
        Ok((qos, hi, best))
    }

    /// Inner HEFT placement on `0..ncores`, longest walltime first.
    ///
    /// Returns entries in placement order; the caller derives the plan
    /// graph before re-sorting by workflow id.
    fn place(
        &self,
        workflows: &[Workflow],
        requirements: &HashMap<u32, Requirements>,
        ncores: u32,
        start_times: &StartTimes,
    ) -> Result<Vec<PlanEntry>, CampaignError> {
        let mut free = start_times.materialize(ncores as usize);
        let total_memory = self.pool_memory(ncores);

        // Longest job first, ties broken by input position.
        let mut order: Vec<usize> = (0..workflows.len()).collect();
        order.sort_by(|&a, &b| {
            let wa = self.requirement(requirements, &workflows[a]).walltime_minutes;
            let wb = self.requirement(requirements, &workflows[b]).walltime_minutes;
            wb.partial_cmp(&wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(&b))
        });

        let mut placed: Vec<PlanEntry> = Vec::with_capacity(workflows.len());
        for index in order {
            let workflow = &workflows[index];
            let req = self.requirement(requirements, workflow);
            let n = req.cpus.max(1) as usize;
            let mut selected: Option<(usize, f64, f64)> = None;

            let mut window = 0usize;
            while window + n <= free.len() {
                let start = free[window..window + n]
                    .iter()
                    .fold(0.0_f64, |acc, &t| acc.max(t));
                let end = start + req.walltime_minutes;
                if Self::free_memory_at(&placed, start, total_memory) >= req.memory_mb {
                    let better = match selected {
                        Some((_, _, best_end)) => end < best_end,
                        None => true,
                    };
                    if better {
                        selected = Some((window, start, end));
                    }
                } else {
                    debug!(
                        uid = %self.uid,
                        workflow = workflow.id,
                        window,
                        "window rejected: not enough memory"
                    );
                }
                window += n;
            }

            let Some((window, start, end)) = selected else {
                return Err(CampaignError::InfeasibleMemory {
                    workflow: workflow.name.clone(),
                    required_mb: req.memory_mb,
                });
            };
            debug!(
                uid = %self.uid,
                workflow = workflow.id,
                cores = ?(window..window + n),
                start,
                end,
                "placed workflow"
            );
            placed.push(PlanEntry {
                workflow: workflow.clone(),
                cores: window as u32..(window + n) as u32,
                memory_mb: req.memory_mb,
                start_minutes: start,
                end_minutes: end,
            });
            for slot in &mut free[window..window + n] {
                *slot = end;
            }
        }
        Ok(placed)
    }

    /// Memory available at instant `t`: the pool total minus everything
    /// held by entries whose `[start, end)` window covers `t`.
    fn free_memory_at(placed: &[PlanEntry], t: f64, total_memory: u64) -> u64 {
        let in_use: u64 = placed
            .iter()
            .filter(|entry| entry.start_minutes <= t && entry.end_minutes > t)
            .map(|entry| entry.memory_mb)
            .sum();
        total_memory.saturating_sub(in_use)
    }

    /// Memory of the node set backing an `ncores` allocation, whole nodes.
    fn pool_memory(&self, ncores: u32) -> u64 {
        let nodes_in_use = u64::from(ncores.div_ceil(self.resource.cores_per_node));
        nodes_in_use * self.resource.memory_per_node_mb
    }

    fn requirement(&self, requirements: &HashMap<u32, Requirements>, workflow: &Workflow) -> Requirements {
        requirements
            .get(&workflow.id)
            .copied()
            .unwrap_or(Requirements {
                cpus: workflow.cores(),
                memory_mb: workflow.resources.memory_mb,
                walltime_minutes: workflow.resources.runtime_minutes,
            })
    }

    /// Derive the plan graph, merge explicit dependencies, sort the plan by
    /// workflow id, and check the result is acyclic.
    fn finish(
        &self,
        workflows: &[Workflow],
        placed: Vec<PlanEntry>,
        qos: Option<QosPolicy>,
        cores_allocated: u32,
    ) -> Result<PlanOutcome, CampaignError> {
        let mut graph = self.core_sharing_graph(&placed, cores_allocated);
        self.merge_explicit_depends(workflows, &mut graph)?;
        if is_cyclic_directed(&graph) {
            return Err(CampaignError::CyclicDependency);
        }

        let mut entries = placed;
        entries.sort_by_key(|entry| entry.workflow.id);
        info!(
            uid = %self.uid,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "derived plan graph"
        );
        Ok(PlanOutcome {
            entries,
            graph,
            qos,
            cores_allocated,
        })
    }

    /// An edge `u -> v` exists iff `u` and `v` share a core and `u` ends
    /// no later than `v` starts. Entries must be in placement order.
    fn core_sharing_graph(&self, placed: &[PlanEntry], ncores: u32) -> PlanGraph {
        let mut graph = PlanGraph::new();
        let mut nodes: HashMap<u32, NodeIndex> = HashMap::new();
        let mut last_user: Vec<Option<u32>> = vec![None; ncores as usize];

        for entry in placed {
            let mut previous: Vec<u32> = Vec::new();
            for core in entry.cores.clone() {
                if let Some(user) = last_user[core as usize] {
                    if !previous.contains(&user) {
                        previous.push(user);
                    }
                }
                last_user[core as usize] = Some(entry.workflow.id);
            }

            let node = *nodes
                .entry(entry.workflow.id)
                .or_insert_with(|| graph.add_node(entry.workflow.id));
            for user in previous {
                let source = nodes[&user];
                graph.add_edge(source, node, ());
            }
        }
        graph
    }

    /// Fold `depends` declarations into the graph as extra edges.
    fn merge_explicit_depends(
        &self,
        workflows: &[Workflow],
        graph: &mut PlanGraph,
    ) -> Result<(), CampaignError> {
        let by_name: HashMap<&str, u32> = workflows
            .iter()
            .map(|wf| (wf.name.as_str(), wf.id))
            .collect();
        let mut nodes: HashMap<u32, NodeIndex> = graph
            .node_indices()
            .map(|index| (graph[index], index))
            .collect();

        for workflow in workflows {
            for dependency in &workflow.depends {
                let Some(&dep_id) = by_name.get(dependency.as_str()) else {
                    return Err(CampaignError::UnknownDependency {
                        workflow: workflow.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                let source = *nodes
                    .entry(dep_id)
                    .or_insert_with(|| graph.add_node(dep_id));
                let target = *nodes
                    .entry(workflow.id)
                    .or_insert_with(|| graph.add_node(workflow.id));
                if graph.find_edge(source, target).is_none() {
                    graph.add_edge(source, target, ());
                }
            }
        }
        Ok(())
    }
}
