//! Planner placement, QoS selection, and plan-graph properties.

mod common;

use common::{session, testbed, workflow};
use socm::planner::StartTimes;
use socm::resource::{QosPolicy, Resource};
use socm::{CampaignError, ExecutionSchema, HeftPlanner, PlanOutcome, Requirements, Workflow};
use std::collections::HashMap;
use std::sync::Arc;

fn requirements(workflows: &[Workflow]) -> HashMap<u32, Requirements> {
    workflows
        .iter()
        .map(|wf| {
            (
                wf.id,
                Requirements {
                    cpus: wf.cores(),
                    memory_mb: wf.resources.memory_mb,
                    walltime_minutes: wf.resources.runtime_minutes,
                },
            )
        })
        .collect()
}

fn plan_batch(resource: Resource, workflows: &[Workflow], cores: u32) -> PlanOutcome {
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(resource), "time", 100_000.0);
    planner
        .plan(
            workflows,
            &requirements(workflows),
            ExecutionSchema::Batch,
            Some(cores),
            &StartTimes::default(),
        )
        .unwrap()
}

#[test]
fn two_independent_workflows_share_the_window() {
    // Two one-core workflows on two cores: the longer one is placed first
    // on the lower window, the shorter one fits alongside it.
    let workflows = vec![
        workflow(1, "W1", 1, 100, 10.0),
        workflow(2, "W2", 1, 100, 20.0),
    ];
    let plan = plan_batch(testbed(1, 4, 1_000), &workflows, 2);

    let w1 = plan.entry(1).unwrap();
    let w2 = plan.entry(2).unwrap();
    assert_eq!(w2.cores, 0..1);
    assert_eq!((w2.start_minutes, w2.end_minutes), (0.0, 20.0));
    assert_eq!(w1.cores, 1..2);
    assert_eq!((w1.start_minutes, w1.end_minutes), (0.0, 10.0));
    assert_eq!(plan.makespan(), 20.0);
    assert_eq!(plan.graph.node_count(), 2);
    assert_eq!(plan.graph.edge_count(), 0);
}

#[test]
fn core_sharing_serializes_and_orders_the_graph() {
    // Both workflows need the full two-core allocation; the second runs
    // after the first and the graph records the ordering.
    let workflows = vec![
        workflow(1, "W1", 2, 100, 30.0),
        workflow(2, "W2", 2, 100, 10.0),
    ];
    let plan = plan_batch(testbed(1, 4, 1_000), &workflows, 2);

    let w1 = plan.entry(1).unwrap();
    let w2 = plan.entry(2).unwrap();
    assert_eq!((w1.start_minutes, w1.end_minutes), (0.0, 30.0));
    assert_eq!((w2.start_minutes, w2.end_minutes), (30.0, 40.0));
    assert_eq!(plan.graph.edge_count(), 1);
    let edge = plan.graph.edge_indices().next().unwrap();
    let (source, target) = plan.graph.edge_endpoints(edge).unwrap();
    assert_eq!(plan.graph[source], 1);
    assert_eq!(plan.graph[target], 2);
}

#[test]
fn memory_pressure_forces_serialization() {
    // Four cores could hold both workflows side by side, but 2 x 800 MB
    // does not fit in a 1000 MB node: the second workflow starts when the
    // first has released its memory.
    let workflows = vec![
        workflow(1, "W1", 2, 800, 10.0),
        workflow(2, "W2", 2, 800, 10.0),
    ];
    let plan = plan_batch(testbed(1, 4, 1_000), &workflows, 4);

    let w1 = plan.entry(1).unwrap();
    let w2 = plan.entry(2).unwrap();
    assert_eq!((w1.start_minutes, w1.end_minutes), (0.0, 10.0));
    assert_eq!(w2.start_minutes, 10.0);
}

#[test]
fn remote_mode_selects_qos_and_minimizes_cores() {
    // QoS A is too short for the campaign; B admits it. The binary search
    // settles on exactly the largest workflow's width.
    let resource = Resource::new(
        "testbed",
        2,
        112,
        1_000_000,
        vec![
            QosPolicy::new("A", Some(30), None, Some(1_000)),
            QosPolicy::new("B", Some(120), None, Some(1_000)),
        ],
    );
    let workflows = vec![workflow(1, "W1", 100, 1_000, 50.0)];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(resource), "time", 60.0);
    let plan = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Remote,
            None,
            &StartTimes::default(),
        )
        .unwrap();

    assert_eq!(plan.qos.as_ref().unwrap().name, "B");
    assert_eq!(plan.cores_allocated, 100);
    assert!(plan.makespan() <= 60.0);
    let entry = plan.entry(1).unwrap();
    assert_eq!(entry.cores, 0..100);
}

#[test]
fn oversized_workflow_matches_no_qos() {
    let resource = Resource::new(
        "testbed",
        20,
        112,
        1_000_000,
        vec![
            QosPolicy::new("A", Some(60), None, Some(500)),
            QosPolicy::new("B", Some(1_440), None, Some(1_000)),
        ],
    );
    let workflows = vec![workflow(1, "W1", 2_000, 1_000, 10.0)];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(resource), "time", 1_000.0);
    let err = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Remote,
            None,
            &StartTimes::default(),
        )
        .unwrap_err();
    assert!(matches!(err, CampaignError::NoMatchingQos { cores: 2_000, .. }));
}

#[test]
fn deadline_short_of_the_longest_workflow_is_unreachable() {
    let resource = Resource::new(
        "testbed",
        2,
        112,
        1_000_000,
        vec![QosPolicy::new("main", Some(10_000), None, Some(1_000))],
    );
    let workflows = vec![workflow(1, "W1", 10, 1_000, 50.0)];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(resource), "time", 40.0);
    let err = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Remote,
            None,
            &StartTimes::default(),
        )
        .unwrap_err();
    match err {
        CampaignError::DeadlineUnreachable { makespan, deadline } => {
            assert_eq!(makespan, 50.0);
            assert_eq!(deadline, 40.0);
        }
        other => panic!("expected DeadlineUnreachable, got {other}"),
    }
}

#[test]
fn workflow_too_big_for_memory_is_infeasible() {
    let workflows = vec![workflow(1, "W1", 2, 2_000, 10.0)];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(testbed(1, 4, 1_000)), "time", 100_000.0);
    let err = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Batch,
            Some(4),
            &StartTimes::default(),
        )
        .unwrap_err();
    assert!(matches!(err, CampaignError::InfeasibleMemory { .. }));
}

#[test]
fn identical_workflows_resolve_by_id() {
    // The sort is stable: the lower-id workflow is placed first and takes
    // the lower-indexed window.
    let workflows = vec![
        workflow(1, "W1", 1, 100, 10.0),
        workflow(2, "W2", 1, 100, 10.0),
    ];
    let plan = plan_batch(testbed(1, 4, 1_000), &workflows, 2);
    assert_eq!(plan.entry(1).unwrap().cores, 0..1);
    assert_eq!(plan.entry(2).unwrap().cores, 1..2);
}

#[test]
fn empty_campaign_yields_an_empty_plan() {
    let plan = plan_batch(testbed(1, 4, 1_000), &[], 4);
    assert!(plan.entries.is_empty());
    assert_eq!(plan.graph.node_count(), 0);
    assert_eq!(plan.cores_allocated, 0);
}

#[test]
fn warm_start_delays_placement() {
    let workflows = vec![workflow(1, "W1", 1, 100, 10.0)];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(testbed(1, 4, 1_000)), "time", 100_000.0);
    let plan = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Batch,
            Some(2),
            &StartTimes::Uniform(5.0),
        )
        .unwrap();
    let entry = plan.entry(1).unwrap();
    assert_eq!((entry.start_minutes, entry.end_minutes), (5.0, 15.0));
}

#[test]
fn explicit_depends_gate_the_graph() {
    let mut workflows = vec![
        workflow(1, "X", 1, 100, 10.0),
        workflow(2, "Y", 1, 100, 10.0),
    ];
    workflows[1].depends = vec!["X".to_string()];
    let plan = plan_batch(testbed(1, 4, 1_000), &workflows, 4);

    // No core is shared, so the only edge is the declared dependency.
    assert_eq!(plan.graph.edge_count(), 1);
    let edge = plan.graph.edge_indices().next().unwrap();
    let (source, target) = plan.graph.edge_endpoints(edge).unwrap();
    assert_eq!(plan.graph[source], 1);
    assert_eq!(plan.graph[target], 2);
}

#[test]
fn unknown_dependency_is_rejected() {
    let mut workflows = vec![workflow(1, "X", 1, 100, 10.0)];
    workflows[0].depends = vec!["missing".to_string()];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(testbed(1, 4, 1_000)), "time", 100_000.0);
    let err = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Batch,
            Some(4),
            &StartTimes::default(),
        )
        .unwrap_err();
    assert!(matches!(err, CampaignError::UnknownDependency { .. }));
}

#[test]
fn dependency_cycles_are_rejected() {
    let mut workflows = vec![
        workflow(1, "A", 1, 100, 10.0),
        workflow(2, "B", 1, 100, 10.0),
    ];
    workflows[0].depends = vec!["B".to_string()];
    workflows[1].depends = vec!["A".to_string()];
    let (_dir, session) = session();
    let planner = HeftPlanner::new(&session, Arc::new(testbed(1, 4, 1_000)), "time", 100_000.0);
    let err = planner
        .plan(
            &workflows,
            &requirements(&workflows),
            ExecutionSchema::Batch,
            Some(4),
            &StartTimes::default(),
        )
        .unwrap_err();
    assert!(matches!(err, CampaignError::CyclicDependency));
}

/// The plan invariants on a campaign shaped like a real mapmaking batch.
#[test]
fn plan_invariants_hold_on_a_mixed_campaign() {
    let specs: [(u32, u32, u64, f64); 8] = [
        (1, 64, 2_000, 45.0),
        (2, 16, 15_000, 25.0),
        (3, 1, 2_000, 560.0),
        (4, 8, 32_000, 140.0),
        (5, 8, 1_000, 145.0),
        (6, 112, 20_000, 10.0),
        (7, 56, 6_000, 20.0),
        (8, 32, 1_000, 30.0),
    ];
    let workflows: Vec<Workflow> = specs
        .iter()
        .map(|&(id, cpus, mem, walltime)| workflow(id, &format!("W{id}"), cpus, mem, walltime))
        .collect();
    let resource = testbed(2, 112, 64 * 1_024);
    let plan = plan_batch(resource, &workflows, 224);

    assert_eq!(plan.entries.len(), 8);
    // External ordering is by workflow id.
    let ids: Vec<u32> = plan.entries.iter().map(|e| e.workflow.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // Exclusivity: overlapping time windows never share a core.
    for a in &plan.entries {
        for b in &plan.entries {
            if a.workflow.id == b.workflow.id {
                continue;
            }
            let overlap_in_time = a.start_minutes < b.end_minutes && b.start_minutes < a.end_minutes;
            let overlap_in_cores = a.cores.start < b.cores.end && b.cores.start < a.cores.end;
            assert!(
                !(overlap_in_time && overlap_in_cores),
                "entries {} and {} overlap",
                a.workflow.id,
                b.workflow.id
            );
        }
    }

    // Memory: at every start instant, live memory fits the node pool.
    let pool = 2 * 64 * 1_024_u64;
    for probe in &plan.entries {
        let t = probe.start_minutes;
        let live: u64 = plan
            .entries
            .iter()
            .filter(|e| e.start_minutes <= t && e.end_minutes > t)
            .map(|e| e.memory_mb)
            .sum();
        assert!(live <= pool, "memory over budget at t={t}");
    }

    // Every window matches its workflow's width, and the graph is a DAG.
    for entry in &plan.entries {
        assert_eq!(entry.cores.len() as u32, entry.workflow.cores());
        assert_eq!(
            entry.end_minutes - entry.start_minutes,
            entry.workflow.resources.runtime_minutes
        );
    }
    assert!(!petgraph::algo::is_cyclic_directed(&plan.graph));
    assert!(plan.makespan() >= 560.0);
}
