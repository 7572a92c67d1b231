//! Run a two-workflow campaign against the dry-run enactor.
//!
//! ```sh
//! cargo run --example simple_run
//! ```

use socm::{
    Bookkeeper, BookkeeperConfig, Campaign, DryrunEnactor, ExecutionSchema, NullPredictor,
    ResourceRequest, Session, Workflow,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::create()?;
    session.init_tracing();

    // Each workflow carries its payload verbatim; only the declared
    // resources matter to the planner.
    let workflows: Vec<Workflow> = (1..=2)
        .map(|id| Workflow {
            id,
            name: format!("test.{id}"),
            executable: "so-site-pipeline".to_string(),
            subcommand: Some("make-filterbin-map".to_string()),
            arguments: vec![format!("config{id}.yaml")],
            environment: BTreeMap::new(),
            resources: ResourceRequest {
                ranks: 4,
                threads: 2,
                memory_mb: 16_000,
                runtime_minutes: 30.0,
            },
            depends: vec![],
        })
        .collect();

    let campaign = Campaign {
        id: 1,
        workflows,
        deadline_minutes: 360.0,
        resource: "tiger3".to_string(),
        execution_schema: ExecutionSchema::Batch,
        requested_cores: Some(16),
        policy: "time".to_string(),
    };

    let bookkeeper = Bookkeeper::new(
        campaign,
        Arc::new(DryrunEnactor::new(&session)),
        Arc::new(NullPredictor),
        &session,
        BookkeeperConfig::default(),
    )?;

    let state = bookkeeper.run();
    println!("campaign finished in state {state}");
    println!("estimated makespan: {} min", bookkeeper.get_makespan());
    for (id, state) in bookkeeper.get_workflows_state() {
        println!("  workflow {id}: {state}");
    }
    Ok(())
}
