//! socm: run workflow campaigns on batch-scheduled HPC clusters.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use socm::{Bookkeeper, BookkeeperConfig, DryrunEnactor, Enactor, NullPredictor, Session, State};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "socm", version, about = "Run workflow campaigns on HPC clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the campaign TOML configuration.
    #[arg(short, long)]
    toml: PathBuf,

    /// Verify the plan without submitting anything to the cluster.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a mapmaking campaign.
    Mapmaking(RunArgs),
    /// Run a null-test campaign.
    NullTests(RunArgs),
    /// Run a satellite-simulation campaign.
    SatSim(RunArgs),
}

/// Workflow-type keys and subcampaign layout one subcommand accepts.
struct Flavor {
    registered: &'static [&'static str],
    subcampaigns: &'static [(&'static str, &'static [&'static str])],
}

const MAPMAKING: Flavor = Flavor {
    registered: &["ml-mapmaking"],
    subcampaigns: &[],
};

const NULL_TESTS: Flavor = Flavor {
    registered: &[
        "ml-null-tests.mission-tests",
        "ml-null-tests.wafer-tests",
    ],
    subcampaigns: &[("ml-null-tests", &["mission-tests", "wafer-tests"])],
};

const SAT_SIM: Flavor = Flavor {
    registered: &["sat-sims"],
    subcampaigns: &[],
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (args, flavor) = match &cli.command {
        Command::Mapmaking(args) => (args, MAPMAKING),
        Command::NullTests(args) => (args, NULL_TESTS),
        Command::SatSim(args) => (args, SAT_SIM),
    };
    match run_campaign(args, &flavor) {
        Ok(State::Done) => ExitCode::SUCCESS,
        Ok(state) => {
            eprintln!("campaign ended in state {state}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_campaign(args: &RunArgs, flavor: &Flavor) -> Result<State> {
    let session = Session::create().context("creating the session directory")?;
    session.init_tracing();
    info!(session = session.id(), "session started");

    let document = socm::config::load_document(&args.toml)?;
    let campaign = socm::config::build_campaign(&document, flavor.registered, flavor.subcampaigns)?;
    if campaign.workflows.is_empty() {
        bail!(
            "no registered workflows found in {} (expected one of: {})",
            args.toml.display(),
            flavor.registered.join(", ")
        );
    }

    let enactor: Arc<dyn Enactor> = if args.dry_run {
        Arc::new(DryrunEnactor::new(&session))
    } else {
        // The production batch adapter is deployment-specific and wired in
        // by the site integration; this build only verifies plans.
        bail!("no batch client is configured in this build; pass --dry-run to verify the plan");
    };

    let bookkeeper = Bookkeeper::new(
        campaign,
        enactor,
        Arc::new(NullPredictor),
        &session,
        BookkeeperConfig::default(),
    )?;
    let state = bookkeeper.run();
    info!(%state, makespan = bookkeeper.get_makespan(), "campaign finished");

    if args.dry_run {
        if let Some(plan) = bookkeeper.get_plan() {
            let summary = serde_json::to_string_pretty(&plan.entries)
                .context("serializing the plan")?;
            std::fs::write(session.path().join("plan.json"), summary)
                .context("writing the plan summary")?;
            let rendered = socm::viz::render_png(&plan.graph, &session.path().join("plan.dot"))
                .context("rendering the plan graph")?;
            info!(path = %rendered.display(), "plan graph written");
        }
    }
    Ok(state)
}
