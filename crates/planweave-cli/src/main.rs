//! PlanWeave CLI
//!
//! The `planweave` command drives the orchestrator against scenario files on
//! disk, using the reference steps and a filesystem run store.
//!
//! ## Commands
//!
//! - `init`: Write the reference scenario
//! - `validate`: Schema check plus contradiction report
//! - `impact`: Show what a decision change would rerun
//! - `build`: Phased full build
//! - `rerun`: Linear run, optionally limited to one changed decision
//! - `select`: Record a user's choice for a decision
//! - `resume`: Continue a failed run from its last checkpoint

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use planweave_core::{
    reference_registry, reference_scenario, telemetry, FaultInjection, Orchestrator,
    OrchestratorConfig, PipelineCatalog, RunReport,
};
use scenario_state::{DecisionKey, FsStore, RunId, ScenarioState};

#[derive(Parser)]
#[command(name = "planweave")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scenario workflow orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Orchestrator config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cluster tasks allowed to run at once within a phase
    #[arg(long, global = true, env = "PLANWEAVE_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the reference scenario
    Init {
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Schema check and contradiction report for a scenario file
    Validate {
        #[arg(short, long)]
        state: PathBuf,
    },

    /// Decisions and steps affected by a change to `decision`
    Impact { decision: String },

    /// Phased full build
    Build {
        #[arg(short, long)]
        state: PathBuf,

        /// Run store directory
        #[arg(long, env = "PLANWEAVE_STORE", default_value = ".planweave")]
        store: PathBuf,

        /// Fail when this step is about to run
        #[arg(long)]
        fail_at: Option<String>,
    },

    /// Linear run of the steps impacted by a decision (all steps if omitted)
    Rerun {
        #[arg(short, long)]
        state: PathBuf,

        #[arg(short, long)]
        decision: Option<String>,

        #[arg(long, env = "PLANWEAVE_STORE", default_value = ".planweave")]
        store: PathBuf,

        #[arg(long)]
        fail_at: Option<String>,
    },

    /// Record a user's choice for a decision
    Select {
        #[arg(short, long)]
        state: PathBuf,

        #[arg(short, long)]
        decision: String,

        #[arg(short, long)]
        option: String,
    },

    /// Resume a failed run from its last checkpoint
    Resume {
        #[arg(long)]
        run: String,

        #[arg(long, env = "PLANWEAVE_STORE", default_value = ".planweave")]
        store: PathBuf,

        /// Where to write the resulting state
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(cli.json, level);

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(max) = cli.max_concurrency {
        config = config.with_max_concurrency(max);
    }

    match cli.command {
        Commands::Init { out } => cmd_init(&out),
        Commands::Validate { state } => cmd_validate(&state),
        Commands::Impact { decision } => cmd_impact(&decision),
        Commands::Build {
            state,
            store,
            fail_at,
        } => {
            let orchestrator = orchestrator(&store, config)?;
            let scenario = read_state(&state)?;
            let report = orchestrator.build(scenario, fault(fail_at)).await?;
            finish_run(report, Some(&state))
        }
        Commands::Rerun {
            state,
            decision,
            store,
            fail_at,
        } => {
            let changed = decision.as_deref().map(parse_decision).transpose()?;
            let orchestrator = orchestrator(&store, config)?;
            let scenario = read_state(&state)?;
            let report = orchestrator.rerun(scenario, changed, fault(fail_at)).await?;
            finish_run(report, Some(&state))
        }
        Commands::Select {
            state,
            decision,
            option,
        } => cmd_select(&state, &decision, &option),
        Commands::Resume { run, store, out } => {
            let orchestrator = orchestrator(&store, config)?;
            let report = orchestrator
                .resume(&RunId::from(run.as_str()), FaultInjection::None)
                .await?;
            finish_run(report, out.as_deref())
        }
    }
}

fn orchestrator(store: &Path, config: OrchestratorConfig) -> Result<Orchestrator> {
    let fs = Arc::new(
        FsStore::open(store).with_context(|| format!("Failed to open store at {}", store.display()))?,
    );
    let catalog = PipelineCatalog::standard();
    let registry = reference_registry(&catalog);
    let orchestrator = Orchestrator::new(catalog, registry, fs.clone(), fs)?.with_config(config)?;
    Ok(orchestrator)
}

/// In-memory orchestrator for commands that never touch the run store.
fn offline() -> Result<Orchestrator> {
    let catalog = PipelineCatalog::standard();
    let registry = reference_registry(&catalog);
    let store = Arc::new(scenario_state::fakes::MemoryCheckpointStore::new());
    let runs = Arc::new(scenario_state::fakes::MemoryRunStore::default());
    Ok(Orchestrator::new(catalog, registry, store, runs)?)
}

fn fault(fail_at: Option<String>) -> FaultInjection {
    fail_at.map(FaultInjection::at_step).unwrap_or_default()
}

fn parse_decision(raw: &str) -> Result<DecisionKey> {
    raw.parse::<DecisionKey>()
        .with_context(|| format!("Unknown decision '{raw}'"))
}

fn read_state(path: &Path) -> Result<ScenarioState> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let state: ScenarioState = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse scenario from {}", path.display()))?;
    Ok(state)
}

fn write_state(path: &Path, state: &ScenarioState) -> Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(state)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "scenario written");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(out: &Path) -> Result<()> {
    if out.exists() {
        bail!("{} already exists", out.display());
    }
    let state = reference_scenario();
    write_state(out, &state)?;
    print_json(&serde_json::json!({
        "scenario_id": state.meta.id,
        "path": out.display().to_string(),
    }))
}

fn cmd_validate(path: &Path) -> Result<()> {
    let state = read_state(path)?;
    state.commit_check().context("Schema check failed")?;
    let report = offline()?.validate(&state);
    print_json(&report)?;
    if report.blocking {
        bail!("{} blocking contradiction(s)", report.contradictions.iter().filter(|c| c.blocking).count());
    }
    Ok(())
}

fn cmd_impact(decision: &str) -> Result<()> {
    let key = parse_decision(decision)?;
    print_json(&offline()?.impact(Some(key)))
}

fn cmd_select(path: &Path, decision: &str, option: &str) -> Result<()> {
    let key = parse_decision(decision)?;
    let state = read_state(path)?;
    let report = offline()?.select_option(&state, key, option)?;
    write_state(path, &report.state)?;
    print_json(&serde_json::json!({
        "decision": key,
        "option": option,
        "rerun_steps": report.impact.steps,
        "warnings": report.warnings,
    }))
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: &'a RunId,
    status: &'a scenario_state::RunStatus,
    checkpoint_index: usize,
    completed_steps: &'a [String],
    skipped_steps: &'a [String],
    outcome: &'a planweave_core::RunOutcome,
}

fn finish_run(report: RunReport, out: Option<&Path>) -> Result<()> {
    if let Some(path) = out {
        write_state(path, &report.state)?;
    }
    print_json(&RunSummary {
        run_id: &report.run.run_id,
        status: &report.run.status,
        checkpoint_index: report.run.checkpoint_index,
        completed_steps: &report.run.completed_steps,
        skipped_steps: &report.run.skipped_steps,
        outcome: &report.outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision_accepts_dashes() {
        assert_eq!(parse_decision("revenue-model").unwrap(), DecisionKey::RevenueModel);
        assert!(parse_decision("nope").is_err());
    }

    #[test]
    fn test_fault_from_flag() {
        assert!(matches!(fault(None), FaultInjection::None));
        assert!(fault(Some("pricing_analyst".into())).triggers("pricing_analyst", None));
    }

    #[test]
    fn test_cli_parses_rerun() {
        let cli = Cli::try_parse_from([
            "planweave", "rerun", "--state", "s.json", "--decision", "icp", "--store", "/tmp/x",
        ])
        .unwrap();
        match cli.command {
            Commands::Rerun { decision, store, .. } => {
                assert_eq!(decision.as_deref(), Some("icp"));
                assert_eq!(store, PathBuf::from("/tmp/x"));
            }
            _ => panic!("expected rerun"),
        }
    }
}
