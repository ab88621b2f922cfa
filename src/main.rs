//! Anamnesis - Evidence-Based Learning Validation Pipeline
//!
//! CLI entry point relaying the pipeline's invocation triggers: ingest a
//! test report, process ready workflows, sweep expired ones, and inspect
//! workflow status.

use anamnesis::store::libsql::LibsqlDocumentStore;
use anamnesis::{
    AnamnesisError, GitInspector, IngestOutcome, LearningPipeline, PipelineConfig, Result,
    WorkflowId,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "anamnesis")]
#[command(about = "Evidence-based learning validation pipeline", long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to .anamnesis/config.toml)
    #[arg(long, global = true, env = "ANAMNESIS_CONFIG")]
    config: Option<PathBuf>,

    /// Git repository root for diff inspection
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a test report and open or advance a workflow
    Ingest {
        /// Path to the JUnit-style XML report
        report: PathBuf,

        /// Commit the report was produced against
        #[arg(long)]
        commit: Option<String>,

        /// Attach to this workflow explicitly instead of routing by commit
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Correlate, score and promote all ready workflows
    Process,

    /// Expire idle workflows and clean up terminal ones
    Sweep,

    /// Show workflow state(s)
    Status {
        /// Workflow ID; all workflows when omitted
        workflow: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;

    let store = Arc::new(LibsqlDocumentStore::new_local(&config.database_path).await?);
    let inspector = Arc::new(GitInspector::new(&cli.repo));
    let pipeline = LearningPipeline::new(config, store, inspector)?;

    match cli.command {
        Commands::Ingest {
            report,
            commit,
            workflow,
        } => {
            let bytes = std::fs::read(&report)?;
            let workflow_id = workflow.as_deref().map(parse_workflow_id).transpose()?;
            match pipeline.ingest(&bytes, commit, workflow_id)? {
                IngestOutcome::Opened(workflow) => {
                    println!(
                        "opened workflow {} (state: {})",
                        workflow.workflow_id, workflow.state
                    );
                }
                IngestOutcome::Attached { workflow_id, state } => {
                    println!("attached to workflow {} (state: {})", workflow_id, state);
                }
            }
        }
        Commands::Process => {
            let summary = pipeline.process_ready().await?;
            info!(
                promoted = summary.promoted.len(),
                rejected = summary.rejected.len(),
                reconciled = summary.reconciled.len(),
                failures = summary.failures.len(),
                "Process run complete"
            );
            for id in &summary.promoted {
                println!("promoted {}", id);
            }
            for id in &summary.rejected {
                println!("rejected {}", id);
            }
            for id in &summary.reconciled {
                println!("reconciled {}", id);
            }
            for (id, error) in &summary.failures {
                eprintln!("failed {}: {}", id, error);
            }
            if !summary.failures.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Sweep => {
            let expired = pipeline.sweep(Utc::now())?;
            println!("expired {} workflow(s)", expired.len());
            for id in expired {
                println!("expired {}", id);
            }
        }
        Commands::Status { workflow } => match workflow {
            Some(id) => {
                let workflow = pipeline.tracker().get(parse_workflow_id(&id)?)?;
                println!("{}", serde_json::to_string_pretty(&workflow)?);
            }
            None => {
                for workflow in pipeline.tracker().list()? {
                    println!(
                        "{}  {}  before={} after={}",
                        workflow.workflow_id,
                        workflow.state,
                        workflow.before_report_ref,
                        workflow
                            .after_report_ref
                            .as_deref()
                            .unwrap_or("-")
                    );
                }
            }
        },
    }

    Ok(())
}

fn parse_workflow_id(s: &str) -> Result<WorkflowId> {
    WorkflowId::from_string(s).map_err(AnamnesisError::from)
}
