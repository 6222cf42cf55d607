//! Crucible CLI
//!
//! Thin command surface over `crucible_core`: experiment bookkeeping for a
//! single checkout, and the swarm runner for many hypotheses at once.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use crucible_core::metrics::MetricPhase;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(about = "Hypothesis-driven experiment orchestration", long_about = None)]
struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Create .crucible/ with a default config and database
    Init,
    /// Start a new experiment
    New {
        slug: String,
        #[arg(long)]
        hypothesis: String,
        #[arg(long)]
        sub_type: Option<String>,
        /// Branch name (default exp/<slug>)
        #[arg(long)]
        branch: Option<String>,
        /// Parent experiment slug
        #[arg(long)]
        parent: Option<String>,
        /// Record only; do not create the git branch
        #[arg(long)]
        no_branch: bool,
    },
    /// Run one lifecycle step for an experiment (latest by default)
    Next {
        #[arg(long)]
        slug: Option<String>,
    },
    /// Show experiments and their next legal statuses
    Status {
        #[arg(long)]
        slug: Option<String>,
        /// Print experiments as JSON
        #[arg(long)]
        json: bool,
    },
    /// Abandon an experiment
    Revert {
        slug: String,
        #[arg(long, default_value = "reverted manually")]
        reason: String,
    },
    /// Work sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Metric snapshots and the regression gate
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
    /// List recorded dead-ends
    DeadEnds {
        #[arg(long)]
        sub_type: Option<String>,
    },
    /// Run several hypotheses concurrently in isolated worktrees
    Swarm {
        /// One hypothesis per instance
        #[arg(required = true)]
        hypotheses: Vec<String>,
        #[arg(long)]
        sub_type: Option<String>,
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Leave worktrees on disk afterwards
        #[arg(long)]
        keep_worktrees: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    Start {
        intent: String,
    },
    End {
        #[arg(long)]
        accomplished: Option<String>,
        #[arg(long)]
        unfinished: Option<String>,
        #[arg(long)]
        fragility: Option<String>,
    },
    Show,
}

#[derive(Subcommand, Debug)]
enum MetricsAction {
    /// Run the metrics command and store a snapshot
    Capture {
        #[arg(long, value_parser = parse_phase)]
        phase: MetricPhase,
        #[arg(long)]
        slug: Option<String>,
    },
    /// Compare before/after snapshots; exits non-zero on gate violations
    Compare {
        #[arg(long)]
        slug: Option<String>,
    },
}

fn parse_phase(s: &str) -> Result<MetricPhase, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    match args.command {
        CliCommand::Init => commands::init().await,
        CliCommand::New {
            slug,
            hypothesis,
            sub_type,
            branch,
            parent,
            no_branch,
        } => {
            commands::new_experiment(commands::NewArgs {
                slug,
                hypothesis,
                sub_type,
                branch,
                parent,
                create_branch: !no_branch,
            })
            .await
        }
        CliCommand::Next { slug } => commands::next(slug.as_deref()).await,
        CliCommand::Status { slug, json } => commands::status(slug.as_deref(), json),
        CliCommand::Revert { slug, reason } => commands::revert(&slug, &reason).await,
        CliCommand::Session { action } => match action {
            SessionAction::Start { intent } => commands::session_start(&intent),
            SessionAction::End {
                accomplished,
                unfinished,
                fragility,
            } => commands::session_end(accomplished, unfinished, fragility),
            SessionAction::Show => commands::session_show(),
        },
        CliCommand::Metrics { action } => match action {
            MetricsAction::Capture { phase, slug } => {
                commands::metrics_capture(phase, slug.as_deref()).await
            }
            MetricsAction::Compare { slug } => commands::metrics_compare(slug.as_deref()).await,
        },
        CliCommand::DeadEnds { sub_type } => commands::dead_ends(sub_type.as_deref()),
        CliCommand::Swarm {
            hypotheses,
            sub_type,
            max_parallel,
            keep_worktrees,
        } => commands::swarm(hypotheses, sub_type, max_parallel, keep_worktrees).await,
    }
}
