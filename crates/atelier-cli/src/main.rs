//! Atelier CLI - generate and review workspace icons and covers

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{approval, budget, cache, generate, providers, run, status};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Budgeted, cached, reviewable image generation for workspace assets", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a single asset
    Generate {
        /// What the asset should depict
        prompt: String,

        /// Asset type (icon or cover)
        #[arg(long = "type", default_value = "icon")]
        asset_type: String,

        /// Asset name (derived from the prompt if omitted)
        #[arg(long)]
        name: Option<String>,

        /// Queue priority (critical, high, normal, low, background)
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Image model override
        #[arg(long)]
        model: Option<String>,

        /// Style guide name
        #[arg(long)]
        style: Option<String>,

        /// Submit for review but don't wait for the decision
        #[arg(long)]
        no_wait: bool,
    },

    /// Generate every asset listed in a run manifest
    Run {
        /// Path to the manifest TOML
        manifest: String,

        /// Style guide name (overrides the manifest's)
        #[arg(long)]
        style: Option<String>,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<String>,

        /// Submit for review but don't wait for decisions
        #[arg(long)]
        no_wait: bool,
    },

    /// Continue an interrupted run
    Resume {
        /// Run ID (see `atelier status`)
        run_id: String,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<String>,

        /// Submit for review but don't wait for decisions
        #[arg(long)]
        no_wait: bool,
    },

    /// Show runs and their progress
    Status {
        /// Show one run in detail
        run_id: Option<String>,
    },

    /// Show spend against the budget ceiling
    Budget,

    /// Review generated assets
    #[command(subcommand)]
    Approval(approval::ApprovalCommands),

    /// Inspect and maintain the asset cache
    #[command(subcommand)]
    Cache(cache::CacheCommands),

    /// List providers and check their configuration
    Providers,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("atelier=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "atelier=info".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Generate {
            prompt,
            asset_type,
            name,
            priority,
            model,
            style,
            no_wait,
        } => generate::run(generate::GenerateArgs {
            prompt,
            asset_type,
            name,
            priority,
            model,
            style,
            no_wait,
        }),
        Commands::Run {
            manifest,
            style,
            report,
            no_wait,
        } => run::run_manifest(&manifest, style.as_deref(), report.as_deref(), no_wait),
        Commands::Resume {
            run_id,
            report,
            no_wait,
        } => run::resume(&run_id, report.as_deref(), no_wait),
        Commands::Status { run_id } => status::run(run_id.as_deref()),
        Commands::Budget => budget::run(),
        Commands::Approval(cmd) => approval::run(cmd),
        Commands::Cache(cmd) => cache::run(cmd),
        Commands::Providers => providers::run(),
    }
}
