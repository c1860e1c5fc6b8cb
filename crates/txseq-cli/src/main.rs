mod cmd;
mod output;
mod plan;
mod settings;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use cmd::run::RunExit;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "txseq",
    about = "Run ordered actions inside a single store transaction",
    version,
    propagate_version = true
)]
struct Cli {
    /// Sequencer config file (default: ./txseq.yaml if present)
    #[arg(long, global = true, env = "TXSEQ_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan against a seeded in-memory store
    Run {
        /// Plan file (YAML)
        plan: PathBuf,
    },

    /// Parse and validate a plan without running it
    Check {
        /// Plan file (YAML)
        plan: PathBuf,
    },

    /// Show or validate the sequencer configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run { plan } => cmd::run::run(&plan, config, cli.json),
        Commands::Check { plan } => cmd::check::run(&plan, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<RunExit>().map_or(1, RunExit::exit_code);
        std::process::exit(code);
    }
}
