mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, deploy::DeployArgs, Overrides};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kship",
    about = "Build a container image, load it onto every cluster node and roll out the workload",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from kship.yaml or .git/)
    #[arg(long, global = true, env = "KSHIP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: tests, build, distribute, apply, roll out, record
    Deploy(DeployArgs),

    /// List cluster nodes with their address and whether they are this host
    Nodes,

    /// Load an image archive into the runtime of every node
    Distribute {
        /// Image archive produced by `docker save`
        #[arg(long, env = "KSHIP_ARCHIVE")]
        archive: PathBuf,
    },

    /// Apply the manifest set in dependency order
    Apply,

    /// Restart the workload and wait for the new generation
    Rollout {
        /// Seconds to wait for the rollout (default: rollout.timeout_secs)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Record the change cause on the workload
    Annotate {
        /// Message to record (default: latest commit subject)
        #[arg(long, env = "KSHIP_CHANGE_CAUSE")]
        change_cause: Option<String>,
    },

    /// Show or validate the effective configuration
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
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = cmd::load_config(&root, &cli.overrides).and_then(|config| match cli.command {
        Commands::Deploy(args) => cmd::deploy::run(config, args, cli.json),
        Commands::Nodes => cmd::nodes::run(&config, cli.json),
        Commands::Distribute { archive } => cmd::distribute::run(&config, archive, cli.json),
        Commands::Apply => cmd::apply::run(&config, cli.json),
        Commands::Rollout { timeout } => cmd::rollout::run(config, timeout, cli.json),
        Commands::Annotate { change_cause } => cmd::annotate::run(config, change_cause, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&config, subcommand, cli.json),
    });

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
