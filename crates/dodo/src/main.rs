mod commands;
mod registry;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dodo")]
#[command(about = "Run one-shot commands in containers, wherever the daemon lives", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage stages (container daemon environments)
    #[command(subcommand)]
    Stage(StageCommands),
    /// Stage plugins
    #[command(subcommand)]
    Plugin(PluginCommands),
    /// Show version information
    Version,
}

/// Stage selection shared by every stage subcommand
#[derive(clap::Args, Debug, Clone)]
struct StageArgs {
    /// Stage name
    name: String,
    /// Stage type (environment, generic, virtualbox, or a plugin)
    #[arg(short = 't', long = "type", env = "DODO_STAGE_TYPE", default_value = "virtualbox")]
    stage_type: String,
    /// Stage option as KEY=VALUE (repeatable)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,
}

#[derive(Subcommand)]
enum StageCommands {
    /// Create a stage and leave it running
    Create(StageArgs),
    /// Start a stopped stage
    Start(StageArgs),
    /// Stop a running stage
    Stop(StageArgs),
    /// Remove a stage and its storage
    Remove {
        #[command(flatten)]
        stage: StageArgs,
        /// Keep going when a teardown step fails
        #[arg(short, long)]
        force: bool,
        /// Also remove data volumes
        #[arg(long)]
        volumes: bool,
    },
    /// Show whether the stage exists and its daemon is reachable
    Status(StageArgs),
    /// Print docker CLI environment variables for the stage
    Env(StageArgs),
    /// Print SSH connection parameters of the stage
    Ssh(StageArgs),
}

#[derive(Subcommand)]
enum PluginCommands {
    /// Serve a built-in stage type over the plugin protocol
    Serve {
        /// Built-in stage type to serve
        stage_type: String,
    },
    /// Show which plugin executable a stage type resolves to
    Path {
        /// Stage type
        stage_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout is reserved for command output and the plugin protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Dropping the running command kills every child it spawned
    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            Err(anyhow::anyhow!("interrupted"))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Stage(cmd) => commands::stage::handle(cmd).await,
        Commands::Plugin(cmd) => commands::plugin::handle(cmd).await,
        Commands::Version => {
            println!("dodo {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
