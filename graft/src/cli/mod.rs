mod connection;
mod run;
mod service;

use crate::conf;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "graft")]
#[clap(about = "Graft is a data lineage run orchestrator.")]
#[clap(
    long_about = "Graft keeps a graph of data assets up to date by running connectors against \
    warehouses, pipelines, and build tools. Connections describe where to pull from; runs pull, \
    diff, and commit the result. Schedules keep the whole thing turning without anyone watching."
)]
#[clap(version)]
struct Cli {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    config_path: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manages the long-running orchestrator process.
    Service(service::ServiceSubcommands),

    /// Trigger and inspect runs.
    Run(run::RunSubcommands),

    /// Inspect configured connections.
    Connection(connection::ConnectionSubcommands),
}

struct CliHarness {
    config: conf::Config,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse args, load configuration, and run the chosen command.
pub async fn init() -> Result<()> {
    let args = Cli::parse();

    let config = conf::Config::parse(&args.config_path).context("could not load configuration")?;

    init_logging(&config.general.log_level);

    let cli = CliHarness { config };

    match args.command {
        Commands::Service(service) => match service.command {
            service::ServiceCommands::Start => cli.service_start().await,
        },
        Commands::Run(run) => match run.command {
            run::RunCommands::Trigger {
                connection_id,
                action,
                commit_ref,
                attach,
            } => cli.run_trigger(&connection_id, &action, commit_ref, attach).await,
            run::RunCommands::Get { id } => cli.run_get(&id).await,
            run::RunCommands::List { connection_id } => cli.run_list(&connection_id).await,
        },
        Commands::Connection(connection) => match connection.command {
            connection::ConnectionCommands::List { workspace_id } => {
                cli.connection_list(&workspace_id).await
            }
        },
    }
}
