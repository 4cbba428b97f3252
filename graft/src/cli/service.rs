use super::CliHarness;
use crate::service::Service;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Debug, Args)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Start the orchestrator.
    #[clap(
        long_about = "Brings up storage, the file store, the event bus, and the scheduling \
    worker pool, seeds the connector catalog, re-registers every active schedule, then blocks \
    until SIGINT."
    )]
    Start,
}

impl CliHarness {
    pub async fn service_start(&self) -> Result<()> {
        let service = Service::new(self.config.clone()).await?;
        service.start().await
    }
}
