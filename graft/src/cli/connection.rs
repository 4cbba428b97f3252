use super::CliHarness;
use crate::service::State;
use crate::storage;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Debug, Args)]
pub struct ConnectionSubcommands {
    #[clap(subcommand)]
    pub command: ConnectionCommands,
}

#[derive(Debug, Subcommand)]
pub enum ConnectionCommands {
    /// List connections in a workspace.
    List {
        /// Workspace Identifier.
        #[clap(long, default_value = "default")]
        workspace_id: String,
    },
}

impl CliHarness {
    pub async fn connection_list(&self, workspace_id: &str) -> Result<()> {
        let state = State::new(self.config.clone()).await?;

        let mut conn = state.storage.read_conn().await?;
        let connections = storage::connections::list(&mut conn, workspace_id).await?;

        for connection in connections {
            let active = if connection.is_active { "active" } else { "inactive" };
            println!(
                "{}  {:12}  {}/{}  {}",
                connection.id, connection.connector_slug, connection.namespace, connection.name,
                active
            );
        }
        Ok(())
    }
}
