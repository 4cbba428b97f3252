use super::CliHarness;
use crate::runs::{executor, Action};
use crate::service::State;
use crate::storage;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Args)]
pub struct RunSubcommands {
    #[clap(subcommand)]
    pub command: RunCommands,
}

#[derive(Debug, Subcommand)]
pub enum RunCommands {
    /// Trigger a run against a connection and process it to completion.
    Trigger {
        /// Connection Identifier.
        connection_id: String,

        /// One of: update, validate, tests, events, events_all.
        #[clap(long, default_value = "update")]
        action: String,

        /// Commit or PR reference to report test outcomes against.
        #[clap(long)]
        commit_ref: Option<String>,

        /// Attach a local file to the run (dbt manifests, flat files). Repeatable.
        #[clap(long, value_name = "PATH")]
        attach: Vec<PathBuf>,
    },

    /// Detail run by id.
    Get {
        /// Run Identifier.
        id: String,
    },

    /// List runs for a connection; oldest first.
    List {
        /// Connection Identifier.
        connection_id: String,
    },
}

fn print_run(run: &storage::runs::Run) {
    println!("run {}", run.id);
    println!("  connection: {}", run.connection_id);
    println!("  action:     {}", run.action);
    println!("  status:     {}", run.status);
    println!("  trigger:    {}", run.trigger);
    if let Some(commit_ref) = &run.commit_ref {
        println!("  commit_ref: {commit_ref}");
    }
    println!("  metadata:   {}", run.metadata);
}

impl CliHarness {
    pub async fn run_trigger(
        &self,
        connection_id: &str,
        action: &str,
        commit_ref: Option<String>,
        attach: Vec<PathBuf>,
    ) -> Result<()> {
        let action = Action::from_str(action).map_err(|_| {
            anyhow::anyhow!(
                "unrecognized action '{action}'; accepted values: tests, update, validate, \
                events, events_all"
            )
        })?;

        let mut files = Vec::with_capacity(attach.len());
        for path in attach {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("could not derive a file name from '{}'", path.display()))?
                .to_string();
            let content = std::fs::read(&path)
                .with_context(|| format!("could not read '{}'", path.display()))?;
            files.push((name, content));
        }

        let state = State::new(self.config.clone()).await?;
        let run = state
            .create_run(connection_id, action, commit_ref, files)
            .await?;

        executor::process_run(&state, &run.id).await?;

        let mut conn = state.storage.read_conn().await?;
        let finished = storage::runs::get(&mut conn, &run.id).await?;
        print_run(&finished);
        Ok(())
    }

    pub async fn run_get(&self, id: &str) -> Result<()> {
        let state = State::new(self.config.clone()).await?;

        let mut conn = state.storage.read_conn().await?;
        let run = storage::runs::get(&mut conn, id)
            .await
            .with_context(|| format!("could not load run '{id}'"))?;
        print_run(&run);
        Ok(())
    }

    pub async fn run_list(&self, connection_id: &str) -> Result<()> {
        let state = State::new(self.config.clone()).await?;

        let mut conn = state.storage.read_conn().await?;
        let runs = storage::runs::list(&mut conn, connection_id, 0, 100, false).await?;

        for run in runs {
            println!("{}  {:10}  {:10}  {}", run.id, run.action, run.status, run.trigger);
        }
        Ok(())
    }
}
