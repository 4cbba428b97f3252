//! Drives a run from pending to a terminal state: resolves the adapter,
//! validates the action, dispatches to the integration, and records the
//! outcome. Configuration mistakes are raised to the caller; downstream
//! failures are captured into the run record.

use super::classify::{classify, ErrorKind};
use super::state_machine;
use super::{Action, Run, RunError, Status, Trigger};
use crate::connections::Connection;
use crate::connectors::integration::{BuildContext, Integration, RunFile};
use crate::connectors::{self, ConfigurationError};
use crate::events::Kind;
use crate::graph;
use crate::notify::StatusReport;
use crate::service::State;
use crate::storage;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, error, info};

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Executes the run to its terminal state.
///
/// Pre-dispatch configuration problems (unknown connector, invalid action,
/// already-processed run) surface as errors without touching the run's stored
/// state. Everything after the transition to running is captured into the run
/// record instead.
pub async fn process_run(state: &State, run_id: &str) -> Result<(), ProcessError> {
    let mut conn = state.storage.read_conn().await.map_err(anyhow::Error::from)?;

    let stored_run = storage::runs::get(&mut conn, run_id)
        .await
        .with_context(|| format!("could not load run '{run_id}'"))?;
    let mut run: Run = stored_run.try_into()?;

    if run.status != Status::Pending {
        return Err(RunError::AlreadyProcessed(run_id.to_string()).into());
    }

    let stored_connection = storage::connections::get(&mut conn, &run.connection_id)
        .await
        .with_context(|| format!("could not load connection '{}'", run.connection_id))?;
    let connection: Connection = stored_connection.try_into()?;
    drop(conn);

    // Both checks happen before any state transition so a misconfigured run
    // keeps its pre-call status.
    let adapter = connectors::resolve(&connection.connector_slug)?;
    let action = run.action()?;

    state_machine::start(&state.storage, &state.event_bus, &mut run).await?;

    let ctx = match build_context(state, &connection, &run.id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            let message = format!("{e:#}");
            state_machine::fail(
                &state.storage,
                &state.event_bus,
                &mut run,
                ErrorKind::Generic,
                &message,
            )
            .await?;
            return Ok(());
        }
    };

    let integration = match adapter.build(&ctx) {
        Ok(integration) => integration,
        Err(e) => {
            // Malformed configuration discovered mid-flight is a run failure,
            // not a process failure.
            let message = e.to_string();
            state_machine::fail(
                &state.storage,
                &state.event_bus,
                &mut run,
                ErrorKind::Generic,
                &message,
            )
            .await?;
            return Ok(());
        }
    };

    debug!(run_id = run.id, connector = connection.connector_slug, action = %action, "dispatching run");

    match execute_action(state, &connection, &run, action, integration.as_ref()).await {
        Ok(summary) => {
            state_machine::complete(&state.storage, &state.event_bus, &mut run, summary).await?;
        }
        Err(e) => {
            let message = format!("{e:#}");
            let kind = classify(&message);
            state_machine::fail(&state.storage, &state.event_bus, &mut run, kind, &message)
                .await?;
        }
    }

    Ok(())
}

/// Creates one new pending run for a schedule firing. The connector is
/// resolved first so a misconfigured connection fails loudly without leaving a
/// run behind.
pub async fn create_scheduled_run(
    state: &State,
    connection_id: &str,
) -> Result<String, ProcessError> {
    let mut conn = state.storage.write_conn().await.map_err(anyhow::Error::from)?;

    let stored = storage::connections::get(&mut conn, connection_id)
        .await
        .with_context(|| format!("could not load connection '{connection_id}'"))?;
    let connection: Connection = stored.try_into()?;

    connectors::resolve(&connection.connector_slug)?;

    let run = Run::new(
        &connection.workspace_id,
        &connection.id,
        &connection.source_id,
        Action::Update,
        Trigger::Scheduled,
        None,
    );

    storage::runs::insert(&mut conn, &run.clone().try_into()?)
        .await
        .context("could not create scheduled run")?;

    info!(run_id = run.id, connection_id, "created scheduled run");

    state.event_bus.publish(Kind::QueuedRun {
        connection_id: connection.id,
        run_id: run.id.clone(),
        action: Action::Update.to_string(),
    });

    Ok(run.id)
}

/// Cleanup hook for runs that outlived the task queue's time limit. A run
/// still in flight is resolved to error; one that already finished is left
/// alone.
pub async fn resolve_timeout(state: &State, run_id: &str) -> Result<()> {
    let mut conn = state.storage.read_conn().await?;
    let stored = storage::runs::get(&mut conn, run_id)
        .await
        .with_context(|| format!("could not load run '{run_id}'"))?;
    drop(conn);

    let mut run: Run = stored.try_into()?;
    if run.status.is_terminal() {
        return Ok(());
    }

    state_machine::fail(
        &state.storage,
        &state.event_bus,
        &mut run,
        ErrorKind::Generic,
        "Run exceeded the configured time limit",
    )
    .await
}

/// Assembles the adapter input: decrypted credentials plus any files attached
/// to the run.
async fn build_context(state: &State, connection: &Connection, run_id: &str) -> Result<BuildContext> {
    let secrets = connection.secrets(state.encryption_key())?;

    let prefix = format!("{run_id}/");
    let keys = state
        .file_store
        .list_keys(&prefix)
        .await
        .map_err(|e| anyhow::anyhow!("could not list run files; {e}"))?;

    let mut files = Vec::with_capacity(keys.len());
    for key in keys {
        let value = state
            .file_store
            .get(&key)
            .await
            .map_err(|e| anyhow::anyhow!("could not read run file '{key}'; {e}"))?;

        files.push(RunFile {
            name: key.trim_start_matches(&prefix).to_string(),
            content: Bytes::from(value.0),
        });
    }

    let mut conn = state.storage.read_conn().await?;
    let source = storage::sources::get(&mut conn, &connection.source_id)
        .await
        .with_context(|| format!("could not load source '{}'", connection.source_id))?;

    Ok(BuildContext {
        source_name: source.name,
        namespace: connection.namespace.clone(),
        metadata: connection.metadata.clone(),
        secrets,
        files,
    })
}

/// The moment new events become "new": the end of the last successful run of
/// the same action for this connection.
async fn last_event_horizon(
    state: &State,
    connection_id: &str,
    action: Action,
) -> Result<Option<DateTime<Utc>>> {
    let mut conn = state.storage.read_conn().await?;

    let previous = match storage::runs::latest_with_status(
        &mut conn,
        connection_id,
        &action.to_string(),
        &Status::Success.to_string(),
    )
    .await
    {
        Ok(run) => run,
        Err(storage::StorageError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let ended = previous
        .ended
        .parse::<i64>()
        .with_context(|| format!("could not parse 'ended' of run '{}'", previous.id))?;

    Ok(DateTime::from_timestamp_millis(ended))
}

/// Dispatches the validated action to the integration and renders its result
/// into the summary merged into run metadata on completion. Any error returned
/// here is a downstream failure and fails the run.
async fn execute_action(
    state: &State,
    connection: &Connection,
    run: &Run,
    action: Action,
    integration: &dyn Integration,
) -> Result<HashMap<String, Value>> {
    match action {
        Action::Update => {
            let snapshot = integration.extract().await?;
            let summary = graph::apply(
                &state.storage,
                &connection.workspace_id,
                &connection.source_id,
                &connection.namespace,
                &snapshot,
            )
            .await?;

            state.event_bus.publish(Kind::UpdatedGraph {
                workspace_id: connection.workspace_id.clone(),
                namespace: connection.namespace.clone(),
                nodes_changed: summary.nodes_created
                    + summary.nodes_updated
                    + summary.nodes_deactivated,
                edges_changed: summary.edges_created
                    + summary.edges_updated
                    + summary.edges_deactivated,
            });

            Ok(object_entries(summary.to_metadata()))
        }
        Action::Validate => {
            integration.check().await?;
            Ok(HashMap::new())
        }
        Action::Tests => {
            let report = integration.test().await?;
            let failed = report.assertions.iter().filter(|a| !a.passed).count();
            let conclusion = if report.passed() { "success" } else { "failure" };

            // Status reporting is fire-and-forget; a delivery failure never
            // flips the run's outcome.
            if let Some(reference) = &run.commit_ref {
                let summary_text = format!(
                    "{failed} of {} assertions failed",
                    report.assertions.len()
                );
                if let Err(e) = state
                    .notifier
                    .report(StatusReport {
                        reference: reference.clone(),
                        conclusion: conclusion.to_string(),
                        summary: summary_text,
                    })
                    .await
                {
                    error!(error = %e, reference, "could not deliver status report");
                }
            }

            Ok(HashMap::from([
                ("tests_total".to_string(), json!(report.assertions.len())),
                ("tests_failed".to_string(), json!(failed)),
                ("conclusion".to_string(), json!(conclusion)),
            ]))
        }
        Action::Events | Action::EventsAll => {
            let since = last_event_horizon(state, &connection.id, action).await?;
            let events = integration.events(since).await?;

            let annotations = if action == Action::EventsAll {
                graph::annotate_events_all(&state.storage, &connection.workspace_id, &events)
                    .await?
            } else {
                graph::annotate_events(&state.storage, &connection.workspace_id, &events).await?
            };

            Ok(HashMap::from([
                ("events".to_string(), json!(events.len())),
                ("annotations".to_string(), json!(annotations)),
            ]))
        }
    }
}

fn object_entries(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}
