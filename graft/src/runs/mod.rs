pub mod classify;
pub mod executor;
pub mod state_machine;

use crate::storage::{self, epoch_milli};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created but not yet picked up by a worker.
    #[default]
    Pending,

    /// Currently executing.
    Running,

    // Terminal states
    Success,
    Error,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Error)
    }
}

#[derive(
    Debug, Clone, Copy, Display, EnumString, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Extract the source graph and commit the diff.
    Update,

    /// Connectivity/credential check; marks the connection validated.
    Validate,

    /// Run the connector's assertions and report the outcome.
    Tests,

    /// Record connector events against referenced nodes.
    Events,

    /// Record connector events against every node in the workspace.
    EventsAll,
}

#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Scheduled,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RunError {
    #[error(
        "Incorrect run action {0} found, accepted values: tests, update, validate, events, events_all"
    )]
    InvalidAction(String),

    #[error("run '{0}' has already been picked up for processing")]
    AlreadyProcessed(String),
}

/// A single execution attempt against a connection. Runs are append-only
/// history; a retry is always a new run.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub workspace_id: String,
    pub id: String,
    pub connection_id: String,
    pub source_id: String,

    /// Kept as the raw stored string so an unrecognized action can be reported
    /// without corrupting the record. Parse with [`Run::action`].
    pub action_raw: String,

    pub status: Status,
    pub trigger: Trigger,
    pub metadata: HashMap<String, Value>,

    /// External commit/PR reference for test-triggered runs.
    pub commit_ref: Option<String>,

    pub created: u64,
    pub started: u64,
    pub ended: u64,
}

impl Run {
    pub fn new(
        workspace_id: &str,
        connection_id: &str,
        source_id: &str,
        action: Action,
        trigger: Trigger,
        commit_ref: Option<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            id: Uuid::now_v7().to_string(),
            connection_id: connection_id.to_string(),
            source_id: source_id.to_string(),
            action_raw: action.to_string(),
            status: Status::Pending,
            trigger,
            metadata: HashMap::new(),
            commit_ref,
            created: epoch_milli(),
            started: 0,
            ended: 0,
        }
    }

    /// Validates the stored action against the supported set.
    pub fn action(&self) -> Result<Action, RunError> {
        Action::from_str(&self.action_raw)
            .map_err(|_| RunError::InvalidAction(self.action_raw.clone()))
    }
}

impl TryFrom<storage::runs::Run> for Run {
    type Error = anyhow::Error;

    fn try_from(value: storage::runs::Run) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let started = value.started.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'started' from storage value '{}'",
                value.started
            )
        })?;

        let ended = value.ended.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'ended' from storage value '{}'",
                value.ended
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let trigger = Trigger::from_str(&value.trigger).with_context(|| {
            format!(
                "Could not parse field 'trigger' from storage value '{}'",
                value.trigger
            )
        })?;

        let metadata: HashMap<String, Value> =
            serde_json::from_str(&value.metadata).with_context(|| {
                format!(
                    "Could not parse field 'metadata' from storage value '{}'",
                    value.metadata
                )
            })?;

        Ok(Run {
            workspace_id: value.workspace_id,
            id: value.id,
            connection_id: value.connection_id,
            source_id: value.source_id,
            action_raw: value.action,
            status,
            trigger,
            metadata,
            commit_ref: value.commit_ref,
            created,
            started,
            ended,
        })
    }
}

impl TryFrom<Run> for storage::runs::Run {
    type Error = anyhow::Error;

    fn try_from(value: Run) -> Result<Self> {
        let metadata = serde_json::to_string(&value.metadata)
            .context("Could not serialize field 'metadata' to storage value")?;

        Ok(Self {
            workspace_id: value.workspace_id,
            id: value.id,
            connection_id: value.connection_id,
            source_id: value.source_id,
            action: value.action_raw,
            status: value.status.to_string(),
            trigger: value.trigger.to_string(),
            metadata,
            commit_ref: value.commit_ref,
            created: value.created.to_string(),
            started: value.started.to_string(),
            ended: value.ended.to_string(),
        })
    }
}
