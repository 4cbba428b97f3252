//! Domain model for connections and their schedule descriptors.

use crate::secrets;
use crate::storage;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;

/// A connection's declared schedule. Stored as JSON with a `type` tag; only
/// cron is executable. Unrecognized kinds are carried as `Unsupported` so they
/// can be rejected at save time instead of blowing up at trigger time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    None,
    Cron { minutes: String, hours: String },
    Unsupported(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Unsupported schedule type '{0}'")]
    UnsupportedKind(String),

    #[error("Malformed schedule descriptor; {0}")]
    Malformed(String),
}

impl Schedule {
    /// Parses the stored descriptor. The empty string means no schedule.
    pub fn parse(raw: &str) -> Result<Schedule, ScheduleError> {
        if raw.is_empty() {
            return Ok(Schedule::None);
        }

        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ScheduleError::Malformed(format!("not valid json; {e}")))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ScheduleError::Malformed("missing 'type' field".into()))?;

        match kind {
            "cron" => {
                let field = |name: &str| -> Result<String, ScheduleError> {
                    match value.get(name) {
                        None | Some(Value::Null) => Ok("*".to_string()),
                        Some(Value::String(s)) if s.is_empty() => Ok("*".to_string()),
                        Some(Value::String(s)) => Ok(s.clone()),
                        Some(Value::Number(n)) => Ok(n.to_string()),
                        Some(other) => Err(ScheduleError::Malformed(format!(
                            "field '{name}' has unexpected value '{other}'"
                        ))),
                    }
                };

                Ok(Schedule::Cron {
                    minutes: field("minutes")?,
                    hours: field("hours")?,
                })
            }
            other => Ok(Schedule::Unsupported(other.to_string())),
        }
    }

    /// Rejects descriptors that parse but cannot be executed. Called when a
    /// connection is saved so misconfiguration surfaces immediately.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Unsupported(kind) => Err(ScheduleError::UnsupportedKind(kind.clone())),
            _ => Ok(()),
        }
    }

    /// Renders a seconds-first cron expression for the trigger loop.
    pub fn cron_expression(&self) -> Option<String> {
        match self {
            Schedule::Cron { minutes, hours } => Some(format!("0 {minutes} {hours} * * *")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub workspace_id: String,
    pub id: String,
    pub connector_slug: String,
    pub source_id: String,
    pub namespace: String,
    pub name: String,
    pub metadata: HashMap<String, Value>,

    /// Credentials stay encrypted until an adapter needs them.
    pub secrets_blob: Vec<u8>,

    pub schedule: Schedule,
    pub is_active: bool,
    pub validated: bool,
    pub created: u64,
    pub modified: u64,
}

impl Connection {
    pub fn secrets(&self, encryption_key: &[u8]) -> Result<HashMap<String, Value>> {
        secrets::unseal(encryption_key, &self.secrets_blob).with_context(|| {
            format!("could not decrypt secrets for connection '{}'", self.id)
        })
    }
}

impl TryFrom<storage::connections::Connection> for Connection {
    type Error = anyhow::Error;

    fn try_from(value: storage::connections::Connection) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        let metadata: HashMap<String, Value> =
            serde_json::from_str(&value.metadata).with_context(|| {
                format!(
                    "Could not parse field 'metadata' from storage value '{}'",
                    value.metadata
                )
            })?;

        let schedule = Schedule::parse(&value.schedule).with_context(|| {
            format!(
                "Could not parse field 'schedule' from storage value '{}'",
                value.schedule
            )
        })?;

        Ok(Connection {
            workspace_id: value.workspace_id,
            id: value.id,
            connector_slug: value.connector_slug,
            source_id: value.source_id,
            namespace: value.namespace,
            name: value.name,
            metadata,
            secrets_blob: value.secrets,
            schedule,
            is_active: value.is_active,
            validated: value.validated,
            created,
            modified,
        })
    }
}
