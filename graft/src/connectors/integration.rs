//! The uniform contract every connector satisfies. Adapters turn the stored
//! configuration of a connection into an [`Integration`] instance; the executor
//! only ever talks to connectors through this interface.

use super::ConfigurationError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

/// Reference to a graph node by its natural key within a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub namespace: String,
    pub name: String,
    pub display_name: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSpec {
    pub namespace: String,
    pub name: String,
    pub source: NodeRef,
    pub destination: NodeRef,
    pub metadata: Value,
}

/// The full set of nodes and edges a connector currently sees in its source.
/// Extraction is snapshot-based; the executor diffs this against the stored
/// graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceGraph {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

/// An external occurrence reported by a connector (a pipeline sync, a job run)
/// that should be recorded against the nodes it touched.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub reference: String,
    pub date: DateTime<Utc>,
    pub status: String,
    pub metadata: Value,
    pub node_refs: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAssertion {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    pub assertions: Vec<TestAssertion>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.assertions.iter().all(|a| a.passed)
    }
}

/// A file attached to a run, kept as raw bytes so connectors can consume it
/// without touching the filesystem.
#[derive(Debug, Clone)]
pub struct RunFile {
    pub name: String,
    pub content: Bytes,
}

/// Everything an adapter gets to work with when constructing an integration:
/// the connection's stored configuration plus any files attached to the run.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub source_name: String,
    pub namespace: String,
    pub metadata: HashMap<String, Value>,
    pub secrets: HashMap<String, Value>,
    pub files: Vec<RunFile>,
}

impl BuildContext {
    pub fn file(&self, name: &str) -> Option<&RunFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

#[async_trait]
pub trait Integration: Debug + Send + Sync {
    /// Pull the source's current nodes and edges.
    async fn extract(&self) -> Result<SourceGraph>;

    /// Connectivity/credential check only; must not mutate anything.
    async fn check(&self) -> Result<()>;

    /// Run the connector's assertions against its source.
    async fn test(&self) -> Result<TestReport> {
        bail!("connector does not support the tests action")
    }

    /// Yield external events since the given instant, or all known events when
    /// absent.
    async fn events(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<SourceEvent>> {
        bail!("connector does not support the events action")
    }
}

/// Fetch an optional string field. An empty string is treated identically to an
/// absent key so it never overrides the default.
pub fn opt_string(map: &HashMap<String, Value>, key: &str, default: &str) -> String {
    match get_string(map, key) {
        Some(value) => value,
        None => default.to_string(),
    }
}

/// Like [`opt_string`] but the field has no sensible default.
pub fn require_string(
    map: &HashMap<String, Value>,
    key: &str,
) -> Result<String, ConfigurationError> {
    get_string(map, key).ok_or_else(|| ConfigurationError::MissingField(key.to_string()))
}

/// Fetch an optional numeric field. Accepts both JSON numbers and numeric
/// strings; a value that fails to parse is a configuration error rather than a
/// silent fallback to the default.
pub fn opt_number(
    map: &HashMap<String, Value>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigurationError> {
    let value = match map.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(value) => value,
    };

    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ConfigurationError::InvalidField {
                field: key.to_string(),
                reason: format!("'{n}' is not a non-negative integer"),
            }),
        Value::String(s) if s.is_empty() => Ok(default),
        Value::String(s) => s.parse::<u64>().map_err(|_| ConfigurationError::InvalidField {
            field: key.to_string(),
            reason: format!("'{s}' is not a non-negative integer"),
        }),
        other => Err(ConfigurationError::InvalidField {
            field: key.to_string(),
            reason: format!("expected a number, got '{other}'"),
        }),
    }
}

fn get_string(map: &HashMap<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
