//! Applies connector extraction results to the stored lineage graph. All writes
//! for a single run happen inside one transaction so a failure partway through
//! never leaves a half-committed graph.

use crate::connectors::integration::{NodeRef, SourceEvent, SourceGraph};
use crate::storage::{self, epoch_milli};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Counts of what an update run changed, recorded into the run's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub nodes_created: u64,
    pub nodes_updated: u64,
    pub nodes_deactivated: u64,
    pub edges_created: u64,
    pub edges_updated: u64,
    pub edges_deactivated: u64,
}

impl UpdateSummary {
    pub fn to_metadata(&self) -> Value {
        json!({
            "nodes_created": self.nodes_created,
            "nodes_updated": self.nodes_updated,
            "nodes_deactivated": self.nodes_deactivated,
            "edges_created": self.edges_created,
            "edges_updated": self.edges_updated,
            "edges_deactivated": self.edges_deactivated,
        })
    }
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nodes +{}/~{}/-{}; edges +{}/~{}/-{}",
            self.nodes_created,
            self.nodes_updated,
            self.nodes_deactivated,
            self.edges_created,
            self.edges_updated,
            self.edges_deactivated
        )
    }
}

/// Diffs an extracted snapshot against the stored graph for the given
/// (workspace, namespace) scope and commits the difference. Entities no longer
/// present in the snapshot are deactivated, never deleted.
pub async fn apply(
    db: &storage::Db,
    workspace_id: &str,
    source_id: &str,
    namespace: &str,
    snapshot: &SourceGraph,
) -> Result<UpdateSummary> {
    let mut summary = UpdateSummary::default();
    let now = epoch_milli().to_string();

    let mut tx = db.open_tx().await.context("could not open transaction")?;

    let existing_nodes = storage::nodes::list(tx.as_mut(), workspace_id, namespace)
        .await
        .context("could not list existing nodes")?;
    let existing_edges = storage::edges::list(tx.as_mut(), workspace_id, namespace)
        .await
        .context("could not list existing edges")?;

    // name -> id, covering both pre-existing and newly-inserted nodes so edges
    // can resolve their endpoints in one pass.
    let mut node_ids: HashMap<String, String> = existing_nodes
        .iter()
        .map(|n| (n.name.clone(), n.id.clone()))
        .collect();
    let existing_nodes: HashMap<String, storage::nodes::Node> = existing_nodes
        .into_iter()
        .map(|n| (n.name.clone(), n))
        .collect();
    let existing_edges: HashMap<String, storage::edges::Edge> = existing_edges
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect();

    for spec in &snapshot.nodes {
        let metadata = spec.metadata.to_string();

        match existing_nodes.get(&spec.name) {
            Some(current) => {
                let unchanged = current.is_active
                    && current.display_name == spec.display_name
                    && current.metadata == metadata;
                if unchanged {
                    continue;
                }

                storage::nodes::update(
                    tx.as_mut(),
                    &current.id,
                    storage::nodes::UpdatableFields {
                        source_id: Some(source_id.to_string()),
                        display_name: Some(spec.display_name.clone()),
                        metadata: Some(metadata),
                        is_active: Some(true),
                        modified: Some(now.clone()),
                    },
                )
                .await
                .with_context(|| format!("could not update node '{}'", spec.name))?;
                summary.nodes_updated += 1;
            }
            None => {
                let id = Uuid::now_v7().to_string();
                storage::nodes::insert(
                    tx.as_mut(),
                    &storage::nodes::Node {
                        workspace_id: workspace_id.to_string(),
                        id: id.clone(),
                        source_id: source_id.to_string(),
                        namespace: namespace.to_string(),
                        name: spec.name.clone(),
                        display_name: spec.display_name.clone(),
                        metadata,
                        is_active: true,
                        created: now.clone(),
                        modified: now.clone(),
                    },
                )
                .await
                .with_context(|| format!("could not insert node '{}'", spec.name))?;
                node_ids.insert(spec.name.clone(), id);
                summary.nodes_created += 1;
            }
        }
    }

    // Deactivate nodes that vanished from the source.
    for (name, node) in &existing_nodes {
        if !node.is_active || snapshot.nodes.iter().any(|n| &n.name == name) {
            continue;
        }

        storage::nodes::update(
            tx.as_mut(),
            &node.id,
            storage::nodes::UpdatableFields {
                is_active: Some(false),
                modified: Some(now.clone()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("could not deactivate node '{name}'"))?;
        summary.nodes_deactivated += 1;
    }

    for spec in &snapshot.edges {
        let metadata = spec.metadata.to_string();

        let Some(source_node_id) = node_ids.get(&spec.source.name) else {
            anyhow::bail!(
                "edge '{}' references unknown source node '{}'",
                spec.name,
                spec.source.name
            );
        };
        let Some(destination_node_id) = node_ids.get(&spec.destination.name) else {
            anyhow::bail!(
                "edge '{}' references unknown destination node '{}'",
                spec.name,
                spec.destination.name
            );
        };

        match existing_edges.get(&spec.name) {
            Some(current) => {
                let unchanged = current.is_active && current.metadata == metadata;
                if unchanged {
                    continue;
                }

                storage::edges::update(
                    tx.as_mut(),
                    &current.id,
                    storage::edges::UpdatableFields {
                        source_id: Some(source_id.to_string()),
                        metadata: Some(metadata),
                        is_active: Some(true),
                        modified: Some(now.clone()),
                    },
                )
                .await
                .with_context(|| format!("could not update edge '{}'", spec.name))?;
                summary.edges_updated += 1;
            }
            None => {
                storage::edges::insert(
                    tx.as_mut(),
                    &storage::edges::Edge {
                        workspace_id: workspace_id.to_string(),
                        id: Uuid::now_v7().to_string(),
                        source_id: source_id.to_string(),
                        namespace: namespace.to_string(),
                        name: spec.name.clone(),
                        source_node_id: source_node_id.clone(),
                        destination_node_id: destination_node_id.clone(),
                        metadata,
                        is_active: true,
                        created: now.clone(),
                        modified: now.clone(),
                    },
                )
                .await
                .with_context(|| format!("could not insert edge '{}'", spec.name))?;
                summary.edges_created += 1;
            }
        }
    }

    for (name, edge) in &existing_edges {
        if !edge.is_active || snapshot.edges.iter().any(|e| &e.name == name) {
            continue;
        }

        storage::edges::update(
            tx.as_mut(),
            &edge.id,
            storage::edges::UpdatableFields {
                is_active: Some(false),
                modified: Some(now.clone()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("could not deactivate edge '{name}'"))?;
        summary.edges_deactivated += 1;
    }

    tx.commit().await.context("could not commit graph update")?;

    Ok(summary)
}

fn event_entry(event: &SourceEvent) -> Value {
    json!({
        "reference": event.reference,
        "date": event.date.to_rfc3339(),
        "status": event.status,
        "metadata": event.metadata,
    })
}

fn append_event(node_metadata: &str, entry: &Value) -> Result<String> {
    let mut metadata: Value =
        serde_json::from_str(node_metadata).context("node metadata is not valid json")?;

    if !metadata.is_object() {
        metadata = json!({});
    }

    let events = metadata
        .as_object_mut()
        .unwrap()
        .entry("events")
        .or_insert_with(|| Value::Array(vec![]));

    if let Value::Array(list) = events {
        list.push(entry.clone());
    } else {
        *events = Value::Array(vec![entry.clone()]);
    }

    Ok(metadata.to_string())
}

/// Records connector events against graph nodes. With `fan_out_all` every node
/// in the workspace receives every event; otherwise only the nodes each event
/// references are annotated. Returns the number of annotations written.
pub async fn annotate_events(
    db: &storage::Db,
    workspace_id: &str,
    events: &[SourceEvent],
) -> Result<u64> {
    annotate(db, workspace_id, events, false).await
}

pub async fn annotate_events_all(
    db: &storage::Db,
    workspace_id: &str,
    events: &[SourceEvent],
) -> Result<u64> {
    annotate(db, workspace_id, events, true).await
}

async fn annotate(
    db: &storage::Db,
    workspace_id: &str,
    events: &[SourceEvent],
    fan_out_all: bool,
) -> Result<u64> {
    if events.is_empty() {
        return Ok(0);
    }

    let now = epoch_milli().to_string();
    let mut annotated = 0u64;

    let mut tx = db.open_tx().await.context("could not open transaction")?;

    if fan_out_all {
        let all_nodes = storage::nodes::list_workspace(tx.as_mut(), workspace_id)
            .await
            .context("could not list workspace nodes")?;

        for node in all_nodes {
            let mut metadata = node.metadata.clone();
            for event in events {
                metadata = append_event(&metadata, &event_entry(event))?;
            }

            storage::nodes::update(
                tx.as_mut(),
                &node.id,
                storage::nodes::UpdatableFields {
                    metadata: Some(metadata),
                    modified: Some(now.clone()),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("could not annotate node '{}'", node.name))?;
            annotated += events.len() as u64;
        }
    } else {
        for event in events {
            let entry = event_entry(event);

            for NodeRef { namespace, name } in &event.node_refs {
                let node = match storage::nodes::get_by_name(
                    tx.as_mut(),
                    workspace_id,
                    namespace,
                    name,
                )
                .await
                {
                    Ok(node) => node,
                    // Events can outlive the nodes they reference.
                    Err(crate::storage::StorageError::NotFound) => continue,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("could not look up node '{name}'"))
                    }
                };

                let metadata = append_event(&node.metadata, &entry)?;

                storage::nodes::update(
                    tx.as_mut(),
                    &node.id,
                    storage::nodes::UpdatableFields {
                        metadata: Some(metadata),
                        modified: Some(now.clone()),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("could not annotate node '{name}'"))?;
                annotated += 1;
            }
        }
    }

    tx.commit().await.context("could not commit annotations")?;

    Ok(annotated)
}
