//! The event bus is a central handler for all things related to events within the
//! application. It allows a subscriber to listen to events and a sender to emit
//! events. Events are additionally persisted so operators can audit what the
//! service has done after the fact.

use crate::storage::{self, epoch_milli};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumDiscriminants, EnumString};
use tokio::sync::broadcast;
use tracing::{error, trace};
use uuid::Uuid;

#[derive(
    Debug, PartialEq, Eq, EnumString, EnumDiscriminants, Display, Serialize, Deserialize, Clone,
)]
#[strum_discriminants(derive(EnumString, Display, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    // Connector events
    RegisteredConnector {
        slug: String,
    },

    // Connection events
    ValidatedConnection {
        workspace_id: String,
        connection_id: String,
    },

    // Schedule events
    RegisteredSchedule {
        connection_id: String,
        expression: String,
    },
    RemovedSchedule {
        connection_id: String,
    },

    // Run events
    QueuedRun {
        connection_id: String,
        run_id: String,
        action: String,
    },
    StartedRun {
        connection_id: String,
        run_id: String,
    },
    CompletedRun {
        connection_id: String,
        run_id: String,
        status: crate::runs::Status,
    },

    // Graph events
    UpdatedGraph {
        workspace_id: String,
        namespace: String,
        nodes_changed: u64,
        edges_changed: u64,
    },
}

/// A single event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Unique identifier for event.
    pub id: String,

    /// The type of event it is.
    pub kind: Kind,

    /// Time event was performed in epoch milliseconds.
    pub emitted: u64,
}

impl TryFrom<storage::events::Event> for Event {
    type Error = anyhow::Error;

    fn try_from(value: storage::events::Event) -> Result<Self> {
        let emitted = value.emitted.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'emitted' from storage value '{}'",
                value.emitted
            )
        })?;

        let kind: Kind = serde_json::from_str(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' from storage value '{}'",
                value.kind
            )
        })?;

        Ok(Event {
            id: value.id,
            kind,
            emitted,
        })
    }
}

impl TryFrom<Event> for storage::events::Event {
    type Error = anyhow::Error;

    fn try_from(value: Event) -> Result<Self> {
        let kind = serde_json::to_string(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' to storage value '{:#?}'",
                value.kind
            )
        })?;

        Ok(Self {
            id: value.id,
            kind,
            emitted: value.emitted.to_string(),
        })
    }
}

impl Event {
    pub fn new(kind: Kind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            emitted: epoch_milli(),
        }
    }
}

async fn prune_events(storage: &storage::Db, retention: u64) -> Result<()> {
    let mut conn = storage.write_conn().await?;
    let cutoff = epoch_milli().saturating_sub(retention * 1000);
    let removed = storage::events::delete_before(&mut conn, cutoff).await?;
    if removed > 0 {
        trace!(removed, "pruned old events");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EventBus {
    storage: storage::Db,
    broadcast_channel: broadcast::Sender<Event>,
}

impl EventBus {
    /// `retention` and `prune_interval` are both in seconds.
    pub fn new(storage: storage::Db, retention: u64, prune_interval: u64) -> Self {
        let (tx, _) = broadcast::channel(100);

        let event_bus = Self {
            storage: storage.clone(),
            broadcast_channel: tx,
        };

        tokio::spawn(async move {
            loop {
                match prune_events(&storage, retention).await {
                    Ok(_) => (),
                    Err(e) => {
                        error!(error = %e, "encountered an error during attempt to prune old events")
                    }
                };

                tokio::time::sleep(tokio::time::Duration::from_secs(prune_interval)).await;
            }
        });

        event_bus
    }

    /// Returns a channel receiver end which can be used to listen to events.
    /// The receiver will drop automatically when out of scope.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_channel.subscribe()
    }

    /// Allows caller to emit a new event to the eventbus. Returns the resulting
    /// event once it has been successfully published.
    pub async fn try_publish(&self, kind: Kind) -> Result<Event> {
        let new_event = Event::new(kind.clone());

        let mut conn = self.storage.write_conn().await.with_context(|| {
            format!(
                "could not publish event for kind '{}'; Database error",
                new_event.kind,
            )
        })?;

        let new_event_storage: storage::events::Event =
            new_event.clone().try_into().with_context(|| {
                format!(
                    "could not publish event for kind '{}'; could not serialize event into storage",
                    &kind.to_string()
                )
            })?;

        storage::events::insert(&mut conn, &new_event_storage)
            .await
            .with_context(|| {
                format!(
                    "could not publish event for kind '{}'; Database insert error",
                    &kind.to_string()
                )
            })?;

        trace!(id = new_event.id, kind = %kind, emitted = new_event.emitted, "new event");

        // A send error only means there are no live subscribers, which is fine.
        let _ = self.broadcast_channel.send(new_event.clone());

        Ok(new_event)
    }

    /// Allows caller to emit a new event to the eventbus without waiting on the
    /// result. Failures are logged.
    pub fn publish(&self, kind: Kind) {
        let event_bus = self.clone();
        tokio::spawn(async move {
            if let Err(err) = event_bus.try_publish(kind.clone()).await {
                error!(error = %err, kind = %kind, "Could not publish event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn publish_and_subscribe() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);

        let mut receiver = bus.subscribe();

        let published = bus
            .try_publish(Kind::RegisteredConnector {
                slug: "postgres".into(),
            })
            .await
            .unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(published, received);

        // The event is also persisted.
        let mut conn = harness.read_conn().await.unwrap();
        let stored = storage::events::list(&mut conn, 0, 10, false)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);

        let recovered: Event = stored[0].clone().try_into().unwrap();
        assert_eq!(recovered, published);
    }

    #[test]
    fn kind_roundtrips_through_json() {
        let kind = Kind::CompletedRun {
            connection_id: "conn_1".into(),
            run_id: "run_1".into(),
            status: crate::runs::Status::Success,
        };

        let raw = serde_json::to_string(&kind).unwrap();
        let parsed: Kind = serde_json::from_str(&raw).unwrap();
        assert_eq!(kind, parsed);
    }
}
