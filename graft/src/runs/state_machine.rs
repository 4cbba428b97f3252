//! Lifecycle transitions for a single run: pending, running, then exactly one
//! terminal state. Every transition persists immediately and emits a bus event.

use super::classify::ErrorKind;
use super::{Action, Run, Status};
use crate::events::{EventBus, Kind};
use crate::storage::{self, epoch_milli};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Moves a pending run into running and stamps its start time.
pub async fn start(db: &storage::Db, bus: &EventBus, run: &mut Run) -> Result<()> {
    if run.status != Status::Pending {
        bail!(
            "cannot start run '{}' from status '{}'",
            run.id,
            run.status
        );
    }

    run.status = Status::Running;
    run.started = epoch_milli();

    let mut conn = db.write_conn().await?;
    storage::runs::update(
        &mut conn,
        &run.id,
        storage::runs::UpdatableFields {
            status: Some(run.status.to_string()),
            started: Some(run.started.to_string()),
            ..Default::default()
        },
    )
    .await
    .with_context(|| format!("could not persist start of run '{}'", run.id))?;

    bus.publish(Kind::StartedRun {
        connection_id: run.connection_id.clone(),
        run_id: run.id.clone(),
    });

    Ok(())
}

/// Finishes a running run as success, folding the result summary into its
/// metadata. A successful validate additionally marks the owning connection
/// validated.
pub async fn complete(
    db: &storage::Db,
    bus: &EventBus,
    run: &mut Run,
    summary: HashMap<String, Value>,
) -> Result<()> {
    if run.status != Status::Running {
        bail!(
            "cannot complete run '{}' from status '{}'",
            run.id,
            run.status
        );
    }

    run.status = Status::Success;
    run.ended = epoch_milli();
    run.metadata.extend(summary);

    let metadata = serde_json::to_string(&run.metadata)
        .context("could not serialize run metadata")?;

    let mut conn = db.write_conn().await?;
    storage::runs::update(
        &mut conn,
        &run.id,
        storage::runs::UpdatableFields {
            status: Some(run.status.to_string()),
            metadata: Some(metadata),
            ended: Some(run.ended.to_string()),
            ..Default::default()
        },
    )
    .await
    .with_context(|| format!("could not persist completion of run '{}'", run.id))?;

    if run.action() == Ok(Action::Validate) {
        storage::connections::update(
            &mut conn,
            &run.connection_id,
            storage::connections::UpdatableFields {
                validated: Some(true),
                modified: Some(epoch_milli().to_string()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| {
            format!(
                "could not mark connection '{}' validated",
                run.connection_id
            )
        })?;

        bus.publish(Kind::ValidatedConnection {
            workspace_id: run.workspace_id.clone(),
            connection_id: run.connection_id.clone(),
        });
    }

    info!(run_id = run.id, connection_id = run.connection_id, "run succeeded");

    bus.publish(Kind::CompletedRun {
        connection_id: run.connection_id.clone(),
        run_id: run.id.clone(),
        status: run.status,
    });

    Ok(())
}

/// Finishes a run as error, recording the classified kind and the raw
/// downstream message verbatim. Failing straight from pending is allowed;
/// configuration errors can occur before the run ever starts.
pub async fn fail(
    db: &storage::Db,
    bus: &EventBus,
    run: &mut Run,
    kind: ErrorKind,
    message: &str,
) -> Result<()> {
    if run.status.is_terminal() {
        bail!(
            "cannot fail run '{}'; already terminal with status '{}'",
            run.id,
            run.status
        );
    }

    run.status = Status::Error;
    run.ended = epoch_milli();
    run.metadata
        .insert("error".into(), Value::String(kind.to_string()));
    run.metadata
        .insert("message".into(), Value::String(message.to_string()));

    let metadata = serde_json::to_string(&run.metadata)
        .context("could not serialize run metadata")?;

    let mut conn = db.write_conn().await?;
    storage::runs::update(
        &mut conn,
        &run.id,
        storage::runs::UpdatableFields {
            status: Some(run.status.to_string()),
            metadata: Some(metadata),
            ended: Some(run.ended.to_string()),
            ..Default::default()
        },
    )
    .await
    .with_context(|| format!("could not persist failure of run '{}'", run.id))?;

    info!(
        run_id = run.id,
        connection_id = run.connection_id,
        error = %kind,
        "run failed"
    );

    bus.publish(Kind::CompletedRun {
        connection_id: run.connection_id.clone(),
        run_id: run.id.clone(),
        status: run.status,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::Trigger;
    use crate::storage::tests::TestHarness;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn seed(harness: &TestHarness, action: Action) -> Run {
        let mut conn = harness.write_conn().await.unwrap();
        let now = epoch_milli().to_string();

        storage::workspaces::insert(
            &mut conn,
            &storage::workspaces::Workspace {
                id: "ws_1".into(),
                name: "default".into(),
                created: now.clone(),
                modified: now.clone(),
            },
        )
        .await
        .unwrap();

        storage::sources::insert(
            &mut conn,
            &storage::sources::Source {
                workspace_id: "ws_1".into(),
                id: "src_1".into(),
                name: "warehouse".into(),
                created: now.clone(),
            },
        )
        .await
        .unwrap();

        storage::connectors::upsert(
            &mut conn,
            &storage::connectors::Connector {
                slug: "postgres".into(),
                name: "PostgreSQL".into(),
                is_active: true,
            },
        )
        .await
        .unwrap();

        storage::connections::insert(
            &mut conn,
            &storage::connections::Connection {
                workspace_id: "ws_1".into(),
                id: "conn_1".into(),
                connector_slug: "postgres".into(),
                source_id: "src_1".into(),
                namespace: "default".into(),
                name: "prod-db".into(),
                metadata: "{}".into(),
                secrets: vec![],
                schedule: "".into(),
                is_active: true,
                validated: false,
                created: now.clone(),
                modified: now.clone(),
            },
        )
        .await
        .unwrap();

        let run = Run::new("ws_1", "conn_1", "src_1", action, Trigger::Manual, None);
        storage::runs::insert(&mut conn, &run.clone().try_into().unwrap())
            .await
            .unwrap();

        run
    }

    #[tokio::test]
    async fn full_success_lifecycle() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);
        let mut run = seed(&harness, Action::Update).await;

        start(&harness.db, &bus, &mut run).await.unwrap();
        assert_eq!(run.status, Status::Running);
        assert!(run.started > 0);

        // A second start is an invalid transition.
        let mut copy = run.clone();
        assert!(start(&harness.db, &bus, &mut copy).await.is_err());

        complete(
            &harness.db,
            &bus,
            &mut run,
            HashMap::from([("nodes_created".to_string(), json!(3))]),
        )
        .await
        .unwrap();
        assert_eq!(run.status, Status::Success);
        assert!(run.ended > 0);

        let mut conn = harness.read_conn().await.unwrap();
        let stored = storage::runs::get(&mut conn, &run.id).await.unwrap();
        assert_eq!(stored.status, "success");
        let metadata: serde_json::Value = serde_json::from_str(&stored.metadata).unwrap();
        assert_eq!(metadata["nodes_created"], 3);
    }

    #[tokio::test]
    async fn fail_records_kind_and_raw_message() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);
        let mut run = seed(&harness, Action::Update).await;

        start(&harness.db, &bus, &mut run).await.unwrap();

        let raw = "FATAL:  password authentication failed for user \"analytics\"\n";
        fail(&harness.db, &bus, &mut run, ErrorKind::IncorrectPassword, raw)
            .await
            .unwrap();

        let mut conn = harness.read_conn().await.unwrap();
        let stored = storage::runs::get(&mut conn, &run.id).await.unwrap();
        assert_eq!(stored.status, "error");
        let metadata: serde_json::Value = serde_json::from_str(&stored.metadata).unwrap();
        assert_eq!(metadata["error"], "Incorrect password");
        assert_eq!(metadata["message"], raw);

        // Terminal states never regress.
        assert!(
            fail(&harness.db, &bus, &mut run, ErrorKind::Generic, "again")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fail_straight_from_pending() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);
        let mut run = seed(&harness, Action::Update).await;

        fail(
            &harness.db,
            &bus,
            &mut run,
            ErrorKind::NoConnection,
            "No connector found for: spreadsheet",
        )
        .await
        .unwrap();
        assert_eq!(run.status, Status::Error);
    }

    #[tokio::test]
    async fn validate_success_marks_connection_validated() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);
        let mut run = seed(&harness, Action::Validate).await;

        start(&harness.db, &bus, &mut run).await.unwrap();
        complete(&harness.db, &bus, &mut run, HashMap::new())
            .await
            .unwrap();

        let mut conn = harness.read_conn().await.unwrap();
        let connection = storage::connections::get(&mut conn, "conn_1").await.unwrap();
        assert!(connection.validated);
    }

    #[tokio::test]
    async fn update_success_leaves_validated_untouched() {
        let harness = TestHarness::new().await;
        let bus = EventBus::new(harness.db.clone(), 3600, 3600);
        let mut run = seed(&harness, Action::Update).await;

        start(&harness.db, &bus, &mut run).await.unwrap();
        complete(&harness.db, &bus, &mut run, HashMap::new())
            .await
            .unwrap();

        let mut conn = harness.read_conn().await.unwrap();
        let connection = storage::connections::get(&mut conn, "conn_1").await.unwrap();
        assert!(!connection.validated);
    }
}
