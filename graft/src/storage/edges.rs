use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Edge {
    pub workspace_id: String,
    pub id: String,
    pub source_id: String,
    pub namespace: String,
    pub name: String,
    pub source_node_id: String,
    pub destination_node_id: String,
    pub metadata: String,
    pub is_active: bool,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub source_id: Option<String>,
    pub metadata: Option<String>,
    pub is_active: Option<bool>,
    pub modified: Option<String>,
}

pub async fn insert(conn: &mut SqliteConnection, edge: &Edge) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO edges (workspace_id, id, source_id, namespace, name, source_node_id, \
        destination_node_id, metadata, is_active, created, modified) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&edge.workspace_id)
    .bind(&edge.id)
    .bind(&edge.source_id)
    .bind(&edge.namespace)
    .bind(&edge.name)
    .bind(&edge.source_node_id)
    .bind(&edge.destination_node_id)
    .bind(&edge.metadata)
    .bind(edge.is_active)
    .bind(&edge.created)
    .bind(&edge.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get_by_name(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    namespace: &str,
    name: &str,
) -> Result<Edge, StorageError> {
    let query = sqlx::query_as::<_, Edge>(
        "SELECT workspace_id, id, source_id, namespace, name, source_node_id, \
        destination_node_id, metadata, is_active, created, modified FROM edges \
        WHERE workspace_id = ? AND namespace = ? AND name = ?;",
    )
    .bind(workspace_id)
    .bind(namespace)
    .bind(name);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    namespace: &str,
) -> Result<Vec<Edge>, StorageError> {
    let query = sqlx::query_as::<_, Edge>(
        "SELECT workspace_id, id, source_id, namespace, name, source_node_id, \
        destination_node_id, metadata, is_active, created, modified FROM edges \
        WHERE workspace_id = ? AND namespace = ? ORDER BY name;",
    )
    .bind(workspace_id)
    .bind(namespace);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE edges SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.source_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("source_id = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.metadata {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("metadata = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.is_active {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("is_active = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.modified {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("modified = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE id = ");
    update_query.push_bind(id);
    update_query.push(";");

    let update_query = update_query.build();

    let sql = update_query.sql();

    update_query
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{epoch_milli, nodes, sources, tests::TestHarness, workspaces};

    async fn setup(harness: &TestHarness) -> Result<String, Box<dyn std::error::Error>> {
        let mut conn = harness.write_conn().await?;
        let now = epoch_milli().to_string();

        let workspace = workspaces::Workspace {
            id: "ws_1".into(),
            name: "default".into(),
            created: now.clone(),
            modified: now.clone(),
        };
        workspaces::insert(&mut conn, &workspace).await?;

        let source = sources::Source {
            workspace_id: "ws_1".into(),
            id: "src_1".into(),
            name: "warehouse".into(),
            created: now.clone(),
        };
        sources::insert(&mut conn, &source).await?;

        for node_id in ["node_1", "node_2"] {
            let node = nodes::Node {
                workspace_id: "ws_1".into(),
                id: node_id.into(),
                source_id: "src_1".into(),
                namespace: "default".into(),
                name: format!("public.{node_id}"),
                display_name: node_id.into(),
                metadata: "{}".into(),
                is_active: true,
                created: now.clone(),
                modified: now.clone(),
            };
            nodes::insert(&mut conn, &node).await?;
        }

        Ok(now)
    }

    #[tokio::test]
    async fn crud_edges() {
        let harness = TestHarness::new().await;
        let now = setup(&harness).await.unwrap();
        let mut conn = harness.write_conn().await.unwrap();

        let edge = Edge {
            workspace_id: "ws_1".into(),
            id: "edge_1".into(),
            source_id: "src_1".into(),
            namespace: "default".into(),
            name: "public.node_1 -> public.node_2".into(),
            source_node_id: "node_1".into(),
            destination_node_id: "node_2".into(),
            metadata: "{}".into(),
            is_active: true,
            created: now.clone(),
            modified: now.clone(),
        };
        insert(&mut conn, &edge).await.unwrap();

        let fetched = get_by_name(&mut conn, "ws_1", "default", &edge.name)
            .await
            .unwrap();
        assert_eq!(fetched.source_node_id, "node_1");
        assert_eq!(fetched.destination_node_id, "node_2");

        update(
            &mut conn,
            "edge_1",
            UpdatableFields {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let edges = list(&mut conn, "ws_1", "default").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(!edges[0].is_active);
    }

    #[tokio::test]
    async fn node_scoping() {
        let harness = TestHarness::new().await;
        setup(&harness).await.unwrap();
        let mut conn = harness.write_conn().await.unwrap();

        let scoped = nodes::list(&mut conn, "ws_1", "default").await.unwrap();
        assert_eq!(scoped.len(), 2);

        let all = nodes::list_workspace(&mut conn, "ws_1").await.unwrap();
        assert_eq!(all.len(), 2);

        let missing = nodes::list(&mut conn, "ws_1", "other").await.unwrap();
        assert!(missing.is_empty());
    }
}
