use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Node {
    pub workspace_id: String,
    pub id: String,
    pub source_id: String,
    pub namespace: String,
    pub name: String,
    pub display_name: String,
    pub metadata: String,
    pub is_active: bool,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub source_id: Option<String>,
    pub display_name: Option<String>,
    pub metadata: Option<String>,
    pub is_active: Option<bool>,
    pub modified: Option<String>,
}

pub async fn insert(conn: &mut SqliteConnection, node: &Node) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO nodes (workspace_id, id, source_id, namespace, name, display_name, metadata, \
        is_active, created, modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&node.workspace_id)
    .bind(&node.id)
    .bind(&node.source_id)
    .bind(&node.namespace)
    .bind(&node.name)
    .bind(&node.display_name)
    .bind(&node.metadata)
    .bind(node.is_active)
    .bind(&node.created)
    .bind(&node.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Node, StorageError> {
    let query = sqlx::query_as::<_, Node>(
        "SELECT workspace_id, id, source_id, namespace, name, display_name, metadata, is_active, \
        created, modified FROM nodes WHERE id = ?;",
    )
    .bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get_by_name(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    namespace: &str,
    name: &str,
) -> Result<Node, StorageError> {
    let query = sqlx::query_as::<_, Node>(
        "SELECT workspace_id, id, source_id, namespace, name, display_name, metadata, is_active, \
        created, modified FROM nodes WHERE workspace_id = ? AND namespace = ? AND name = ?;",
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

/// All nodes within a (workspace, namespace) scope, active or not.
pub async fn list(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    namespace: &str,
) -> Result<Vec<Node>, StorageError> {
    let query = sqlx::query_as::<_, Node>(
        "SELECT workspace_id, id, source_id, namespace, name, display_name, metadata, is_active, \
        created, modified FROM nodes WHERE workspace_id = ? AND namespace = ? ORDER BY name;",
    )
    .bind(workspace_id)
    .bind(namespace);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Every node in the workspace regardless of namespace; used for events_all fan-out.
pub async fn list_workspace(
    conn: &mut SqliteConnection,
    workspace_id: &str,
) -> Result<Vec<Node>, StorageError> {
    let query = sqlx::query_as::<_, Node>(
        "SELECT workspace_id, id, source_id, namespace, name, display_name, metadata, is_active, \
        created, modified FROM nodes WHERE workspace_id = ? ORDER BY namespace, name;",
    )
    .bind(workspace_id);

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
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE nodes SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.source_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("source_id = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.display_name {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("display_name = ");
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
