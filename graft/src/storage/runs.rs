use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Run {
    pub workspace_id: String,
    pub id: String,
    pub connection_id: String,
    pub source_id: String,
    pub action: String,
    pub status: String,
    pub trigger: String,
    pub metadata: String,
    pub commit_ref: Option<String>,
    pub created: String,
    pub started: String,
    pub ended: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub metadata: Option<String>,
    pub started: Option<String>,
    pub ended: Option<String>,
}

pub async fn insert(conn: &mut SqliteConnection, run: &Run) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO runs (workspace_id, id, connection_id, source_id, action, status, trigger, \
        metadata, commit_ref, created, started, ended) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&run.workspace_id)
    .bind(&run.id)
    .bind(&run.connection_id)
    .bind(&run.source_id)
    .bind(&run.action)
    .bind(&run.status)
    .bind(&run.trigger)
    .bind(&run.metadata)
    .bind(&run.commit_ref)
    .bind(&run.created)
    .bind(&run.started)
    .bind(&run.ended);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Run, StorageError> {
    let query = sqlx::query_as::<_, Run>(
        "SELECT workspace_id, id, connection_id, source_id, action, status, trigger, metadata, \
        commit_ref, created, started, ended FROM runs WHERE id = ?;",
    )
    .bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Sorted by creation time ascending by default.
pub async fn list(
    conn: &mut SqliteConnection,
    connection_id: &str,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Run>, StorageError> {
    let order_by = if reverse { "DESC" } else { "ASC" };

    let query_str = format!(
        "SELECT workspace_id, id, connection_id, source_id, action, status, trigger, metadata, \
        commit_ref, created, started, ended FROM runs WHERE connection_id = ? \
        ORDER BY created {order_by}, id {order_by} LIMIT ? OFFSET ?;"
    );

    let query = sqlx::query_as::<_, Run>(&query_str)
        .bind(connection_id)
        .bind(limit)
        .bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// The most recent run for a connection matching the given action and status.
pub async fn latest_with_status(
    conn: &mut SqliteConnection,
    connection_id: &str,
    action: &str,
    status: &str,
) -> Result<Run, StorageError> {
    let query = sqlx::query_as::<_, Run>(
        "SELECT workspace_id, id, connection_id, source_id, action, status, trigger, metadata, \
        commit_ref, created, started, ended FROM runs \
        WHERE connection_id = ? AND action = ? AND status = ? ORDER BY created DESC, id DESC;",
    )
    .bind(connection_id)
    .bind(action)
    .bind(status);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE runs SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
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

    if let Some(value) = &fields.started {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("started = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.ended {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("ended = ");
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
