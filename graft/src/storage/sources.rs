use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Source {
    pub workspace_id: String,
    pub id: String,
    pub name: String,
    pub created: String,
}

pub async fn insert(conn: &mut SqliteConnection, source: &Source) -> Result<(), StorageError> {
    let query =
        sqlx::query("INSERT INTO sources (workspace_id, id, name, created) VALUES (?, ?, ?, ?);")
            .bind(&source.workspace_id)
            .bind(&source.id)
            .bind(&source.name)
            .bind(&source.created);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Source, StorageError> {
    let query = sqlx::query_as::<_, Source>(
        "SELECT workspace_id, id, name, created FROM sources WHERE id = ?;",
    )
    .bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    workspace_id: &str,
) -> Result<Vec<Source>, StorageError> {
    let query = sqlx::query_as::<_, Source>(
        "SELECT workspace_id, id, name, created FROM sources WHERE workspace_id = ? ORDER BY name;",
    )
    .bind(workspace_id);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}
