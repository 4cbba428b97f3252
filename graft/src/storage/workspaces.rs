use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created: String,
    pub modified: String,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    workspace: &Workspace,
) -> Result<(), StorageError> {
    let query =
        sqlx::query("INSERT INTO workspaces (id, name, created, modified) VALUES (?, ?, ?, ?);")
            .bind(&workspace.id)
            .bind(&workspace.name)
            .bind(&workspace.created)
            .bind(&workspace.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Workspace, StorageError> {
    let query = sqlx::query_as::<_, Workspace>(
        "SELECT id, name, created, modified FROM workspaces WHERE id = ?;",
    )
    .bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Workspace>, StorageError> {
    let query = sqlx::query_as::<_, Workspace>(
        "SELECT id, name, created, modified FROM workspaces ORDER BY name;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}
