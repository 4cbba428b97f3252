use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Connection {
    pub workspace_id: String,
    pub id: String,
    pub connector_slug: String,
    pub source_id: String,
    pub namespace: String,
    pub name: String,
    pub metadata: String,
    pub secrets: Vec<u8>,
    pub schedule: String,
    pub is_active: bool,
    pub validated: bool,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub metadata: Option<String>,
    pub secrets: Option<Vec<u8>>,
    pub schedule: Option<String>,
    pub is_active: Option<bool>,
    pub validated: Option<bool>,
    pub modified: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    connection: &Connection,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO connections (workspace_id, id, connector_slug, source_id, namespace, name, \
        metadata, secrets, schedule, is_active, validated, created, modified) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&connection.workspace_id)
    .bind(&connection.id)
    .bind(&connection.connector_slug)
    .bind(&connection.source_id)
    .bind(&connection.namespace)
    .bind(&connection.name)
    .bind(&connection.metadata)
    .bind(&connection.secrets)
    .bind(&connection.schedule)
    .bind(connection.is_active)
    .bind(connection.validated)
    .bind(&connection.created)
    .bind(&connection.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Connection, StorageError> {
    let query = sqlx::query_as::<_, Connection>(
        "SELECT workspace_id, id, connector_slug, source_id, namespace, name, metadata, secrets, \
        schedule, is_active, validated, created, modified FROM connections WHERE id = ?;",
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
) -> Result<Vec<Connection>, StorageError> {
    let query = sqlx::query_as::<_, Connection>(
        "SELECT workspace_id, id, connector_slug, source_id, namespace, name, metadata, secrets, \
        schedule, is_active, validated, created, modified FROM connections \
        WHERE workspace_id = ? ORDER BY namespace, name;",
    )
    .bind(workspace_id);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Lists every active connection with a non-empty schedule across all workspaces;
/// used at service start to re-register periodic triggers.
pub async fn list_scheduled(
    conn: &mut SqliteConnection,
) -> Result<Vec<Connection>, StorageError> {
    let query = sqlx::query_as::<_, Connection>(
        "SELECT workspace_id, id, connector_slug, source_id, namespace, name, metadata, secrets, \
        schedule, is_active, validated, created, modified FROM connections \
        WHERE is_active = 1 AND schedule != '' ORDER BY workspace_id, namespace, name;",
    );

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
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE connections SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.metadata {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("metadata = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.secrets {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("secrets = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.schedule {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("schedule = ");
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

    if let Some(value) = &fields.validated {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("validated = ");
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
    use crate::storage::tests::TestHarness;
    use sqlx::{pool::PoolConnection, Sqlite};

    async fn setup() -> (TestHarness, PoolConnection<Sqlite>) {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        let workspace = crate::storage::workspaces::Workspace {
            id: "some_workspace".into(),
            name: "Some Workspace".into(),
            created: "0".into(),
            modified: "0".into(),
        };
        crate::storage::workspaces::insert(&mut conn, &workspace)
            .await
            .unwrap();

        let source = crate::storage::sources::Source {
            workspace_id: "some_workspace".into(),
            id: "some_source".into(),
            name: "Some Source".into(),
            created: "0".into(),
        };
        crate::storage::sources::insert(&mut conn, &source)
            .await
            .unwrap();

        let connector = crate::storage::connectors::Connector {
            slug: "postgres".into(),
            name: "PostgreSQL".into(),
            is_active: true,
        };
        crate::storage::connectors::upsert(&mut conn, &connector)
            .await
            .unwrap();

        let connection = Connection {
            workspace_id: "some_workspace".into(),
            id: "some_connection".into(),
            connector_slug: "postgres".into(),
            source_id: "some_source".into(),
            namespace: "default".into(),
            name: "prod-db".into(),
            metadata: r#"{"host":"localhost"}"#.into(),
            secrets: vec![],
            schedule: "".into(),
            is_active: true,
            validated: false,
            created: "0".into(),
            modified: "0".into(),
        };
        insert(&mut conn, &connection).await.unwrap();

        (harness, conn)
    }

    #[tokio::test]
    async fn unique_per_workspace_namespace_name() {
        let (_harness, mut conn) = setup().await;

        let duplicate = Connection {
            workspace_id: "some_workspace".into(),
            id: "another_connection".into(),
            connector_slug: "postgres".into(),
            source_id: "some_source".into(),
            namespace: "default".into(),
            name: "prod-db".into(),
            metadata: "{}".into(),
            secrets: vec![],
            schedule: "".into(),
            is_active: true,
            validated: false,
            created: "0".into(),
            modified: "0".into(),
        };

        let result = insert(&mut conn, &duplicate).await;
        assert_eq!(result.unwrap_err(), StorageError::Exists);
    }

    #[tokio::test]
    async fn update_connection() {
        let (_harness, mut conn) = setup().await;

        update(
            &mut conn,
            "some_connection",
            UpdatableFields {
                validated: Some(true),
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let updated = get(&mut conn, "some_connection").await.unwrap();
        assert!(updated.validated);
        assert!(!updated.is_active);
    }

    #[tokio::test]
    async fn update_requires_fields() {
        let (_harness, mut conn) = setup().await;

        let result = update(&mut conn, "some_connection", UpdatableFields::default()).await;
        assert_eq!(result.unwrap_err(), StorageError::NoFieldsUpdated);
    }
}
