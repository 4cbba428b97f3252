use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Connector {
    pub slug: String,
    pub name: String,
    pub is_active: bool,
}

/// Connectors are reference data seeded at startup, so inserts replace any existing
/// row for the slug rather than conflicting.
pub async fn upsert(
    conn: &mut SqliteConnection,
    connector: &Connector,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO connectors (slug, name, is_active) VALUES (?, ?, ?) \
        ON CONFLICT (slug) DO UPDATE SET name = excluded.name, is_active = excluded.is_active;",
    )
    .bind(&connector.slug)
    .bind(&connector.name)
    .bind(connector.is_active);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, slug: &str) -> Result<Connector, StorageError> {
    let query = sqlx::query_as::<_, Connector>(
        "SELECT slug, name, is_active FROM connectors WHERE slug = ?;",
    )
    .bind(slug);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Connector>, StorageError> {
    let query =
        sqlx::query_as::<_, Connector>("SELECT slug, name, is_active FROM connectors ORDER BY slug;");

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        let connector = Connector {
            slug: "postgres".into(),
            name: "PostgreSQL".into(),
            is_active: true,
        };

        upsert(&mut conn, &connector).await.unwrap();
        upsert(&mut conn, &connector).await.unwrap();

        let all = list(&mut conn).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].slug, "postgres");
    }
}
