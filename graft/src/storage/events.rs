use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Event {
    pub id: String,
    pub kind: String,
    pub emitted: String,
}

pub async fn insert(conn: &mut SqliteConnection, event: &Event) -> Result<(), StorageError> {
    let query = sqlx::query("INSERT INTO events (id, kind, emitted) VALUES (?, ?, ?);")
        .bind(&event.id)
        .bind(&event.kind)
        .bind(&event.emitted);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let order = if reverse { "DESC" } else { "ASC" };

    let sql = format!(
        "SELECT id, kind, emitted FROM events ORDER BY emitted {order}, id {order} LIMIT ? OFFSET ?;",
    );

    sqlx::query_as::<_, Event>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

/// Removes events older than the given cutoff, expressed in epoch milliseconds.
pub async fn delete_before(
    conn: &mut SqliteConnection,
    cutoff_epoch_milli: u64,
) -> Result<u64, StorageError> {
    // emitted is a stringified epoch milli; cast for a numeric comparison.
    let query = sqlx::query("DELETE FROM events WHERE CAST(emitted AS INTEGER) < ?;")
        .bind(cutoff_epoch_milli as i64);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|result| result.rows_affected())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;

    #[tokio::test]
    async fn insert_list_prune() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        for (id, emitted) in [("ev_1", "1000"), ("ev_2", "2000"), ("ev_3", "3000")] {
            insert(
                &mut conn,
                &Event {
                    id: id.into(),
                    kind: "{}".into(),
                    emitted: emitted.into(),
                },
            )
            .await
            .unwrap();
        }

        let events = list(&mut conn, 0, 10, false).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, "ev_1");

        let newest = list(&mut conn, 0, 1, true).await.unwrap();
        assert_eq!(newest[0].id, "ev_3");

        let removed = delete_before(&mut conn, 2500).await.unwrap();
        assert_eq!(removed, 2);

        let events = list(&mut conn, 0, 10, false).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "ev_3");
    }
}
