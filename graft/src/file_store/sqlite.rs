use super::{FileStore, FileStoreError, Value};
use async_trait::async_trait;
use futures::TryFutureExt;
use serde::Deserialize;
use sqlx::{
    pool::PoolConnection, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Execute, Pool,
    Sqlite,
};
use std::ops::Deref;
use std::str::FromStr;
use std::{fs::File, io, path::Path};

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Engine {
    pool: Pool<Sqlite>,
}

fn map_sqlx_error(e: sqlx::Error, query: &str) -> FileStoreError {
    match e {
        sqlx::Error::RowNotFound => FileStoreError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" => FileStoreError::Exists,
                    _ => FileStoreError::GenericDBError {
                        code: Some(err_code.to_string()),
                        message: format!("Unmapped error occurred; {}", database_err),
                        query: query.into(),
                    },
                }
            } else {
                FileStoreError::GenericDBError {
                    code: None,
                    message: database_err.to_string(),
                    query: query.into(),
                }
            }
        }
        _ => FileStoreError::GenericDBError {
            code: None,
            message: e.to_string(),
            query: query.into(),
        },
    }
}

// Create file if not exists.
fn touch_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        File::create(path)?;
    }

    Ok(())
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self, FileStoreError> {
        touch_file(Path::new(&config.path))
            .map_err(|e| FileStoreError::FailedPrecondition(format!("{:?}", e)))?;

        let connect_options = SqliteConnectOptions::from_str(&format!("file:{}", &config.path))
            .map_err(|e| FileStoreError::FailedPrecondition(format!("{:?}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(connect_options)
            .await
            .map_err(|e| FileStoreError::Connection(format!("{:?}", e)))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| FileStoreError::Connection(format!("{:?}", e)))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS objects (
                key   TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (key)
            ) STRICT;",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| FileStoreError::FailedPrecondition(format!("{:?}", e)))?;

        Ok(Engine { pool })
    }

    async fn conn(&self) -> Result<PoolConnection<Sqlite>, FileStoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| FileStoreError::Connection(format!("{:?}", e)))
    }
}

#[async_trait]
impl FileStore for Engine {
    async fn get(&self, key: &str) -> Result<Value, FileStoreError> {
        let mut conn = self.conn().await?;

        let query =
            sqlx::query_as::<_, (Vec<u8>,)>("SELECT value FROM objects WHERE key = ?;").bind(key);

        let sql = query.sql();

        query
            .fetch_one(&mut *conn)
            .map_ok(|(value,)| Value(value))
            .map_err(|e| map_sqlx_error(e, sql))
            .await
    }

    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), FileStoreError> {
        let mut conn = self.conn().await?;

        let query = sqlx::query("INSERT INTO objects (key, value) VALUES (?, ?);")
            .bind(key)
            .bind(content.clone());

        let sql = query.sql();

        // If there is already a key we provide the functionality to update that key instead of
        // passing back up the conflict error.
        if let Err(e) = query.execute(&mut *conn).await {
            match map_sqlx_error(e, sql) {
                FileStoreError::Exists if force => {
                    let update_query = sqlx::query("UPDATE objects SET value = ? WHERE key = ?;")
                        .bind(content)
                        .bind(key);

                    let update_sql = update_query.sql();

                    update_query
                        .execute(&mut *conn)
                        .await
                        .map_err(|err| map_sqlx_error(err, update_sql))?;
                }
                err => return Err(err),
            };
        };

        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, FileStoreError> {
        let mut conn = self.conn().await?;

        let query = sqlx::query_as::<_, (String,)>(
            "SELECT key FROM objects WHERE key LIKE ? ORDER BY key;",
        )
        .bind(format!("{prefix}%"));

        let sql = query.sql();

        let rows = query
            .fetch_all(&mut *conn)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        let keys = rows.into_iter().map(|(key,)| key).collect();

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), FileStoreError> {
        let mut conn = self.conn().await?;

        let query = sqlx::query("DELETE FROM objects WHERE key = ?;").bind(key);

        let sql = query.sql();

        query
            .execute(&mut *conn)
            .map_ok(|_| ())
            .map_err(|e| map_sqlx_error(e, sql))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    pub struct TestHarness {
        pub db: Engine,
        pub storage_path: String,
    }

    impl TestHarness {
        pub async fn new() -> Self {
            let mut rng = rand::thread_rng();
            let append_num: u16 = rng.gen();
            let storage_path = format!("/tmp/graft_tests_file_store{}.db", append_num);

            let db = Engine::new(&Config {
                path: storage_path.clone(),
            })
            .await
            .unwrap();

            Self { db, storage_path }
        }
    }

    impl std::ops::Deref for TestHarness {
        type Target = Engine;

        fn deref(&self) -> &Self::Target {
            &self.db
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            std::fs::remove_file(&self.storage_path).unwrap();
            let _ = std::fs::remove_file(format!("{}{}", &self.storage_path, "-shm"));
            let _ = std::fs::remove_file(format!("{}{}", &self.storage_path, "-wal"));
        }
    }

    #[tokio::test]
    /// Basic CRUD can be accomplished.
    async fn crud() {
        let harness = TestHarness::new().await;

        let test_key = "conn_1/manifest.json";
        let test_value = Value("test_value".as_bytes().to_vec());

        harness
            .db
            .put(test_key, test_value.clone().0, false)
            .await
            .unwrap();

        let returned_value = harness.get(test_key).await.unwrap();
        assert_eq!(test_value, returned_value);

        let returned_err = harness
            .db
            .put(test_key, test_value.clone().0, false)
            .await
            .unwrap_err();
        assert_eq!(FileStoreError::Exists, returned_err);

        let test_value_2 = Value("test_value_2".as_bytes().to_vec());

        harness
            .db
            .put(test_key, test_value_2.clone().0, true)
            .await
            .unwrap();

        let returned_value = harness.get(test_key).await.unwrap();
        assert_eq!(test_value_2, returned_value);

        let keys = harness.list_keys("conn_1/").await.unwrap();
        assert_eq!(keys, vec![test_key.to_string()]);

        harness.delete(test_key).await.unwrap();

        let returned_err = harness.get(test_key).await.unwrap_err();
        assert_eq!(FileStoreError::NotFound, returned_err);
    }
}
