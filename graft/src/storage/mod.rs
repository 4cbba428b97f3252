pub mod connections;
pub mod connectors;
pub mod edges;
pub mod events;
pub mod nodes;
pub mod runs;
pub mod sources;
pub mod workspaces;

use sqlx::{
    pool::PoolConnection, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool, Sqlite,
    Transaction,
};
use std::{
    fs::File,
    io,
    ops::Deref,
    path::Path,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("did not find any fields to update for target entity")]
    NoFieldsUpdated,

    #[error("unexpected storage error occurred; {0}")]
    GenericDBError(String),
}

/// Current epoch time in milliseconds. Timestamps are stored as stringified epoch
/// millis so they survive sqlite's loose typing unchanged.
pub fn epoch_milli() -> u64 {
    let current_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();

    u64::try_from(current_epoch).unwrap()
}

/// Sqlite errors are determined by database error code. We map these to specific
/// storage errors so callers can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
pub fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => StorageError::Exists,
                    _ => StorageError::GenericDBError(format!(
                        "[{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                StorageError::GenericDBError(format!("{database_err}; query: {query}"))
            }
        }
        _ => StorageError::GenericDBError(format!("{e:#?}; query: {query}")),
    }
}

// Create file if not exists.
fn touch_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        File::create(path)?;
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct Db {
    pub write_pool: Pool<Sqlite>,
    pub read_pool: Pool<Sqlite>,
}

impl Db {
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        touch_file(Path::new(path))
            .map_err(|e| StorageError::Connection(format!("could not create db file; {e:?}")))?;

        // We create two different pools of connections. The read pool has many connections
        // and is high concurrency. The write pool is essentially a single connection in
        // which only one write can be made at a time. Not using this paradigm may result in
        // sqlite "database is locked(error: 5)" errors because of the manner in which
        // sqlite handles transactions.
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StorageError::Connection(format!("{e:?}")))?
            // * journal_mode: Turns on WAL mode which increases concurrency and reliability.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // * synchronous: Sync to disk only at critical junctures; safe under WAL mode.
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // * foreign_keys: Turns on relational style foreign keys. A must have.
            .foreign_keys(true)
            // * busy_timeout: How long a query waits on a lock before erroring.
            .busy_timeout(std::time::Duration::from_secs(5));

        let read_pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| StorageError::Connection(format!("{e:?}")))?;

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(format!("{e:?}")))?;

        sqlx::query(SCHEMA)
            .execute(&write_pool)
            .await
            .map_err(|e| StorageError::Connection(format!("could not run db schema; {e:?}")))?;

        Ok(Db {
            write_pool,
            read_pool,
        })
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{e:?}")))
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{e:?}")))
    }

    /// Open a transaction against the write pool.
    ///
    /// Sqlite by default opens all transactions as deferred, meaning no locks are held
    /// until a write operation comes in, at which point a competing write voids the whole
    /// transaction. sqlx does not support IMMEDIATE transactions, so we force a write to
    /// a dummy table to make the transaction grab the lock up front.
    /// Relevant ticket here: https://github.com/launchbadge/sqlx/issues/481
    pub async fn open_tx(&self) -> Result<Transaction<'_, Sqlite>, StorageError> {
        let mut tx = self
            .write_pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(format!("{e:?}")))?;

        sqlx::query("INSERT INTO transaction_mutex (id, lock) VALUES (1, 1);")
            .execute(tx.as_mut())
            .await
            .map_err(|e| {
                StorageError::Connection(format!(
                    "Error while attempting to start transaction using transaction_mutex table; {e:?}"
                ))
            })?;

        Ok(tx)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transaction_mutex (
    id   TEXT    NOT NULL,
    lock INTEGER NOT NULL CHECK (lock IN (0, 1))
) STRICT;

CREATE TABLE IF NOT EXISTS workspaces (
    id       TEXT NOT NULL,
    name     TEXT NOT NULL,
    created  TEXT NOT NULL,
    modified TEXT NOT NULL,
    PRIMARY KEY (id)
) STRICT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_workspaces_name ON workspaces (name);

CREATE TABLE IF NOT EXISTS sources (
    workspace_id TEXT NOT NULL,
    id           TEXT NOT NULL,
    name         TEXT NOT NULL,
    created      TEXT NOT NULL,
    PRIMARY KEY (id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces (id) ON DELETE CASCADE
) STRICT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_sources_workspace_name ON sources (workspace_id, name);

CREATE TABLE IF NOT EXISTS connectors (
    slug      TEXT    NOT NULL,
    name      TEXT    NOT NULL,
    is_active INTEGER NOT NULL CHECK (is_active IN (0, 1)),
    PRIMARY KEY (slug)
) STRICT;

CREATE TABLE IF NOT EXISTS connections (
    workspace_id   TEXT    NOT NULL,
    id             TEXT    NOT NULL,
    connector_slug TEXT    NOT NULL,
    source_id      TEXT    NOT NULL,
    namespace      TEXT    NOT NULL,
    name           TEXT    NOT NULL,
    metadata       TEXT    NOT NULL,
    secrets        BLOB    NOT NULL,
    schedule       TEXT    NOT NULL,
    is_active      INTEGER NOT NULL CHECK (is_active IN (0, 1)),
    validated      INTEGER NOT NULL CHECK (validated IN (0, 1)),
    created        TEXT    NOT NULL,
    modified       TEXT    NOT NULL,
    PRIMARY KEY (id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces (id) ON DELETE CASCADE,
    FOREIGN KEY (connector_slug) REFERENCES connectors (slug),
    FOREIGN KEY (source_id) REFERENCES sources (id)
) STRICT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_workspace_namespace_name
    ON connections (workspace_id, namespace, name);

CREATE TABLE IF NOT EXISTS runs (
    workspace_id  TEXT NOT NULL,
    id            TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    source_id     TEXT NOT NULL,
    action        TEXT NOT NULL,
    status        TEXT NOT NULL,
    trigger       TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    commit_ref    TEXT,
    created       TEXT NOT NULL,
    started       TEXT NOT NULL,
    ended         TEXT NOT NULL,
    PRIMARY KEY (id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces (id) ON DELETE CASCADE,
    FOREIGN KEY (connection_id) REFERENCES connections (id) ON DELETE CASCADE
) STRICT;

CREATE INDEX IF NOT EXISTS idx_runs_connection ON runs (connection_id, created);

CREATE TABLE IF NOT EXISTS nodes (
    workspace_id TEXT    NOT NULL,
    id           TEXT    NOT NULL,
    source_id    TEXT    NOT NULL,
    namespace    TEXT    NOT NULL,
    name         TEXT    NOT NULL,
    display_name TEXT    NOT NULL,
    metadata     TEXT    NOT NULL,
    is_active    INTEGER NOT NULL CHECK (is_active IN (0, 1)),
    created      TEXT    NOT NULL,
    modified     TEXT    NOT NULL,
    PRIMARY KEY (id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces (id) ON DELETE CASCADE
) STRICT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_workspace_namespace_name
    ON nodes (workspace_id, namespace, name);

CREATE TABLE IF NOT EXISTS edges (
    workspace_id        TEXT    NOT NULL,
    id                  TEXT    NOT NULL,
    source_id           TEXT    NOT NULL,
    namespace           TEXT    NOT NULL,
    name                TEXT    NOT NULL,
    source_node_id      TEXT    NOT NULL,
    destination_node_id TEXT    NOT NULL,
    metadata            TEXT    NOT NULL,
    is_active           INTEGER NOT NULL CHECK (is_active IN (0, 1)),
    created             TEXT    NOT NULL,
    modified            TEXT    NOT NULL,
    PRIMARY KEY (id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces (id) ON DELETE CASCADE,
    FOREIGN KEY (source_node_id) REFERENCES nodes (id) ON DELETE CASCADE,
    FOREIGN KEY (destination_node_id) REFERENCES nodes (id) ON DELETE CASCADE
) STRICT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_workspace_namespace_name
    ON edges (workspace_id, namespace, name);

CREATE TABLE IF NOT EXISTS events (
    id      TEXT NOT NULL,
    kind    TEXT NOT NULL,
    emitted TEXT NOT NULL,
    PRIMARY KEY (id)
) STRICT;
"#;

#[cfg(test)]
pub mod tests {
    use super::*;

    pub struct TestHarness {
        pub db: Db,
        storage_path: String,
    }

    impl TestHarness {
        pub async fn new() -> Self {
            let append_num: u16 = rand::random();
            let storage_path = format!("/tmp/graft_tests_storage{append_num}.db");

            let db = Db::new(&storage_path).await.unwrap();

            Self { db, storage_path }
        }

        pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
            self.db.write_conn().await
        }

        pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
            self.db.read_conn().await
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.storage_path);
            let _ = std::fs::remove_file(format!("{}-shm", &self.storage_path));
            let _ = std::fs::remove_file(format!("{}-wal", &self.storage_path));
        }
    }
}
