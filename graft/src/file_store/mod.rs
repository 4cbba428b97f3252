pub mod sqlite;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use strum::{Display, EnumString};

/// Attached run artifacts (dbt manifests, flat files) keyed by
/// "{connection_id}/{file_name}".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(pub Vec<u8>);

/// Represents different file store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FileStoreError {
    #[error("could not establish connection to file store; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init file store; {0}")]
    FailedPrecondition(String),

    #[error(
        "unexpected storage error occurred; code: {code:?}; message: {message}; query: {query}"
    )]
    GenericDBError {
        code: Option<String>,
        message: String,
        query: String,
    },
}

#[async_trait]
pub trait FileStore: Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Value, FileStoreError>;
    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), FileStoreError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, FileStoreError>;
    async fn delete(&self, key: &str) -> Result<(), FileStoreError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
pub enum Engine {
    #[default]
    Sqlite,
}

pub async fn new(config: &crate::conf::FileStore) -> Result<Box<dyn FileStore>, FileStoreError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Sqlite => {
            if config.sqlite.is_none() {
                return Err(FileStoreError::FailedPrecondition(
                    "Sqlite engine settings not found in config".into(),
                ));
            }

            let engine = sqlite::Engine::new(&config.clone().sqlite.unwrap()).await?;
            Ok(Box::new(engine))
        }
    }
}
