//! Connector registry and adapter dispatch. Each supported connector kind
//! registers an adapter which knows how to turn a connection's stored
//! configuration into a ready [`integration::Integration`] instance.

pub mod dbt;
pub mod dbt_cloud;
pub mod fivetran;
pub mod flat_file;
pub mod integration;
pub mod postgres;
pub mod snowflake;

use integration::{BuildContext, Integration};
use std::fmt::Debug;

/// Misconfiguration detected before or during adapter construction. These are
/// operator errors and are surfaced loudly rather than being folded into the
/// normal downstream-failure handling.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No connector found for: {0}")]
    UnknownConnector(String),

    #[error("Required field '{0}' is missing")]
    MissingField(String),

    #[error("Field '{field}' is invalid; {reason}")]
    InvalidField { field: String, reason: String },
}

pub trait Adapter: Debug + Send + Sync {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError>;
}

/// The full connector catalog seeded into storage at startup. Entries without a
/// registered adapter are visible but cannot be dispatched yet.
pub const CATALOG: &[(&str, &str)] = &[
    ("postgres", "PostgreSQL"),
    ("snowflake", "Snowflake"),
    ("mssql", "Microsoft SQL Server"),
    ("bigquery", "Google BigQuery"),
    ("dbt", "dbt"),
    ("dbt_cloud", "dbt Cloud"),
    ("fivetran", "Fivetran"),
    ("mysql", "MySQL"),
    ("redshift", "Amazon Redshift"),
    ("flat_file", "Flat File"),
    ("metabase", "Metabase"),
    ("looker", "Looker"),
    ("open_lineage", "OpenLineage"),
    ("yaml_file", "YAML File"),
    ("cube", "Cube"),
];

/// Map a connector slug to its adapter. Slugs that exist in the catalog but
/// have no adapter yet fail the same way unknown slugs do; callers cannot tell
/// the difference and should not need to.
pub fn resolve(slug: &str) -> Result<Box<dyn Adapter>, ConfigurationError> {
    match slug {
        "postgres" => Ok(Box::new(postgres::PostgresAdapter)),
        "snowflake" => Ok(Box::new(snowflake::SnowflakeAdapter)),
        "dbt" => Ok(Box::new(dbt::DbtAdapter)),
        "dbt_cloud" => Ok(Box::new(dbt_cloud::DbtCloudAdapter)),
        "fivetran" => Ok(Box::new(fivetran::FivetranAdapter)),
        "flat_file" => Ok(Box::new(flat_file::FlatFileAdapter)),
        _ => Err(ConfigurationError::UnknownConnector(slug.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolve_known_connectors() {
        for slug in ["postgres", "snowflake", "dbt", "dbt_cloud", "fivetran", "flat_file"] {
            assert!(resolve(slug).is_ok(), "no adapter for {slug}");
        }
    }

    #[test]
    fn resolve_unknown_connector() {
        let err = resolve("spreadsheet").unwrap_err();
        assert_eq!(err.to_string(), "No connector found for: spreadsheet");
    }

    #[test]
    fn catalog_entries_without_adapters_are_unknown() {
        let err = resolve("metabase").unwrap_err();
        assert_eq!(err.to_string(), "No connector found for: metabase");
    }
}
