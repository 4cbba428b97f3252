use super::integration::{
    opt_number, opt_string, require_string, BuildContext, EdgeSpec, Integration, NodeRef,
    NodeSpec, SourceGraph,
};
use super::{Adapter, ConfigurationError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres, Row};

#[derive(Debug)]
pub struct PostgresAdapter;

impl Adapter for PostgresAdapter {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError> {
        let port = opt_number(&ctx.metadata, "port", 5432)?;
        let port = u16::try_from(port).map_err(|_| ConfigurationError::InvalidField {
            field: "port".into(),
            reason: format!("'{port}' is out of range for a port number"),
        })?;

        Ok(Box::new(PostgresIntegration {
            namespace: ctx.namespace.clone(),
            host: require_string(&ctx.metadata, "host")?,
            port,
            dbname: require_string(&ctx.metadata, "dbname")?,
            user: require_string(&ctx.metadata, "user")?,
            password: opt_string(&ctx.secrets, "password", ""),
        }))
    }
}

pub struct PostgresIntegration {
    namespace: String,
    host: String,
    port: u16,
    dbname: String,
    user: String,
    password: String,
}

impl std::fmt::Debug for PostgresIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresIntegration")
            .field("namespace", &self.namespace)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl PostgresIntegration {
    async fn connect(&self) -> Result<Pool<Postgres>> {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .password(&self.password);

        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| match &e {
                // Transport failures carry platform-dependent text; a stable
                // prefix keeps them classifiable as connectivity errors.
                sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
                    anyhow!("could not reach {}:{}; {e}", self.host, self.port)
                }
                _ => anyhow::Error::new(e)
                    .context(format!("could not connect to {}:{}", self.host, self.port)),
            })
    }
}

const TABLES_QUERY: &str = "
    SELECT table_schema, table_name, table_type
    FROM information_schema.tables
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
    ORDER BY table_schema, table_name;";

const COLUMNS_QUERY: &str = "
    SELECT table_schema, table_name, column_name, data_type, is_nullable
    FROM information_schema.columns
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
    ORDER BY table_schema, table_name, ordinal_position;";

const FOREIGN_KEYS_QUERY: &str = "
    SELECT
        tc.table_schema,
        tc.table_name,
        kcu.column_name,
        ccu.table_schema AS foreign_table_schema,
        ccu.table_name   AS foreign_table_name,
        ccu.column_name  AS foreign_column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
        ON ccu.constraint_name = tc.constraint_name
        AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY';";

#[async_trait]
impl Integration for PostgresIntegration {
    async fn extract(&self) -> Result<SourceGraph> {
        let pool = self.connect().await?;
        let mut graph = SourceGraph::default();

        let tables = sqlx::query(TABLES_QUERY)
            .fetch_all(&pool)
            .await
            .context("could not list tables")?;

        for row in &tables {
            let schema: String = row.get("table_schema");
            let table: String = row.get("table_name");
            let table_type: String = row.get("table_type");

            graph.nodes.push(NodeSpec {
                namespace: self.namespace.clone(),
                name: format!("{schema}.{table}"),
                display_name: table.clone(),
                metadata: json!({ "node_type": "Table", "table_type": table_type }),
            });
        }

        let columns = sqlx::query(COLUMNS_QUERY)
            .fetch_all(&pool)
            .await
            .context("could not list columns")?;

        for row in &columns {
            let schema: String = row.get("table_schema");
            let table: String = row.get("table_name");
            let column: String = row.get("column_name");
            let data_type: String = row.get("data_type");
            let is_nullable: String = row.get("is_nullable");

            let table_name = format!("{schema}.{table}");
            let column_name = format!("{table_name}.{column}");

            graph.nodes.push(NodeSpec {
                namespace: self.namespace.clone(),
                name: column_name.clone(),
                display_name: column,
                metadata: json!({
                    "node_type": "Column",
                    "data_type": data_type,
                    "is_nullable": is_nullable == "YES",
                }),
            });

            graph.edges.push(EdgeSpec {
                namespace: self.namespace.clone(),
                name: format!("{table_name} -> {column_name}"),
                source: NodeRef {
                    namespace: self.namespace.clone(),
                    name: table_name,
                },
                destination: NodeRef {
                    namespace: self.namespace.clone(),
                    name: column_name,
                },
                metadata: json!({ "edge_type": "TableToColumn" }),
            });
        }

        let foreign_keys = sqlx::query(FOREIGN_KEYS_QUERY)
            .fetch_all(&pool)
            .await
            .context("could not list foreign keys")?;

        for row in &foreign_keys {
            let schema: String = row.get("table_schema");
            let table: String = row.get("table_name");
            let column: String = row.get("column_name");
            let f_schema: String = row.get("foreign_table_schema");
            let f_table: String = row.get("foreign_table_name");
            let f_column: String = row.get("foreign_column_name");

            let source = format!("{schema}.{table}.{column}");
            let destination = format!("{f_schema}.{f_table}.{f_column}");

            graph.edges.push(EdgeSpec {
                namespace: self.namespace.clone(),
                name: format!("{source} -> {destination}"),
                source: NodeRef {
                    namespace: self.namespace.clone(),
                    name: source,
                },
                destination: NodeRef {
                    namespace: self.namespace.clone(),
                    name: destination,
                },
                metadata: json!({ "edge_type": "ColumnToColumn" }),
            });
        }

        pool.close().await;
        Ok(graph)
    }

    async fn check(&self) -> Result<()> {
        let pool = self.connect().await?;
        sqlx::query("SELECT 1;")
            .fetch_one(&pool)
            .await
            .context("connectivity check query failed")?;
        pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> BuildContext {
        BuildContext {
            source_name: "warehouse".into(),
            namespace: "default".into(),
            metadata: HashMap::from([
                ("host".to_string(), json!("db.internal")),
                ("dbname".to_string(), json!("lineage")),
                ("user".to_string(), json!("reader")),
            ]),
            secrets: HashMap::from([("password".to_string(), json!("hunter2"))]),
            files: vec![],
        }
    }

    #[test]
    fn build_applies_port_default() {
        let ctx = context();
        let built = PostgresAdapter.build(&ctx).unwrap();
        let debug = format!("{built:?}");
        assert!(debug.contains("port: 5432"));
    }

    #[test]
    fn empty_port_equals_absent_port() {
        let mut ctx = context();
        ctx.metadata.insert("port".into(), json!(""));

        let with_empty = format!("{:?}", PostgresAdapter.build(&ctx).unwrap());
        let with_absent = format!("{:?}", PostgresAdapter.build(&context()).unwrap());
        assert_eq!(with_empty, with_absent);
    }

    #[test]
    fn build_requires_host() {
        let mut ctx = context();
        ctx.metadata.remove("host");

        let err = PostgresAdapter.build(&ctx).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingField("host".into()));
    }

    #[test]
    fn build_rejects_bad_port() {
        let mut ctx = context();
        ctx.metadata.insert("port".into(), json!("not-a-port"));

        let err = PostgresAdapter.build(&ctx).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidField { .. }));
    }
}
