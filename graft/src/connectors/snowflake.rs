use super::integration::{
    opt_string, require_string, BuildContext, EdgeSpec, Integration, NodeRef, NodeSpec,
    SourceGraph,
};
use super::{Adapter, ConfigurationError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug)]
pub struct SnowflakeAdapter;

impl Adapter for SnowflakeAdapter {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError> {
        let account = require_string(&ctx.metadata, "account")?;

        Ok(Box::new(SnowflakeIntegration {
            namespace: ctx.namespace.clone(),
            endpoint: opt_string(
                &ctx.metadata,
                "endpoint",
                &format!("https://{account}.snowflakecomputing.com"),
            ),
            database: require_string(&ctx.metadata, "database")?,
            warehouse: opt_string(&ctx.metadata, "warehouse", ""),
            role: opt_string(&ctx.metadata, "role", ""),
            token: require_string(&ctx.secrets, "token")?,
        }))
    }
}

pub struct SnowflakeIntegration {
    namespace: String,
    endpoint: String,
    database: String,
    warehouse: String,
    role: String,
    token: String,
}

impl std::fmt::Debug for SnowflakeIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeIntegration")
            .field("namespace", &self.namespace)
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

impl SnowflakeIntegration {
    /// Executes a statement through the SQL REST API and returns the raw rows.
    async fn query(&self, statement: &str) -> Result<Vec<Vec<Option<String>>>> {
        let client = reqwest::Client::builder()
            .build()
            .context("could not construct http client")?;

        let mut body = json!({
            "statement": statement,
            "database": self.database,
            "timeout": 60,
        });
        if !self.warehouse.is_empty() {
            body["warehouse"] = json!(self.warehouse);
        }
        if !self.role.is_empty() {
            body["role"] = json!(self.role);
        }

        let response = client
            .post(format!("{}/api/v2/statements", self.endpoint))
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("could not reach snowflake at {}", self.endpoint))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("snowflake statement failed ({status}); {text}"));
        }

        let parsed: StatementResponse = response
            .json()
            .await
            .context("could not decode snowflake statement response")?;

        Ok(parsed.data)
    }
}

const COLUMNS_QUERY: &str = "
    SELECT table_schema, table_name, column_name, data_type, is_nullable
    FROM information_schema.columns
    WHERE table_schema != 'INFORMATION_SCHEMA'
    ORDER BY table_schema, table_name, ordinal_position;";

#[async_trait]
impl Integration for SnowflakeIntegration {
    async fn extract(&self) -> Result<SourceGraph> {
        let rows = self.query(COLUMNS_QUERY).await?;
        let mut graph = SourceGraph::default();

        for row in rows {
            let [Some(schema), Some(table), Some(column), data_type, is_nullable] = row.as_slice()
            else {
                continue;
            };

            let table_name = format!("{schema}.{table}");
            let column_name = format!("{table_name}.{column}");

            if !graph.nodes.iter().any(|n| n.name == table_name) {
                graph.nodes.push(NodeSpec {
                    namespace: self.namespace.clone(),
                    name: table_name.clone(),
                    display_name: table.clone(),
                    metadata: json!({ "node_type": "Table" }),
                });
            }

            graph.nodes.push(NodeSpec {
                namespace: self.namespace.clone(),
                name: column_name.clone(),
                display_name: column.clone(),
                metadata: json!({
                    "node_type": "Column",
                    "data_type": data_type,
                    "is_nullable": is_nullable.as_deref() == Some("YES"),
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

        Ok(graph)
    }

    async fn check(&self) -> Result<()> {
        self.query("SELECT 1;").await?;
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
            source_name: "snowflake".into(),
            namespace: "default".into(),
            metadata: HashMap::from([
                ("account".to_string(), json!("xy12345")),
                ("database".to_string(), json!("ANALYTICS")),
            ]),
            secrets: HashMap::from([("token".to_string(), json!("tok"))]),
            files: vec![],
        }
    }

    #[test]
    fn build_derives_endpoint_from_account() {
        let built = SnowflakeAdapter.build(&context()).unwrap();
        assert!(format!("{built:?}").contains("https://xy12345.snowflakecomputing.com"));
    }

    #[test]
    fn explicit_endpoint_wins() {
        let mut ctx = context();
        ctx.metadata
            .insert("endpoint".into(), json!("https://sf.test.local"));

        let built = SnowflakeAdapter.build(&ctx).unwrap();
        assert!(format!("{built:?}").contains("https://sf.test.local"));
    }

    #[test]
    fn build_requires_token() {
        let mut ctx = context();
        ctx.secrets.clear();

        let err = SnowflakeAdapter.build(&ctx).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingField("token".into()));
    }
}
