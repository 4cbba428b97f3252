use super::integration::{
    BuildContext, EdgeSpec, Integration, NodeRef, NodeSpec, RunFile, SourceGraph,
};
use super::{Adapter, ConfigurationError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

#[derive(Debug)]
pub struct FlatFileAdapter;

impl Adapter for FlatFileAdapter {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError> {
        // Exactly one file per run; the upload itself is the configuration.
        let file = ctx
            .files
            .first()
            .ok_or_else(|| ConfigurationError::MissingField("file".to_string()))?;

        Ok(Box::new(FlatFileIntegration {
            namespace: ctx.namespace.clone(),
            file: file.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct FlatFileIntegration {
    namespace: String,
    file: RunFile,
}

impl FlatFileIntegration {
    fn table_name(&self) -> String {
        match self.file.name.rsplit_once('.') {
            Some((stem, _)) => stem.to_string(),
            None => self.file.name.clone(),
        }
    }

    fn headers(&self) -> Result<Vec<String>> {
        let mut reader = csv::Reader::from_reader(self.file.content.as_ref());
        let headers = reader
            .headers()
            .with_context(|| format!("could not parse '{}' as csv", self.file.name))?;

        Ok(headers.iter().map(str::to_string).collect())
    }
}

#[async_trait]
impl Integration for FlatFileIntegration {
    /// The file itself becomes one table node; its header row supplies the
    /// column nodes.
    async fn extract(&self) -> Result<SourceGraph> {
        let headers = self.headers()?;
        let table_name = self.table_name();
        let mut graph = SourceGraph::default();

        graph.nodes.push(NodeSpec {
            namespace: self.namespace.clone(),
            name: table_name.clone(),
            display_name: table_name.clone(),
            metadata: json!({ "node_type": "Table", "file_name": self.file.name }),
        });

        for header in headers {
            let column_name = format!("{table_name}.{header}");

            graph.nodes.push(NodeSpec {
                namespace: self.namespace.clone(),
                name: column_name.clone(),
                display_name: header,
                metadata: json!({ "node_type": "Column" }),
            });

            graph.edges.push(EdgeSpec {
                namespace: self.namespace.clone(),
                name: format!("{table_name} -> {column_name}"),
                source: NodeRef {
                    namespace: self.namespace.clone(),
                    name: table_name.clone(),
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
        let headers = self.headers()?;
        if headers.is_empty() {
            anyhow::bail!("'{}' has no header row", self.file.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn context(name: &str, content: &str) -> BuildContext {
        BuildContext {
            source_name: "uploads".into(),
            namespace: "default".into(),
            metadata: HashMap::new(),
            secrets: HashMap::new(),
            files: vec![RunFile {
                name: name.into(),
                content: Bytes::from(content.to_string()),
            }],
        }
    }

    #[tokio::test]
    async fn extract_columns_from_header() {
        let ctx = context("orders.csv", "id,amount,created_at\n1,10.0,2024-01-01\n");
        let built = FlatFileAdapter.build(&ctx).unwrap();
        let graph = built.extract().await.unwrap();

        let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["orders", "orders.id", "orders.amount", "orders.created_at"]
        );
        assert_eq!(graph.edges.len(), 3);
    }

    #[tokio::test]
    async fn check_accepts_valid_csv() {
        let ctx = context("orders.csv", "id,amount\n1,10.0\n");
        let built = FlatFileAdapter.build(&ctx).unwrap();
        built.check().await.unwrap();
    }

    #[test]
    fn build_requires_a_file() {
        let ctx = BuildContext {
            namespace: "default".into(),
            ..Default::default()
        };
        let err = FlatFileAdapter.build(&ctx).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingField("file".into()));
    }
}
