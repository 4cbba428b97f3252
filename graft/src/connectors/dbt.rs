use super::integration::{
    BuildContext, EdgeSpec, Integration, NodeRef, NodeSpec, RunFile, SourceGraph, TestAssertion,
    TestReport,
};
use super::{Adapter, ConfigurationError};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug)]
pub struct DbtAdapter;

impl Adapter for DbtAdapter {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError> {
        let manifest = ctx
            .file(MANIFEST_FILE)
            .ok_or_else(|| ConfigurationError::MissingField(MANIFEST_FILE.to_string()))?;

        Ok(Box::new(DbtIntegration {
            namespace: ctx.namespace.clone(),
            manifest: manifest.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct DbtIntegration {
    namespace: String,
    manifest: RunFile,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    nodes: HashMap<String, ManifestNode>,
    #[serde(default)]
    sources: HashMap<String, ManifestNode>,
    #[serde(default)]
    parent_map: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ManifestNode {
    name: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    resource_type: String,
    #[serde(default)]
    depends_on: DependsOn,
}

#[derive(Debug, Default, Deserialize)]
struct DependsOn {
    #[serde(default)]
    nodes: Vec<String>,
}

impl DbtIntegration {
    pub(crate) fn new(namespace: String, manifest: RunFile) -> Self {
        Self { namespace, manifest }
    }

    fn parse(&self) -> Result<Manifest> {
        serde_json::from_slice(&self.manifest.content)
            .with_context(|| format!("could not parse '{}' as a dbt manifest", self.manifest.name))
    }
}

fn graph_name(node: &ManifestNode) -> String {
    if node.schema.is_empty() {
        node.name.clone()
    } else {
        format!("{}.{}", node.schema, node.name)
    }
}

#[async_trait]
impl Integration for DbtIntegration {
    async fn extract(&self) -> Result<SourceGraph> {
        let manifest = self.parse()?;
        let mut graph = SourceGraph::default();

        // Maps dbt unique_ids to graph node names for parent_map resolution.
        let mut names: HashMap<&String, String> = HashMap::new();

        for (unique_id, node) in manifest.nodes.iter().chain(manifest.sources.iter()) {
            // Tests and other ephemeral resources are not lineage entities.
            if !matches!(node.resource_type.as_str(), "model" | "source" | "seed" | "snapshot") {
                continue;
            }

            let name = graph_name(node);
            names.insert(unique_id, name.clone());

            graph.nodes.push(NodeSpec {
                namespace: self.namespace.clone(),
                name,
                display_name: node.name.clone(),
                metadata: json!({
                    "node_type": "Table",
                    "dbt_unique_id": unique_id,
                    "dbt_resource_type": node.resource_type,
                }),
            });
        }

        for (child_id, parent_ids) in &manifest.parent_map {
            let Some(child_name) = names.get(child_id) else {
                continue;
            };

            for parent_id in parent_ids {
                let Some(parent_name) = names.get(parent_id) else {
                    continue;
                };

                graph.edges.push(EdgeSpec {
                    namespace: self.namespace.clone(),
                    name: format!("{parent_name} -> {child_name}"),
                    source: NodeRef {
                        namespace: self.namespace.clone(),
                        name: parent_name.clone(),
                    },
                    destination: NodeRef {
                        namespace: self.namespace.clone(),
                        name: child_name.clone(),
                    },
                    metadata: json!({ "edge_type": "TableToTable" }),
                });
            }
        }

        Ok(graph)
    }

    async fn check(&self) -> Result<()> {
        let manifest = self.parse()?;
        if manifest.nodes.is_empty() && manifest.sources.is_empty() {
            bail!("manifest contains no nodes or sources");
        }
        Ok(())
    }

    /// Asserts every model in the manifest is covered by at least one dbt test.
    async fn test(&self) -> Result<TestReport> {
        let manifest = self.parse()?;

        let mut tested: HashMap<&String, bool> = manifest
            .nodes
            .iter()
            .filter(|(_, node)| node.resource_type == "model")
            .map(|(id, _)| (id, false))
            .collect();

        for node in manifest.nodes.values() {
            if node.resource_type != "test" {
                continue;
            }

            for dependency in &node.depends_on.nodes {
                if let Some(flag) = tested.get_mut(dependency) {
                    *flag = true;
                }
            }
        }

        let mut assertions: Vec<TestAssertion> = tested
            .into_iter()
            .map(|(id, passed)| TestAssertion {
                name: format!("{id} has test coverage"),
                passed,
                message: if passed {
                    "covered by at least one test".into()
                } else {
                    "no dbt test references this model".into()
                },
            })
            .collect();
        assertions.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(TestReport { assertions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn manifest_file(content: serde_json::Value) -> RunFile {
        RunFile {
            name: MANIFEST_FILE.into(),
            content: Bytes::from(serde_json::to_vec(&content).unwrap()),
        }
    }

    fn context(content: serde_json::Value) -> BuildContext {
        BuildContext {
            source_name: "dbt-project".into(),
            namespace: "default".into(),
            metadata: HashMap::new(),
            secrets: HashMap::new(),
            files: vec![manifest_file(content)],
        }
    }

    fn sample_manifest() -> serde_json::Value {
        json!({
            "nodes": {
                "model.jaffle.orders": {
                    "name": "orders",
                    "schema": "analytics",
                    "resource_type": "model"
                },
                "model.jaffle.customers": {
                    "name": "customers",
                    "schema": "analytics",
                    "resource_type": "model"
                },
                "test.jaffle.not_null_orders_id": {
                    "name": "not_null_orders_id",
                    "resource_type": "test",
                    "depends_on": { "nodes": ["model.jaffle.orders"] }
                }
            },
            "sources": {
                "source.jaffle.raw_orders": {
                    "name": "raw_orders",
                    "schema": "raw",
                    "resource_type": "source"
                }
            },
            "parent_map": {
                "model.jaffle.orders": ["source.jaffle.raw_orders"],
                "model.jaffle.customers": ["model.jaffle.orders"]
            }
        })
    }

    #[tokio::test]
    async fn extract_models_and_lineage() {
        let built = DbtAdapter.build(&context(sample_manifest())).unwrap();
        let graph = built.extract().await.unwrap();

        let mut node_names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        node_names.sort();
        assert_eq!(
            node_names,
            vec!["analytics.customers", "analytics.orders", "raw.raw_orders"]
        );

        let mut edge_names: Vec<&str> = graph.edges.iter().map(|e| e.name.as_str()).collect();
        edge_names.sort();
        assert_eq!(
            edge_names,
            vec![
                "analytics.orders -> analytics.customers",
                "raw.raw_orders -> analytics.orders"
            ]
        );
    }

    #[tokio::test]
    async fn check_accepts_valid_manifest() {
        let built = DbtAdapter.build(&context(sample_manifest())).unwrap();
        built.check().await.unwrap();
    }

    #[tokio::test]
    async fn check_rejects_empty_manifest() {
        let built = DbtAdapter.build(&context(json!({}))).unwrap();
        assert!(built.check().await.is_err());
    }

    #[tokio::test]
    async fn test_reports_untested_models() {
        let built = DbtAdapter.build(&context(sample_manifest())).unwrap();
        let report = built.test().await.unwrap();

        assert_eq!(report.assertions.len(), 2);
        assert!(!report.passed());

        let untested = report
            .assertions
            .iter()
            .find(|a| a.name.contains("customers"))
            .unwrap();
        assert!(!untested.passed);
    }

    #[test]
    fn build_requires_manifest_file() {
        let ctx = BuildContext {
            namespace: "default".into(),
            ..Default::default()
        };
        let err = DbtAdapter.build(&ctx).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingField(MANIFEST_FILE.into()));
    }
}
