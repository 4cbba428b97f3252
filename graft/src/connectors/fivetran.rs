use super::integration::{
    opt_number, opt_string, require_string, BuildContext, EdgeSpec, Integration, NodeRef,
    NodeSpec, SourceEvent, SourceGraph,
};
use super::{Adapter, ConfigurationError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_ENDPOINT: &str = "https://api.fivetran.com/v1";
const DEFAULT_LIMIT: u64 = 10000;
const DEFAULT_PARALLELIZATION: u64 = 10;

#[derive(Debug)]
pub struct FivetranAdapter;

impl Adapter for FivetranAdapter {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError> {
        Ok(Box::new(FivetranIntegration {
            namespace: ctx.namespace.clone(),
            endpoint: opt_string(&ctx.metadata, "endpoint", DEFAULT_ENDPOINT),
            limit: opt_number(&ctx.metadata, "limit", DEFAULT_LIMIT)?,
            parallelization: opt_number(&ctx.metadata, "parallelization", DEFAULT_PARALLELIZATION)?,
            api_key: require_string(&ctx.secrets, "api_key")?,
            api_secret: require_string(&ctx.secrets, "api_secret")?,
        }))
    }
}

pub struct FivetranIntegration {
    namespace: String,
    endpoint: String,
    limit: u64,
    parallelization: u64,
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for FivetranIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FivetranIntegration")
            .field("namespace", &self.namespace)
            .field("endpoint", &self.endpoint)
            .field("limit", &self.limit)
            .field("parallelization", &self.parallelization)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: ApiData<T>,
}

#[derive(Debug, Deserialize)]
struct ApiData<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize, Clone)]
struct Group {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize, Clone)]
struct ApiConnector {
    id: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    succeeded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    failed_at: Option<DateTime<Utc>>,
}

impl FivetranIntegration {
    fn client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .build()
            .context("could not construct http client")
    }

    async fn get_items<T: serde::de::DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        path: &str,
    ) -> Result<Vec<T>> {
        let url = format!("{}/{path}?limit={}", self.endpoint, self.limit);

        let response = client
            .get(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await
            .with_context(|| format!("could not reach fivetran at {}", self.endpoint))?
            .error_for_status()
            .with_context(|| format!("fivetran rejected the request to {path}"))?;

        let body: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("could not decode fivetran response from {path}"))?;

        Ok(body.data.items)
    }

    async fn connectors(&self, client: &reqwest::Client) -> Result<Vec<(Group, ApiConnector)>> {
        let groups: Vec<Group> = self.get_items(client, "groups").await?;

        // Group listings are independent, so fetch them concurrently up to the
        // configured parallelization.
        let pairs: Vec<Vec<(Group, ApiConnector)>> = stream::iter(groups)
            .map(|group| async move {
                let connectors: Vec<ApiConnector> = self
                    .get_items(client, &format!("groups/{}/connectors", group.id))
                    .await?;
                Ok::<_, anyhow::Error>(
                    connectors
                        .into_iter()
                        .map(|c| (group.clone(), c))
                        .collect(),
                )
            })
            .buffer_unordered(self.parallelization.max(1) as usize)
            .try_collect()
            .await?;

        Ok(pairs.into_iter().flatten().collect())
    }
}

#[async_trait]
impl Integration for FivetranIntegration {
    async fn extract(&self) -> Result<SourceGraph> {
        let client = self.client()?;
        let mut graph = SourceGraph::default();

        for (group, connector) in self.connectors(&client).await? {
            let group_name = group.name.clone();
            let connector_name = format!("{}.{}", group.name, connector.schema);

            if !graph.nodes.iter().any(|n| n.name == group_name) {
                graph.nodes.push(NodeSpec {
                    namespace: self.namespace.clone(),
                    name: group_name.clone(),
                    display_name: group.name.clone(),
                    metadata: json!({ "node_type": "Destination", "fivetran_group_id": group.id }),
                });
            }

            graph.nodes.push(NodeSpec {
                namespace: self.namespace.clone(),
                name: connector_name.clone(),
                display_name: connector.schema.clone(),
                metadata: json!({
                    "node_type": "Pipeline",
                    "fivetran_connector_id": connector.id,
                    "service": connector.service,
                }),
            });

            graph.edges.push(EdgeSpec {
                namespace: self.namespace.clone(),
                name: format!("{connector_name} -> {group_name}"),
                source: NodeRef {
                    namespace: self.namespace.clone(),
                    name: connector_name,
                },
                destination: NodeRef {
                    namespace: self.namespace.clone(),
                    name: group_name,
                },
                metadata: json!({ "edge_type": "PipelineToDestination" }),
            });
        }

        Ok(graph)
    }

    async fn check(&self) -> Result<()> {
        let client = self.client()?;
        let _: Vec<Group> = self.get_items(&client, "groups").await?;
        Ok(())
    }

    /// The most recent sync outcome per connector, reported as one event each.
    async fn events(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SourceEvent>> {
        let client = self.client()?;
        let mut events = vec![];

        for (group, connector) in self.connectors(&client).await? {
            let Some((date, status)) =
                latest_outcome(connector.succeeded_at, connector.failed_at)
            else {
                continue;
            };

            if let Some(since) = since {
                if date <= since {
                    continue;
                }
            }

            events.push(SourceEvent {
                reference: format!("{}/{}", group.id, connector.id),
                date,
                status: status.to_string(),
                metadata: json!({ "service": connector.service }),
                node_refs: vec![NodeRef {
                    namespace: self.namespace.clone(),
                    name: format!("{}.{}", group.name, connector.schema),
                }],
            });
        }

        Ok(events)
    }
}

/// Picks the most recent sync outcome; a connector that has never run yields
/// nothing.
fn latest_outcome(
    succeeded_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, &'static str)> {
    match (succeeded_at, failed_at) {
        (Some(ok), Some(failed)) if failed > ok => Some((failed, "failure")),
        (None, Some(failed)) => Some((failed, "failure")),
        (Some(ok), _) => Some((ok, "success")),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> BuildContext {
        BuildContext {
            source_name: "fivetran".into(),
            namespace: "default".into(),
            metadata: HashMap::new(),
            secrets: HashMap::from([
                ("api_key".to_string(), json!("key")),
                ("api_secret".to_string(), json!("secret")),
            ]),
            files: vec![],
        }
    }

    #[test]
    fn build_applies_defaults() {
        let built = FivetranAdapter.build(&context()).unwrap();
        let debug = format!("{built:?}");
        assert!(debug.contains(DEFAULT_ENDPOINT));
        assert!(debug.contains("limit: 10000"));
        assert!(debug.contains("parallelization: 10"));
    }

    #[rstest]
    #[case::empty_endpoint("endpoint", json!(""))]
    #[case::empty_limit("limit", json!(""))]
    fn empty_fields_fall_back_to_defaults(#[case] key: &str, #[case] value: serde_json::Value) {
        let mut ctx = context();
        ctx.metadata.insert(key.to_string(), value);

        let with_empty = format!("{:?}", FivetranAdapter.build(&ctx).unwrap());
        let with_absent = format!("{:?}", FivetranAdapter.build(&context()).unwrap());
        assert_eq!(with_empty, with_absent);
    }

    #[test]
    fn build_requires_credentials() {
        let mut ctx = context();
        ctx.secrets.remove("api_secret");

        let err = FivetranAdapter.build(&ctx).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingField("api_secret".into()));
    }

    #[test]
    fn build_rejects_malformed_limit() {
        let mut ctx = context();
        ctx.metadata.insert("limit".into(), json!("lots"));

        let err = FivetranAdapter.build(&ctx).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidField { .. }));
    }

    #[rstest]
    #[case::only_failed(None, Some(200), Some((200, "failure")))]
    #[case::only_succeeded(Some(100), None, Some((100, "success")))]
    #[case::failed_after_success(Some(100), Some(200), Some((200, "failure")))]
    #[case::recovered(Some(200), Some(100), Some((200, "success")))]
    #[case::never_ran(None, None, None)]
    fn latest_outcome_picks_most_recent(
        #[case] succeeded: Option<i64>,
        #[case] failed: Option<i64>,
        #[case] expected: Option<(i64, &str)>,
    ) {
        let ts = |millis| DateTime::from_timestamp_millis(millis).unwrap();
        let outcome = latest_outcome(succeeded.map(ts), failed.map(ts));
        assert_eq!(outcome, expected.map(|(millis, status)| (ts(millis), status)));
    }
}
