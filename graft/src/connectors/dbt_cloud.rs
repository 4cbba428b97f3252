use super::dbt::DbtIntegration;
use super::integration::{
    opt_string, require_string, BuildContext, Integration, RunFile, SourceEvent, SourceGraph,
    TestReport,
};
use super::{Adapter, ConfigurationError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_ENDPOINT: &str = "https://cloud.getdbt.com/api/v2";

#[derive(Debug)]
pub struct DbtCloudAdapter;

impl Adapter for DbtCloudAdapter {
    fn build(&self, ctx: &BuildContext) -> Result<Box<dyn Integration>, ConfigurationError> {
        Ok(Box::new(DbtCloudIntegration {
            namespace: ctx.namespace.clone(),
            endpoint: opt_string(&ctx.metadata, "endpoint", DEFAULT_ENDPOINT),
            account_id: require_string(&ctx.metadata, "account_id")?,
            api_key: require_string(&ctx.secrets, "api_key")?,
        }))
    }
}

pub struct DbtCloudIntegration {
    namespace: String,
    endpoint: String,
    account_id: String,
    api_key: String,
}

impl std::fmt::Debug for DbtCloudIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbtCloudIntegration")
            .field("namespace", &self.namespace)
            .field("endpoint", &self.endpoint)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    data: Vec<CloudRun>,
}

#[derive(Debug, Deserialize)]
struct CloudRun {
    id: u64,
    #[serde(default)]
    status_humanized: String,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

impl DbtCloudIntegration {
    fn client(&self) -> Result<reqwest::Client> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth =
            reqwest::header::HeaderValue::from_str(&format!("Token {}", self.api_key))
                .context("api_key contains characters not valid in a header")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("could not construct http client")
    }

    async fn list_runs(&self, client: &reqwest::Client, limit: usize) -> Result<Vec<CloudRun>> {
        let url = format!(
            "{}/accounts/{}/runs/?order_by=-finished_at&limit={limit}",
            self.endpoint, self.account_id
        );

        let response = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("could not reach dbt cloud at {}", self.endpoint))?
            .error_for_status()
            .context("dbt cloud rejected the request")?;

        let runs: RunsResponse = response
            .json()
            .await
            .context("could not decode dbt cloud run listing")?;

        Ok(runs.data)
    }

    /// Pulls the manifest artifact from the most recent completed run and hands
    /// it to the regular dbt manifest processing.
    async fn latest_manifest(&self) -> Result<DbtIntegration> {
        let client = self.client()?;

        let runs = self.list_runs(&client, 1).await?;
        let run = runs
            .first()
            .ok_or_else(|| anyhow!("account {} has no completed runs", self.account_id))?;

        let url = format!(
            "{}/accounts/{}/runs/{}/artifacts/manifest.json",
            self.endpoint, self.account_id, run.id
        );

        let response = client
            .get(&url)
            .send()
            .await
            .context("could not fetch manifest artifact")?
            .error_for_status()
            .context("dbt cloud rejected the artifact request")?;

        let content = response
            .bytes()
            .await
            .context("could not read manifest artifact body")?;

        Ok(DbtIntegration::new(
            self.namespace.clone(),
            RunFile {
                name: "manifest.json".into(),
                content: Bytes::from(content),
            },
        ))
    }
}

#[async_trait]
impl Integration for DbtCloudIntegration {
    async fn extract(&self) -> Result<SourceGraph> {
        self.latest_manifest().await?.extract().await
    }

    async fn check(&self) -> Result<()> {
        let client = self.client()?;
        self.list_runs(&client, 1).await?;
        Ok(())
    }

    async fn test(&self) -> Result<TestReport> {
        self.latest_manifest().await?.test().await
    }

    /// Each completed cloud run becomes one event. Affected nodes are not
    /// resolvable from the run listing alone, so events carry no node
    /// references and rely on events_all fan-out for annotation.
    async fn events(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SourceEvent>> {
        let client = self.client()?;
        let runs = self.list_runs(&client, 100).await?;

        let events = runs
            .into_iter()
            .filter_map(|run| {
                let date = run.finished_at?;
                if let Some(since) = since {
                    if date <= since {
                        return None;
                    }
                }

                Some(SourceEvent {
                    reference: run.id.to_string(),
                    date,
                    status: run.status_humanized.clone(),
                    metadata: json!({ "run_id": run.id, "status": run.status_humanized }),
                    node_refs: vec![],
                })
            })
            .collect();

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> BuildContext {
        BuildContext {
            source_name: "dbt-cloud".into(),
            namespace: "default".into(),
            metadata: HashMap::from([("account_id".to_string(), json!("42"))]),
            secrets: HashMap::from([("api_key".to_string(), json!("dbtc_abc"))]),
            files: vec![],
        }
    }

    #[test]
    fn build_applies_endpoint_default() {
        let built = DbtCloudAdapter.build(&context()).unwrap();
        assert!(format!("{built:?}").contains(DEFAULT_ENDPOINT));
    }

    #[test]
    fn build_requires_api_key() {
        let mut ctx = context();
        ctx.secrets.clear();

        let err = DbtCloudAdapter.build(&ctx).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingField("api_key".into()));
    }
}
