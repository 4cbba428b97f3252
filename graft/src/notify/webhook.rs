use super::{Notifier, NotifierError, StatusReport};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    pub url: String,
}

/// Posts each status report as a JSON document to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct Engine {
    url: String,
    client: reqwest::Client,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, NotifierError> {
        if config.url.is_empty() {
            return Err(NotifierError::FailedPrecondition(
                "Webhook url must not be empty".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| NotifierError::FailedPrecondition(format!("{e:?}")))?;

        Ok(Engine {
            url: config.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for Engine {
    async fn report(&self, report: StatusReport) -> Result<(), NotifierError> {
        let body = json!({
            "reference": report.reference,
            "conclusion": report.conclusion,
            "summary": report.summary,
        });

        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifierError::Delivery(format!("{e}")))?
            .error_for_status()
            .map_err(|e| NotifierError::Delivery(format!("{e}")))?;

        Ok(())
    }
}
