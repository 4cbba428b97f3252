pub mod webhook;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use strum::{Display, EnumString};
use tracing::info;

/// Outcome report for an externally-observable reference, typically a commit or
/// pull request that triggered a test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub reference: String,
    pub conclusion: String,
    pub summary: String,
}

#[derive(thiserror::Error, Debug)]
pub enum NotifierError {
    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init notifier; {0}")]
    FailedPrecondition(String),

    #[error("could not deliver notification; {0}")]
    Delivery(String),
}

/// Delivery is fire-and-forget from the orchestrator's perspective; a failed
/// notification never changes a run's outcome.
#[async_trait]
pub trait Notifier: Debug + Send + Sync + 'static {
    async fn report(&self, report: StatusReport) -> Result<(), NotifierError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
pub enum Engine {
    #[default]
    Log,
    Webhook,
}

/// Writes reports to the service log and nothing else. The default engine.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn report(&self, report: StatusReport) -> Result<(), NotifierError> {
        info!(
            reference = report.reference,
            conclusion = report.conclusion,
            summary = report.summary,
            "status report"
        );
        Ok(())
    }
}

pub fn new(config: &crate::conf::Notifier) -> Result<Box<dyn Notifier>, NotifierError> {
    match config.engine {
        Engine::Log => Ok(Box::new(LogNotifier)),
        Engine::Webhook => {
            let Some(settings) = config.webhook.clone() else {
                return Err(NotifierError::FailedPrecondition(
                    "Webhook engine settings not found in config".into(),
                ));
            };

            let engine = webhook::Engine::new(&settings)?;
            Ok(Box::new(engine))
        }
    }
}
