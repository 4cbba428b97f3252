//! Periodic trigger registrations and one-shot run execution. The queue is
//! pluggable behind a trait; the in-process engine runs everything inside the
//! service with a bounded worker pool.

pub mod in_process;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TaskQueueError {
    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init task queue; {0}")]
    FailedPrecondition(String),

    #[error("invalid schedule for connection '{connection_id}'; {reason}")]
    InvalidSchedule {
        connection_id: String,
        reason: String,
    },

    #[error("no schedule registered for connection '{0}'")]
    NotFound(String),

    #[error("unexpected task queue error occurred; {0}")]
    Internal(String),
}

/// One periodic trigger, keyed by connection id. Registering the same
/// connection again replaces the existing entry in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRegistration {
    pub connection_id: String,

    /// Seconds-first cron expression.
    pub expression: String,

    pub enabled: bool,
}

/// The queue calls back into the orchestrator through this seam; it knows
/// nothing about what a run actually does.
#[async_trait]
pub trait RunDispatcher: Debug + Send + Sync + 'static {
    /// Execute a previously created run to its terminal state.
    async fn process_run(&self, run_id: &str);

    /// Create and execute a new scheduled run for the connection.
    async fn run_connection_schedule(&self, connection_id: &str);

    /// Invoked when a run exceeded its time limit; must resolve the run to a
    /// terminal state rather than leaving it running forever.
    async fn resolve_timeout(&self, run_id: &str);
}

#[async_trait]
pub trait TaskQueue: Debug + Send + Sync + 'static {
    async fn upsert_schedule(
        &self,
        registration: ScheduleRegistration,
    ) -> Result<(), TaskQueueError>;

    async fn remove_schedule(&self, connection_id: &str) -> Result<(), TaskQueueError>;

    /// Toggles a registration without deleting it.
    async fn set_schedule_enabled(
        &self,
        connection_id: &str,
        enabled: bool,
    ) -> Result<(), TaskQueueError>;

    /// Hands a run id to the worker pool for execution.
    async fn enqueue_run(&self, run_id: &str) -> Result<(), TaskQueueError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
pub enum Engine {
    #[default]
    InProcess,
}

pub fn new(
    config: &crate::conf::TaskQueue,
    dispatcher: Arc<dyn RunDispatcher>,
) -> Result<Box<dyn TaskQueue>, TaskQueueError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::InProcess => {
            let settings = config.in_process.clone().unwrap_or_default();
            let engine = in_process::Engine::new(&settings, dispatcher);
            Ok(Box::new(engine))
        }
    }
}
