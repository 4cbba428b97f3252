use super::{RunDispatcher, ScheduleRegistration, TaskQueue, TaskQueueError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration};
use tracing::{debug, error, warn};

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Maximum number of runs executing concurrently.
    pub workers: usize,

    /// How often the trigger loop checks registered schedules, in seconds.
    pub tick_interval: u64,

    /// Per-run time limit in seconds. A run that exceeds it is resolved to a
    /// terminal state through the dispatcher's timeout hook.
    pub run_time_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            tick_interval: 60,
            run_time_limit: 1800,
        }
    }
}

#[derive(Debug, Clone)]
struct Registration {
    schedule: Schedule,
    expression: String,
    enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Engine {
    registrations: Arc<DashMap<String, Registration>>,
    dispatcher: Arc<dyn RunDispatcher>,
    worker_permits: Arc<Semaphore>,
    run_time_limit: Duration,
}

/// True when the schedule fires at least once in the half-open window
/// (after, until].
fn is_due(schedule: &Schedule, after: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    match schedule.after(&after).next() {
        Some(next) => next <= until,
        None => false,
    }
}

impl Engine {
    pub fn new(config: &Config, dispatcher: Arc<dyn RunDispatcher>) -> Self {
        let engine = Engine {
            registrations: Arc::new(DashMap::new()),
            dispatcher,
            worker_permits: Arc::new(Semaphore::new(config.workers.max(1))),
            run_time_limit: Duration::from_secs(config.run_time_limit),
        };

        let trigger_engine = engine.clone();
        let tick_interval = config.tick_interval.max(1);

        tokio::spawn(async move {
            let mut interval_timer = interval(Duration::from_secs(tick_interval));
            // The first tick completes immediately; consume it so the loop
            // starts with a real window.
            interval_timer.tick().await;
            let mut last_tick = Utc::now();

            loop {
                interval_timer.tick().await;
                let now = Utc::now();

                let due: Vec<String> = trigger_engine
                    .registrations
                    .iter()
                    .filter(|entry| entry.enabled && is_due(&entry.schedule, last_tick, now))
                    .map(|entry| entry.key().clone())
                    .collect();

                for connection_id in due {
                    debug!(connection_id, "schedule fired");
                    let dispatcher = trigger_engine.dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.run_connection_schedule(&connection_id).await;
                    });
                }

                last_tick = now;
            }
        });

        engine
    }
}

#[async_trait]
impl TaskQueue for Engine {
    async fn upsert_schedule(
        &self,
        registration: ScheduleRegistration,
    ) -> Result<(), TaskQueueError> {
        let schedule = Schedule::from_str(&registration.expression).map_err(|e| {
            TaskQueueError::InvalidSchedule {
                connection_id: registration.connection_id.clone(),
                reason: e.to_string(),
            }
        })?;

        // Keyed by connection id, so re-registering can never leave an
        // orphaned duplicate trigger behind.
        self.registrations.insert(
            registration.connection_id,
            Registration {
                schedule,
                expression: registration.expression,
                enabled: registration.enabled,
            },
        );

        Ok(())
    }

    async fn remove_schedule(&self, connection_id: &str) -> Result<(), TaskQueueError> {
        self.registrations.remove(connection_id);
        Ok(())
    }

    async fn set_schedule_enabled(
        &self,
        connection_id: &str,
        enabled: bool,
    ) -> Result<(), TaskQueueError> {
        let mut entry = self
            .registrations
            .get_mut(connection_id)
            .ok_or_else(|| TaskQueueError::NotFound(connection_id.to_string()))?;

        entry.enabled = enabled;
        Ok(())
    }

    async fn enqueue_run(&self, run_id: &str) -> Result<(), TaskQueueError> {
        let run_id = run_id.to_string();
        let dispatcher = self.dispatcher.clone();
        let permits = self.worker_permits.clone();
        let time_limit = self.run_time_limit;

        tokio::spawn(async move {
            let _permit = match permits.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, run_id, "worker pool is shut down; dropping run");
                    return;
                }
            };

            let work = dispatcher.process_run(&run_id);
            if tokio::time::timeout(time_limit, work).await.is_err() {
                warn!(run_id, limit_secs = time_limit.as_secs(), "run exceeded time limit");
                dispatcher.resolve_timeout(&run_id).await;
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingDispatcher {
        processed: Mutex<Vec<String>>,
        timed_out: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RunDispatcher for RecordingDispatcher {
        async fn process_run(&self, run_id: &str) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.processed.lock().unwrap().push(run_id.to_string());
        }

        async fn run_connection_schedule(&self, _connection_id: &str) {}

        async fn resolve_timeout(&self, run_id: &str) {
            self.timed_out.lock().unwrap().push(run_id.to_string());
        }
    }

    fn config() -> Config {
        Config {
            workers: 2,
            tick_interval: 3600,
            run_time_limit: 5,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = Engine::new(&config(), dispatcher);

        engine
            .upsert_schedule(ScheduleRegistration {
                connection_id: "conn_1".into(),
                expression: "0 30 * * * *".into(),
                enabled: true,
            })
            .await
            .unwrap();

        engine
            .upsert_schedule(ScheduleRegistration {
                connection_id: "conn_1".into(),
                expression: "0 45 * * * *".into(),
                enabled: true,
            })
            .await
            .unwrap();

        assert_eq!(engine.registrations.len(), 1);
        assert_eq!(
            engine.registrations.get("conn_1").unwrap().expression,
            "0 45 * * * *"
        );
    }

    #[tokio::test]
    async fn rejects_malformed_expression() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = Engine::new(&config(), dispatcher);

        let err = engine
            .upsert_schedule(ScheduleRegistration {
                connection_id: "conn_1".into(),
                expression: "whenever".into(),
                enabled: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TaskQueueError::InvalidSchedule { .. }));
    }

    #[tokio::test]
    async fn enable_toggle_requires_registration() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = Engine::new(&config(), dispatcher);

        let err = engine
            .set_schedule_enabled("conn_missing", false)
            .await
            .unwrap_err();
        assert_eq!(err, TaskQueueError::NotFound("conn_missing".into()));

        engine
            .upsert_schedule(ScheduleRegistration {
                connection_id: "conn_1".into(),
                expression: "0 30 * * * *".into(),
                enabled: true,
            })
            .await
            .unwrap();
        engine.set_schedule_enabled("conn_1", false).await.unwrap();
        assert!(!engine.registrations.get("conn_1").unwrap().enabled);
    }

    #[tokio::test]
    async fn enqueued_runs_reach_the_dispatcher() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = Engine::new(&config(), dispatcher.clone());

        engine.enqueue_run("run_1").await.unwrap();
        engine.enqueue_run("run_2").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut processed = dispatcher.processed.lock().unwrap().clone();
        processed.sort();
        assert_eq!(processed, vec!["run_1".to_string(), "run_2".to_string()]);
    }

    #[tokio::test]
    async fn timeout_invokes_the_cleanup_hook() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let engine = Engine::new(
            &Config {
                workers: 1,
                tick_interval: 3600,
                run_time_limit: 1,
            },
            dispatcher.clone(),
        );

        engine.enqueue_run("run_slow").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            dispatcher.timed_out.lock().unwrap().clone(),
            vec!["run_slow".to_string()]
        );
        assert!(dispatcher.processed.lock().unwrap().is_empty());
    }

    #[test]
    fn due_window_detection() {
        let schedule = Schedule::from_str("0 30 2 * * *").unwrap();
        let before: DateTime<Utc> = "2024-06-01T02:29:00Z".parse().unwrap();
        let hit: DateTime<Utc> = "2024-06-01T02:31:00Z".parse().unwrap();

        assert!(is_due(&schedule, before, hit));
        assert!(!is_due(&schedule, hit, "2024-06-01T03:00:00Z".parse().unwrap()));
    }
}
