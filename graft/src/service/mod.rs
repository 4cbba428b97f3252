//! Service assembly: builds the shared state every subsystem hangs off of,
//! wires the task queue's dispatch seam back into the executor, and drives
//! startup (connector seeding, schedule registration) for `graft service start`.

use crate::conf;
use crate::connections::Connection;
use crate::events::{EventBus, Kind};
use crate::file_store::FileStore;
use crate::notify::Notifier;
use crate::runs::{executor, Action, Run, Trigger};
use crate::storage;
use crate::task_queue::{RunDispatcher, ScheduleRegistration, TaskQueue};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

/// Shared handles used across the orchestrator. Cheap to clone via Arc.
pub struct State {
    pub config: conf::Config,
    pub storage: storage::Db,
    pub file_store: Box<dyn FileStore>,
    pub event_bus: EventBus,
    pub notifier: Box<dyn Notifier>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State").finish_non_exhaustive()
    }
}

impl State {
    pub async fn new(config: conf::Config) -> Result<Arc<Self>> {
        // AES-256-GCM takes exactly 32 key bytes.
        if config.general.encryption_key.len() != 32 {
            bail!("encryption_key must be exactly 32 characters long");
        }

        let storage = storage::Db::new(&config.storage.path)
            .await
            .context("could not init storage")?;

        let file_store = crate::file_store::new(&config.file_store)
            .await
            .context("could not init file store")?;

        let notifier = crate::notify::new(&config.notifier).context("could not init notifier")?;

        // Keep a week of event history, pruned hourly.
        let event_bus = EventBus::new(storage.clone(), 60 * 60 * 24 * 7, 60 * 60);

        Ok(Arc::new(State {
            config,
            storage,
            file_store,
            event_bus,
            notifier,
        }))
    }

    pub fn encryption_key(&self) -> &[u8] {
        self.config.general.encryption_key.as_bytes()
    }

    /// Creates a pending run with its attached files and announces it. Callers
    /// decide how the run gets executed; the service hands it to the worker
    /// pool, the CLI processes it inline.
    pub async fn create_run(
        &self,
        connection_id: &str,
        action: Action,
        commit_ref: Option<String>,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Run> {
        let mut conn = self.storage.write_conn().await?;
        let stored = storage::connections::get(&mut conn, connection_id)
            .await
            .with_context(|| format!("could not load connection '{connection_id}'"))?;
        let connection: Connection = stored.try_into()?;

        let run = Run::new(
            &connection.workspace_id,
            &connection.id,
            &connection.source_id,
            action,
            Trigger::Manual,
            commit_ref,
        );

        storage::runs::insert(&mut conn, &run.clone().try_into()?)
            .await
            .context("could not create run")?;
        drop(conn);

        for (name, content) in files {
            self.file_store
                .put(&format!("{}/{name}", run.id), content, true)
                .await
                .map_err(|e| anyhow::anyhow!("could not attach file '{name}'; {e}"))?;
        }

        self.event_bus.publish(Kind::QueuedRun {
            connection_id: connection.id,
            run_id: run.id.clone(),
            action: action.to_string(),
        });

        Ok(run)
    }
}

/// Bridges the task queue back into the executor. The queue handle is filled
/// in after construction because the queue itself is built around this
/// dispatcher.
#[derive(Debug)]
pub struct Dispatcher {
    state: Arc<State>,
    queue: OnceLock<Arc<dyn TaskQueue>>,
}

#[async_trait]
impl RunDispatcher for Dispatcher {
    async fn process_run(&self, run_id: &str) {
        if let Err(e) = executor::process_run(&self.state, run_id).await {
            error!(error = %e, run_id, "run processing failed");
        }
    }

    async fn run_connection_schedule(&self, connection_id: &str) {
        match executor::create_scheduled_run(&self.state, connection_id).await {
            Ok(run_id) => {
                let Some(queue) = self.queue.get() else {
                    error!(connection_id, "task queue not wired up; dropping scheduled run");
                    return;
                };

                if let Err(e) = queue.enqueue_run(&run_id).await {
                    error!(error = %e, run_id, "could not enqueue scheduled run");
                }
            }
            Err(e) => {
                error!(error = %e, connection_id, "could not create scheduled run");
            }
        }
    }

    async fn resolve_timeout(&self, run_id: &str) {
        if let Err(e) = executor::resolve_timeout(&self.state, run_id).await {
            error!(error = %e, run_id, "could not resolve timed out run");
        }
    }
}

pub struct Service {
    pub state: Arc<State>,
    pub task_queue: Arc<dyn TaskQueue>,
}

impl Service {
    pub async fn new(config: conf::Config) -> Result<Service> {
        let state = State::new(config).await?;

        let dispatcher = Arc::new(Dispatcher {
            state: state.clone(),
            queue: OnceLock::new(),
        });

        let task_queue: Arc<dyn TaskQueue> =
            crate::task_queue::new(&state.config.task_queue, dispatcher.clone())
                .context("could not init task queue")?
                .into();

        // The dispatcher needs the queue to hand scheduled runs to the worker
        // pool; close the loop now that both halves exist.
        let _ = dispatcher.queue.set(task_queue.clone());

        Ok(Service { state, task_queue })
    }

    /// Ensures every cataloged connector exists in storage. New entries emit a
    /// registration event; existing ones are refreshed in place.
    pub async fn seed_connectors(&self) -> Result<()> {
        let mut conn = self.state.storage.write_conn().await?;

        for (slug, name) in crate::connectors::CATALOG {
            let known = storage::connectors::get(&mut conn, slug).await.is_ok();

            storage::connectors::upsert(
                &mut conn,
                &storage::connectors::Connector {
                    slug: slug.to_string(),
                    name: name.to_string(),
                    is_active: true,
                },
            )
            .await
            .with_context(|| format!("could not seed connector '{slug}'"))?;

            if !known {
                self.state.event_bus.publish(Kind::RegisteredConnector {
                    slug: slug.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Registers triggers for every active connection with a schedule. Run at
    /// startup; registrations are in-memory and do not survive a restart.
    pub async fn register_schedules(&self) -> Result<()> {
        let mut conn = self.state.storage.read_conn().await?;
        let scheduled = storage::connections::list_scheduled(&mut conn).await?;
        drop(conn);

        for stored in scheduled {
            let connection: Connection = match stored.try_into() {
                Ok(connection) => connection,
                Err(e) => {
                    error!(error = %e, "skipping connection with unreadable schedule");
                    continue;
                }
            };

            if let Err(e) = self.sync_schedule(&connection).await {
                error!(error = %e, connection_id = connection.id, "could not register schedule");
            }
        }

        Ok(())
    }

    /// Reflects a connection's schedule into the task queue: registered and
    /// toggled by its active flag, or removed when the schedule was cleared.
    /// Unsupported schedule kinds are rejected here, at save time.
    pub async fn sync_schedule(&self, connection: &Connection) -> Result<()> {
        connection.schedule.validate()?;

        match connection.schedule.cron_expression() {
            Some(expression) => {
                self.task_queue
                    .upsert_schedule(ScheduleRegistration {
                        connection_id: connection.id.clone(),
                        expression: expression.clone(),
                        enabled: connection.is_active,
                    })
                    .await?;

                self.state.event_bus.publish(Kind::RegisteredSchedule {
                    connection_id: connection.id.clone(),
                    expression,
                });
            }
            None => {
                self.task_queue.remove_schedule(&connection.id).await?;

                self.state.event_bus.publish(Kind::RemovedSchedule {
                    connection_id: connection.id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Creates a pending run and hands it to the worker pool. The entry point
    /// behind manual triggers.
    pub async fn trigger_run(
        &self,
        connection_id: &str,
        action: Action,
        commit_ref: Option<String>,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<String> {
        let run = self
            .state
            .create_run(connection_id, action, commit_ref, files)
            .await?;

        self.task_queue
            .enqueue_run(&run.id)
            .await
            .context("could not enqueue run")?;

        Ok(run.id)
    }

    /// Brings the service fully up and parks until interrupted.
    pub async fn start(&self) -> Result<()> {
        self.seed_connectors().await?;
        self.register_schedules().await?;

        info!("service started");

        tokio::signal::ctrl_c()
            .await
            .context("could not listen for shutdown signal")?;

        info!("shutting down");
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::runs::executor::tests::TestContext;

    #[tokio::test]
    async fn overlong_encryption_key_is_rejected_at_startup() {
        let mut config = conf::Config::parse(&None).unwrap();
        config.general.encryption_key = "0123456789012345678901234567890123456789".into();

        let err = State::new(config).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "encryption_key must be exactly 32 characters long"
        );
    }

    #[tokio::test]
    async fn schedule_sync_rejects_unsupported_kind() {
        let ctx = TestContext::new().await;
        let service = Service {
            state: ctx.state.clone(),
            task_queue: crate::task_queue::new(
                &conf::TaskQueue::default(),
                Arc::new(NoopDispatcher),
            )
            .unwrap()
            .into(),
        };

        let mut connection = ctx.seed_connection("postgres").await;
        connection.schedule = crate::connections::Schedule::Unsupported("interval".into());

        let err = service.sync_schedule(&connection).await.unwrap_err();
        assert_eq!(err.to_string(), "Unsupported schedule type 'interval'");
    }

    #[tokio::test]
    async fn seed_connectors_is_idempotent() {
        let ctx = TestContext::new().await;
        let service = Service {
            state: ctx.state.clone(),
            task_queue: crate::task_queue::new(
                &conf::TaskQueue::default(),
                Arc::new(NoopDispatcher),
            )
            .unwrap()
            .into(),
        };

        service.seed_connectors().await.unwrap();
        service.seed_connectors().await.unwrap();

        let mut conn = ctx.state.storage.read_conn().await.unwrap();
        let connectors = storage::connectors::list(&mut conn).await.unwrap();
        assert_eq!(connectors.len(), crate::connectors::CATALOG.len());
    }

    #[derive(Debug)]
    struct NoopDispatcher;

    #[async_trait]
    impl RunDispatcher for NoopDispatcher {
        async fn process_run(&self, _run_id: &str) {}
        async fn run_connection_schedule(&self, _connection_id: &str) {}
        async fn resolve_timeout(&self, _run_id: &str) {}
    }
}
