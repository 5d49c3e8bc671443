//! # Broadcast Dispatcher
//!
//! Background consumer of the dispatch queue: claims due run tasks in
//! batches and fans them out to [`BroadcastRunner`]s under a bounded
//! semaphore. A runner error marks the task failed and leaves the
//! broadcast row as the source of truth; re-enqueueing it replays the
//! idempotent dispatch loop.

use std::sync::Arc;

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::queue::TaskQueue;
use crate::worker::BroadcastRunner;

/// Background dispatcher service.
pub struct BroadcastDispatcher {
    config: Arc<AppConfig>,
    queue: Arc<dyn TaskQueue>,
    runner: Arc<BroadcastRunner>,
}

impl BroadcastDispatcher {
    pub fn new(
        config: Arc<AppConfig>,
        queue: Arc<dyn TaskQueue>,
        runner: Arc<BroadcastRunner>,
    ) -> Self {
        Self {
            config,
            queue,
            runner,
        }
    }

    /// Run the dispatch loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ApiError> {
        info!("Starting broadcast dispatcher");
        let tick_interval = TokioDuration::from_millis(self.config.dispatch.tick_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Broadcast dispatcher shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    if let Err(err) = self.claim_and_run().await {
                        error!(error = ?err, "Dispatcher tick failed");
                    }
                }
            }
        }

        info!("Broadcast dispatcher stopped");
        Ok(())
    }

    /// Claim one batch of due tasks and execute them concurrently.
    pub async fn claim_and_run(&self) -> Result<usize, ApiError> {
        let timer = Instant::now();
        let tasks = self.queue.claim(self.config.dispatch.claim_batch).await?;
        let count = tasks.len();

        if tasks.is_empty() {
            debug!("No due run tasks to claim");
            return Ok(0);
        }

        info!("Claimed {} run tasks for execution", count);

        let semaphore = Arc::new(Semaphore::new(self.config.dispatch.concurrency));
        let mut handles = Vec::with_capacity(count);

        for task in tasks {
            let runner = self.runner.clone();
            let queue = self.queue.clone();
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ApiError::from(crate::error::ErrorType::InternalServerError))?;

            let handle = tokio::spawn(async move {
                let _permit = permit;
                match runner.run(&task).await {
                    Ok(outcome) => {
                        debug!(task_id = %task.id, outcome = ?outcome, "Run task finished");
                        counter!("broadcast_tasks_completed_total").increment(1);
                        if let Err(err) = queue.complete(task.id, true).await {
                            error!(error = ?err, task_id = %task.id, "Failed to mark task done");
                        }
                    }
                    Err(err) => {
                        error!(error = ?err, task_id = %task.id, "Run task failed");
                        counter!("broadcast_tasks_failed_total").increment(1);
                        if let Err(err) = queue.complete(task.id, false).await {
                            error!(error = ?err, task_id = %task.id, "Failed to mark task failed");
                        }
                    }
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        let elapsed = timer.elapsed();
        histogram!("broadcast_dispatch_batch_duration_ms")
            .record(elapsed.as_secs_f64() * 1_000.0);
        info!(
            "Completed {} run tasks in {:.2}s",
            count,
            elapsed.as_secs_f64()
        );

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::channel::{
        ChannelCredential, ChannelSender, MessageTarget, SendError, SendReceipt,
        StaticCredentialResolver, TemplateRef,
    };
    use crate::config::DispatchConfig;
    use crate::models::broadcast::BroadcastStatus;
    use crate::models::contact::Contact;
    use crate::queue::InMemoryTaskQueue;
    use crate::repositories::broadcast::NewBroadcast;
    use crate::repositories::{BroadcastRepository, DedupLedger};
    use crate::sync_notifier::NoopSyncNotifier;
    use async_trait::async_trait;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        async fn send(
            &self,
            target: &MessageTarget,
            _template: &TemplateRef,
            _variables: &BTreeMap<String, String>,
            _credential: &ChannelCredential,
        ) -> Result<SendReceipt, SendError> {
            self.sent.lock().unwrap().push(target.address.clone());
            Ok(SendReceipt {
                message_id: format!("msg-{}", target.address),
            })
        }
    }

    async fn setup() -> (DatabaseConnection, Uuid) {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("create in-memory db");
        Migrator::up(&db, None).await.expect("apply migrations");

        let tenant_id = Uuid::new_v4();
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            "INSERT INTO tenants (id, name) VALUES (?, ?)",
            vec![tenant_id.into(), "Test Tenant".into()],
        ))
        .await
        .expect("insert tenant");

        (db, tenant_id)
    }

    #[tokio::test]
    async fn claimed_tasks_run_to_completion() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db.clone());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });

        let mut config = AppConfig::default();
        config.dispatch = DispatchConfig {
            message_delay_ms: 0,
            message_delay_jitter_ms: 0,
            ..DispatchConfig::default()
        };
        let config = Arc::new(config);

        let runner = Arc::new(BroadcastRunner::new(
            repo.clone(),
            DedupLedger::new(db.clone()),
            sender.clone(),
            Arc::new(StaticCredentialResolver::new(Some("token".to_string()))),
            Arc::new(NoopSyncNotifier),
            None,
            config.dispatch.clone(),
            BackoffPolicy::default(),
        ));

        let created = repo
            .create(
                tenant_id,
                NewBroadcast {
                    name: "Promo".to_string(),
                    account_id: "acct".to_string(),
                    sender_id: "sender".to_string(),
                    template_name: "welcome".to_string(),
                    template_language: "en".to_string(),
                    template_components: None,
                    contacts: vec![Contact::new("Ada", "+1"), Contact::new("Grace", "+2")],
                    timezone: None,
                    time_window_start: None,
                    time_window_end: None,
                    enable_deduplication: false,
                    sync_integration_id: None,
                },
            )
            .await
            .expect("create");
        repo.transition(
            created.id,
            &[BroadcastStatus::Pending],
            BroadcastStatus::Processing,
        )
        .await
        .expect("start");
        queue
            .enqueue(tenant_id, created.id, false)
            .await
            .expect("enqueue");

        let dispatcher = BroadcastDispatcher::new(config, queue.clone(), runner);
        let ran = dispatcher.claim_and_run().await.expect("dispatch");
        assert_eq!(ran, 1);

        assert_eq!(sender.sent.lock().unwrap().len(), 2);
        let status = repo
            .current_status(created.id)
            .await
            .expect("status")
            .expect("exists");
        assert_eq!(status, BroadcastStatus::Completed);
        assert!(!queue.has_active(created.id).await.expect("has_active"));
    }

    #[tokio::test]
    async fn empty_queue_is_a_quiet_tick() {
        let (db, _tenant_id) = setup().await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let config = Arc::new(AppConfig::default());

        let runner = Arc::new(BroadcastRunner::new(
            BroadcastRepository::new(db.clone()),
            DedupLedger::new(db.clone()),
            Arc::new(RecordingSender {
                sent: Mutex::new(Vec::new()),
            }),
            Arc::new(StaticCredentialResolver::new(Some("token".to_string()))),
            Arc::new(NoopSyncNotifier),
            None,
            config.dispatch.clone(),
            BackoffPolicy::default(),
        ));

        let dispatcher = BroadcastDispatcher::new(config, queue, runner);
        let ran = dispatcher.claim_and_run().await.expect("dispatch");
        assert_eq!(ran, 0);
    }
}
