//! # Broadcast Scheduler
//!
//! Background task that promotes due scheduled broadcasts and re-arms
//! paused ones when their delivery window reopens. The scheduler only ever
//! flips statuses and enqueues run tasks; it never executes sends itself.
//! All promotions are guarded transitions, so a racing operator action or
//! second scheduler instance simply loses the swap.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::broadcast::{BroadcastStatus, Model as Broadcast};
use crate::queue::TaskQueue;
use crate::repositories::BroadcastRepository;
use crate::window::window_open_at;

/// Default number of broadcasts evaluated per pass.
const DEFAULT_BATCH_SIZE: u64 = 128;

/// Background scheduler service.
pub struct BroadcastScheduler {
    config: Arc<AppConfig>,
    repo: BroadcastRepository,
    queue: Arc<dyn TaskQueue>,
    batch_size: u64,
}

#[derive(Debug, Default)]
struct TickStats {
    due_started: u64,
    due_parked: u64,
    resumed: u64,
    skipped_active_task: u64,
    broadcasts_with_errors: u64,
}

impl BroadcastScheduler {
    /// Create a new scheduler instance.
    pub fn new(
        config: Arc<AppConfig>,
        repo: BroadcastRepository,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            config,
            repo,
            queue,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the number of broadcasts processed per tick (primarily for tests).
    #[allow(dead_code)]
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ApiError> {
        info!("Starting broadcast scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.scheduler.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Broadcast scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Scheduler tick failed");
                    }
                    let elapsed = tick_started.elapsed();
                    histogram!("broadcast_scheduler_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Broadcast scheduler stopped");
        Ok(())
    }

    /// One scheduler pass: due-scheduled promotion, then paused-resume.
    pub async fn tick(&self) -> Result<(), ApiError> {
        let mut stats = TickStats::default();

        let due = self.repo.due_scheduled(Utc::now(), self.batch_size).await?;
        for broadcast in due {
            let id = broadcast.id;
            if let Err(err) = self.promote_due(broadcast, &mut stats).await {
                stats.broadcasts_with_errors += 1;
                error!(error = ?err, broadcast_id = %id, "Failed to promote due broadcast");
            }
        }

        let paused = self.repo.paused(self.batch_size).await?;
        for broadcast in paused {
            let id = broadcast.id;
            if let Err(err) = self.resume_paused(broadcast, &mut stats).await {
                stats.broadcasts_with_errors += 1;
                error!(error = ?err, broadcast_id = %id, "Failed to resume paused broadcast");
            }
        }

        debug!(
            due_started = stats.due_started,
            due_parked = stats.due_parked,
            resumed = stats.resumed,
            skipped_active_task = stats.skipped_active_task,
            errors = stats.broadcasts_with_errors,
            "Scheduler tick completed"
        );

        Ok(())
    }

    /// A due scheduled broadcast starts if its window is open, otherwise it
    /// parks as paused and stays armed for window reopening.
    async fn promote_due(
        &self,
        broadcast: Broadcast,
        stats: &mut TickStats,
    ) -> Result<(), ApiError> {
        let now = Utc::now();

        if !window_open_at(&broadcast, now) {
            let parked = self
                .repo
                .transition(
                    broadcast.id,
                    &[BroadcastStatus::Scheduled],
                    BroadcastStatus::Paused,
                )
                .await?;
            if parked {
                stats.due_parked += 1;
                info!(
                    broadcast_id = %broadcast.id,
                    tenant_id = %broadcast.tenant_id,
                    "Due broadcast outside delivery window; parked as paused"
                );
                counter!("broadcast_scheduler_parked_total").increment(1);
            }
            return Ok(());
        }

        if self.queue.has_active(broadcast.id).await? {
            stats.skipped_active_task += 1;
            debug!(broadcast_id = %broadcast.id, "Run task already pending; skipping enqueue");
            return Ok(());
        }

        let started = self
            .repo
            .transition(
                broadcast.id,
                &[BroadcastStatus::Scheduled],
                BroadcastStatus::Processing,
            )
            .await?;
        if !started {
            debug!(broadcast_id = %broadcast.id, "Lost due-promotion race; skipping");
            return Ok(());
        }

        self.queue
            .enqueue(broadcast.tenant_id, broadcast.id, false)
            .await?;
        stats.due_started += 1;
        info!(
            broadcast_id = %broadcast.id,
            tenant_id = %broadcast.tenant_id,
            "Due broadcast promoted to processing"
        );
        counter!("broadcast_scheduler_started_total").increment(1);

        Ok(())
    }

    /// A paused broadcast resumes once its window is open again.
    async fn resume_paused(
        &self,
        broadcast: Broadcast,
        stats: &mut TickStats,
    ) -> Result<(), ApiError> {
        let now = Utc::now();

        if !window_open_at(&broadcast, now) {
            return Ok(());
        }

        if self.queue.has_active(broadcast.id).await? {
            stats.skipped_active_task += 1;
            debug!(broadcast_id = %broadcast.id, "Run task already pending; skipping resume");
            return Ok(());
        }

        let resumed = self
            .repo
            .transition(
                broadcast.id,
                &[BroadcastStatus::Paused],
                BroadcastStatus::Processing,
            )
            .await?;
        if !resumed {
            debug!(broadcast_id = %broadcast.id, "Lost resume race; skipping");
            return Ok(());
        }

        self.queue
            .enqueue(broadcast.tenant_id, broadcast.id, true)
            .await?;
        stats.resumed += 1;
        info!(
            broadcast_id = %broadcast.id,
            tenant_id = %broadcast.tenant_id,
            "Paused broadcast resumed"
        );
        counter!("broadcast_scheduler_resumed_total").increment(1);

        Ok(())
    }
}
