//! # Broadcast Runner
//!
//! Executes one broadcast's dispatch loop: walk the contact list from the
//! checkpoint, gate each send on a fresh status read, the delivery window
//! and the dedup ledger, deliver with bounded backoff, and checkpoint
//! progress so a crashed or interrupted run resumes where it left off.
//! The loop is idempotent over already-settled contacts, which is what
//! makes at-least-once task delivery safe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, instrument, warn};

use crate::backoff::{BackoffPolicy, send_with_backoff};
use crate::channel::{ChannelSender, CredentialResolver, MessageTarget, TemplateRef};
use crate::config::DispatchConfig;
use crate::error::ApiError;
use crate::models::broadcast::{BroadcastStatus, Model as Broadcast};
use crate::models::contact::{Contact, ContactStatus, SyncStatus, count_with_status};
use crate::queue::RunTask;
use crate::repositories::{BroadcastRepository, DedupLedger};
use crate::sync_notifier::SyncNotifier;
use crate::window::window_open_at;

/// Fleet-wide send pacer. Each send reserves the next slot under a mutex,
/// so concurrent runners collectively never exceed the configured rate.
pub struct SendGate {
    min_gap: Duration,
    next_slot: Mutex<Instant>,
}

impl SendGate {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for the next send slot and reserve the one after it.
    pub async fn acquire(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            sleep_until(*next).await;
        }
        *next = (*next).max(now) + self.min_gap;
    }
}

/// Terminal disposition of one run-task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every contact settled; broadcast moved to completed
    Completed,
    /// Run yielded to a pause (operator request or closed window)
    Paused,
    /// Run stopped because the broadcast was cancelled
    Cancelled,
    /// Fatal setup error; broadcast moved to failed
    Failed,
    /// Nothing to do (missing broadcast or stale task)
    Skipped,
}

/// Runs one broadcast's dispatch loop against its collaborators.
#[derive(Clone)]
pub struct BroadcastRunner {
    repo: BroadcastRepository,
    ledger: DedupLedger,
    sender: Arc<dyn ChannelSender>,
    credentials: Arc<dyn CredentialResolver>,
    notifier: Arc<dyn SyncNotifier>,
    gate: Option<Arc<SendGate>>,
    dispatch: DispatchConfig,
    backoff: BackoffPolicy,
}

impl BroadcastRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: BroadcastRepository,
        ledger: DedupLedger,
        sender: Arc<dyn ChannelSender>,
        credentials: Arc<dyn CredentialResolver>,
        notifier: Arc<dyn SyncNotifier>,
        gate: Option<Arc<SendGate>>,
        dispatch: DispatchConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            repo,
            ledger,
            sender,
            credentials,
            notifier,
            gate,
            dispatch,
            backoff,
        }
    }

    /// Execute one claimed run task to a terminal disposition.
    #[instrument(skip(self), fields(broadcast_id = %task.broadcast_id, tenant_id = %task.tenant_id, resume = task.resume))]
    pub async fn run(&self, task: &RunTask) -> Result<RunOutcome, ApiError> {
        let Some(broadcast) = self.repo.find_by_id(task.broadcast_id).await? else {
            warn!("Run task references a missing broadcast; dropping");
            return Ok(RunOutcome::Skipped);
        };

        // Only a broadcast the lifecycle layer moved to processing may run;
        // anything else means a cancel/pause won between enqueue and claim.
        if BroadcastStatus::parse(&broadcast.status) != Some(BroadcastStatus::Processing) {
            debug!(status = %broadcast.status, "Broadcast not in processing; dropping stale task");
            return Ok(RunOutcome::Skipped);
        }

        let credential = match self
            .credentials
            .resolve(broadcast.tenant_id, &broadcast.account_id)
            .await
        {
            Ok(credential) => credential,
            Err(err) => {
                warn!(error = %err, "Credential resolution failed; failing broadcast");
                self.repo
                    .mark_failed(broadcast.id, &format!("credential resolution failed: {}", err))
                    .await?;
                counter!("broadcast_runs_failed_total").increment(1);
                return Ok(RunOutcome::Failed);
            }
        };

        let mut contacts: Vec<Contact> = match serde_json::from_value(broadcast.contacts.clone()) {
            Ok(contacts) => contacts,
            Err(err) => {
                warn!(error = %err, "Contact list is unreadable; failing broadcast");
                self.repo
                    .mark_failed(broadcast.id, &format!("unreadable contact list: {}", err))
                    .await?;
                counter!("broadcast_runs_failed_total").increment(1);
                return Ok(RunOutcome::Failed);
            }
        };

        let template = TemplateRef {
            name: broadcast.template_name.clone(),
            language: broadcast.template_language.clone(),
            components: broadcast.template_components.clone(),
        };

        let start = broadcast.current_index.max(0) as usize;
        let mut index = start;
        let mut processed_since_checkpoint = 0usize;

        info!(
            total = contacts.len(),
            start_index = start,
            "Broadcast run starting"
        );

        while index < contacts.len() {
            if contacts[index].is_settled() {
                index += 1;
                continue;
            }

            // Fresh status read so cancels and pauses take effect between
            // contacts, not just between tasks.
            match self.repo.current_status(broadcast.id).await? {
                Some(BroadcastStatus::Processing) => {}
                Some(BroadcastStatus::Cancelled) => {
                    self.checkpoint(&broadcast, &contacts, index).await?;
                    info!(index, "Broadcast cancelled mid-run");
                    return Ok(RunOutcome::Cancelled);
                }
                Some(BroadcastStatus::Paused) => {
                    self.checkpoint(&broadcast, &contacts, index).await?;
                    info!(index, "Broadcast paused mid-run");
                    return Ok(RunOutcome::Paused);
                }
                other => {
                    self.checkpoint(&broadcast, &contacts, index).await?;
                    warn!(status = ?other, index, "Broadcast left processing; yielding");
                    return Ok(RunOutcome::Skipped);
                }
            }

            // Window re-check per contact: long runs outlive the window
            if !window_open_at(&broadcast, Utc::now()) {
                self.checkpoint(&broadcast, &contacts, index).await?;
                let paused = self
                    .repo
                    .transition(
                        broadcast.id,
                        &[BroadcastStatus::Processing],
                        BroadcastStatus::Paused,
                    )
                    .await?;
                info!(index, paused, "Delivery window closed; pausing run");
                counter!("broadcast_runs_window_paused_total").increment(1);
                return Ok(RunOutcome::Paused);
            }

            if broadcast.enable_deduplication
                && self
                    .ledger
                    .exists(
                        broadcast.tenant_id,
                        &broadcast.name,
                        &contacts[index].address,
                    )
                    .await?
            {
                contacts[index].status = ContactStatus::Skipped;
                debug!(address = %contacts[index].address, "Recipient already served; skipping");
                counter!("broadcast_contacts_skipped_total").increment(1);
                index += 1;
                processed_since_checkpoint += 1;
                if processed_since_checkpoint >= self.dispatch.checkpoint_interval {
                    self.checkpoint(&broadcast, &contacts, index).await?;
                    processed_since_checkpoint = 0;
                }
                continue;
            }

            if let Some(gate) = &self.gate {
                gate.acquire().await;
            }

            let target = MessageTarget {
                account_id: broadcast.account_id.clone(),
                sender_id: broadcast.sender_id.clone(),
                address: contacts[index].address.clone(),
            };
            let variables = template_variables(&contacts[index]);

            let result = send_with_backoff(&self.backoff, || {
                self.sender
                    .send(&target, &template, &variables, &credential)
            })
            .await;

            let now = Utc::now();
            match result {
                Ok(receipt) => {
                    contacts[index].status = ContactStatus::Sent;
                    contacts[index].message_id = Some(receipt.message_id);
                    contacts[index].sent_at = Some(now);
                    contacts[index].error = None;
                    counter!("broadcast_contacts_sent_total").increment(1);

                    if broadcast.enable_deduplication {
                        // A lost ledger write only risks one duplicate later;
                        // it must not abort the run.
                        if let Err(err) = self
                            .ledger
                            .record(broadcast.tenant_id, &broadcast.name, &target.address)
                            .await
                        {
                            warn!(error = %err, address = %target.address, "Failed to record dedup entry");
                        }
                    }

                    if broadcast.sync_integration_id.is_some() {
                        match self
                            .notifier
                            .notify(broadcast.tenant_id, &target.address, &template.name)
                            .await
                        {
                            Ok(()) => contacts[index].sync_status = Some(SyncStatus::Synced),
                            Err(err) => {
                                warn!(error = %err, address = %target.address, "Downstream sync notification failed");
                                contacts[index].sync_status = Some(SyncStatus::Error);
                            }
                        }
                    }
                }
                Err(err) => {
                    contacts[index].status = ContactStatus::Failed;
                    contacts[index].error = Some(err.to_string());
                    contacts[index].sent_at = Some(now);
                    warn!(address = %target.address, error = %err, "Contact delivery failed");
                    counter!("broadcast_contacts_failed_total").increment(1);
                }
            }

            index += 1;
            processed_since_checkpoint += 1;

            if processed_since_checkpoint >= self.dispatch.checkpoint_interval {
                self.checkpoint(&broadcast, &contacts, index).await?;
                processed_since_checkpoint = 0;
            }

            if index < contacts.len() {
                self.inter_message_delay().await;
            }
        }

        // Final checkpoint then finalize. Losing the completion CAS means a
        // concurrent cancel arrived after the last send; the row keeps that.
        self.checkpoint(&broadcast, &contacts, contacts.len()).await?;

        let completed = self
            .repo
            .transition(
                broadcast.id,
                &[BroadcastStatus::Processing],
                BroadcastStatus::Completed,
            )
            .await?;

        if !completed {
            let status = self.repo.current_status(broadcast.id).await?;
            warn!(status = ?status, "Completion lost a transition race");
            return Ok(match status {
                Some(BroadcastStatus::Cancelled) => RunOutcome::Cancelled,
                Some(BroadcastStatus::Paused) => RunOutcome::Paused,
                _ => RunOutcome::Skipped,
            });
        }

        info!(
            sent = count_with_status(&contacts, ContactStatus::Sent),
            failed = count_with_status(&contacts, ContactStatus::Failed),
            skipped = count_with_status(&contacts, ContactStatus::Skipped),
            "Broadcast run completed"
        );
        counter!("broadcast_runs_completed_total").increment(1);

        Ok(RunOutcome::Completed)
    }

    async fn checkpoint(
        &self,
        broadcast: &Broadcast,
        contacts: &[Contact],
        current_index: usize,
    ) -> Result<(), ApiError> {
        self.repo
            .write_checkpoint(
                broadcast.id,
                contacts,
                current_index as i32,
                count_with_status(contacts, ContactStatus::Sent),
                count_with_status(contacts, ContactStatus::Failed),
            )
            .await
    }

    async fn inter_message_delay(&self) {
        let jitter = if self.dispatch.message_delay_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.dispatch.message_delay_jitter_ms)
        } else {
            0
        };
        let total = self.dispatch.message_delay_ms + jitter;
        if total > 0 {
            sleep(Duration::from_millis(total)).await;
        }
    }
}

/// Template variables for one contact: the extra row fields plus the
/// contact's name under the reserved `name` key.
fn template_variables(contact: &Contact) -> BTreeMap<String, String> {
    let mut variables = contact.fields.clone();
    variables.insert("name".to_string(), contact.name.clone());
    variables
}
