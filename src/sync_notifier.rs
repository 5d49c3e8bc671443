//! External sync notifier contract
//!
//! Best-effort mirroring of a sent message into a third-party conversation
//! log. Failures are logged by the caller and never affect contact or
//! broadcast state.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Error raised by a sync notifier; always swallowed by the engine.
#[derive(Debug, Error)]
#[error("sync notification failed: {message}")]
pub struct NotifyError {
    pub message: String,
}

impl NotifyError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Mirrors one sent message into an external conversation log.
#[async_trait]
pub trait SyncNotifier: Send + Sync {
    async fn notify(
        &self,
        tenant_id: Uuid,
        recipient: &str,
        rendered_content: &str,
    ) -> Result<(), NotifyError>;
}

/// No-op notifier used when no downstream integration is configured.
pub struct NoopSyncNotifier;

#[async_trait]
impl SyncNotifier for NoopSyncNotifier {
    async fn notify(
        &self,
        _tenant_id: Uuid,
        _recipient: &str,
        _rendered_content: &str,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}
