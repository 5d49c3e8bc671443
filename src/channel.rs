//! Channel sender contract
//!
//! Defines the interface the engine uses to deliver one templated message
//! through an external messaging provider, the credential resolution seam,
//! and the structured send-error taxonomy that drives retry classification.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Routing and template reference for one outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTarget {
    /// Provider account routing id
    pub account_id: String,
    /// Sender routing id
    pub sender_id: String,
    /// Recipient channel address
    pub address: String,
}

/// Template reference resolved against the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRef {
    pub name: String,
    pub language: String,
    pub components: Option<JsonValue>,
}

/// Outbound credential resolved per tenant/account.
#[derive(Debug, Clone)]
pub struct ChannelCredential {
    pub token: String,
}

/// Successful send outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    /// Provider-assigned message id
    pub message_id: String,
}

/// Classification of a failed send attempt. Transient and rate-limited
/// errors are retried by the backoff controller; permanent errors
/// short-circuit the remaining attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendErrorKind {
    /// Retryable failure (network error, provider timeout)
    Transient,
    /// Provider throttling with optional retry hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Non-retryable failure (malformed recipient, rejected template)
    Permanent,
}

/// Structured error raised by a [`ChannelSender`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendError {
    #[serde(flatten)]
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rate_limited<S: Into<String>>(retry_after_secs: Option<u64>, message: S) -> Self {
        Self {
            kind: SendErrorKind::RateLimited { retry_after_secs },
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SendErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the backoff controller should attempt this send again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, SendErrorKind::Permanent)
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SendErrorKind::Transient => write!(f, "transient send error: {}", self.message),
            SendErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "rate limited: {}", self.message)?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
                Ok(())
            }
            SendErrorKind::Permanent => write!(f, "permanent send error: {}", self.message),
        }
    }
}

impl std::error::Error for SendError {}

/// Sends one templated message and returns the provider message id.
///
/// Implementations wrap a concrete provider API; the engine only depends on
/// this seam and on the [`SendError`] classification.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        target: &MessageTarget,
        template: &TemplateRef,
        variables: &BTreeMap<String, String>,
        credential: &ChannelCredential,
    ) -> Result<SendReceipt, SendError>;
}

/// Resolves the outbound credential for a tenant/account pair.
///
/// Resolution failure is a fatal setup error: the broadcast transitions to
/// failed without touching any contact.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(
        &self,
        tenant_id: Uuid,
        account_id: &str,
    ) -> Result<ChannelCredential, SendError>;
}

/// Credential resolver backed by a single configured token, used when the
/// deployment serves one provider account.
pub struct StaticCredentialResolver {
    token: Option<String>,
}

impl StaticCredentialResolver {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(
        &self,
        _tenant_id: Uuid,
        account_id: &str,
    ) -> Result<ChannelCredential, SendError> {
        match &self.token {
            Some(token) => Ok(ChannelCredential {
                token: token.clone(),
            }),
            None => Err(SendError::permanent(format!(
                "no outbound credential configured for account {}",
                account_id
            ))),
        }
    }
}

/// Sender that logs each message instead of delivering it. Used when no
/// provider integration is wired, so the engine can be exercised end to
/// end without outbound traffic.
pub struct DryRunSender;

#[async_trait]
impl ChannelSender for DryRunSender {
    async fn send(
        &self,
        target: &MessageTarget,
        template: &TemplateRef,
        _variables: &BTreeMap<String, String>,
        _credential: &ChannelCredential,
    ) -> Result<SendReceipt, SendError> {
        let message_id = format!("dry-run-{}", Uuid::new_v4());
        tracing::info!(
            address = %target.address,
            sender_id = %target.sender_id,
            template = %template.name,
            message_id = %message_id,
            "Dry-run send"
        );
        Ok(SendReceipt { message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SendError::transient("timeout").is_retryable());
        assert!(SendError::rate_limited(Some(30), "throttled").is_retryable());
        assert!(!SendError::permanent("bad address").is_retryable());
    }

    #[test]
    fn send_error_serializes_with_kind_tag() {
        let error = SendError::rate_limited(Some(60), "slow down");
        let json = serde_json::to_value(&error).expect("serialize");
        assert_eq!(json["type"], "rate_limited");
        assert_eq!(json["retry_after_secs"], 60);
        assert_eq!(json["message"], "slow down");
    }

    #[tokio::test]
    async fn static_resolver_requires_a_token() {
        let resolver = StaticCredentialResolver::new(None);
        let err = resolver
            .resolve(Uuid::new_v4(), "acct-1")
            .await
            .expect_err("missing token must fail");
        assert!(!err.is_retryable());

        let resolver = StaticCredentialResolver::new(Some("secret".to_string()));
        let credential = resolver
            .resolve(Uuid::new_v4(), "acct-1")
            .await
            .expect("token resolves");
        assert_eq!(credential.token, "secret");
    }
}
