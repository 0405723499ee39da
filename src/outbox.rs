//! Transactional outbox: durable notification rows published by a polling
//! loop.
//!
//! Handlers append notifications to the outbox inside the same transaction as
//! their state change; the [`OutboxProcessor`] later resolves each row through
//! a [`NotificationRegistry`] and fans it out with `publish`. The guarantee is
//! at-least-once: a crash between publish and `mark_processed` redelivers, and
//! running several processor instances is safe because store mutations may be
//! zero-effect when another instance already won the row.
//!
//! Rows are never deleted and `processed_at` is never cleared; the table is
//! the audit trail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mediator::Mediator;
use crate::registry::{NotificationRegistry, WireError};
use crate::request::RequestContext;
use crate::retry::RetryPolicy;

/// One durable notification awaiting publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Row identity.
    pub id: Uuid,
    /// Type tag resolved through the [`NotificationRegistry`].
    pub notification_type: String,
    /// Serialized notification.
    pub payload: serde_json::Value,
    /// When the row was appended.
    pub created_at: DateTime<Utc>,
    /// When publication succeeded; set once, never cleared.
    pub processed_at: Option<DateTime<Utc>>,
    /// Rendered error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Failed-attempt counter; monotonic.
    pub retry_count: u32,
    /// Earliest time the next attempt may run; `None` means immediately
    /// eligible (or terminal, when the retry budget is exhausted).
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Build a row from a typed notification.
    pub fn new<N: Serialize>(
        notification_type: impl Into<String>,
        notification: &N,
    ) -> Result<Self, WireError> {
        Ok(Self {
            id: Uuid::new_v4(),
            notification_type: notification_type.into(),
            payload: serde_json::to_value(notification)?,
            created_at: Utc::now(),
            processed_at: None,
            last_error: None,
            retry_count: 0,
            next_retry_at: None,
        })
    }
}

/// Storage contract for outbox rows.
///
/// Pending = unprocessed, `retry_count < max_retries`, and `next_retry_at`
/// unset or due; returned oldest-first. `mark_failed` increments the retry
/// counter and records the schedule it is given; the policy math lives in the
/// loop, not the store.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a row.
    async fn add(&self, message: OutboxMessage) -> anyhow::Result<()>;

    /// Fetch up to `batch_size` rows eligible for publication.
    async fn get_pending(
        &self,
        batch_size: usize,
        max_retries: u32,
    ) -> anyhow::Result<Vec<OutboxMessage>>;

    /// Record successful publication; may be zero-effect if another instance
    /// already did.
    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<()>;

    /// Record a failed attempt with the next retry time (`None` = terminal).
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    /// Flush buffered mutations.
    async fn persist(&self) -> anyhow::Result<()>;
}

/// Outbox loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct OutboxProcessorConfig {
    /// Whether the loop runs at all.
    pub enabled: bool,
    /// Sleep between ticks.
    pub poll_interval: Duration,
    /// Maximum rows per tick.
    pub batch_size: usize,
    /// Backoff schedule for failed publications.
    pub retry: RetryPolicy,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Polling loop publishing pending outbox rows.
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    mediator: Arc<Mediator>,
    registry: Arc<NotificationRegistry>,
    config: OutboxProcessorConfig,
}

impl OutboxProcessor {
    /// Build a processor over a store, mediator, and wire registry.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        mediator: Arc<Mediator>,
        registry: Arc<NotificationRegistry>,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self {
            store,
            mediator,
            registry,
            config,
        }
    }

    /// Run until the token is cancelled.
    ///
    /// Cancellation is observed at the sleep boundary; an in-flight batch
    /// always completes its store mutations before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("outbox processor disabled, not starting");
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox processor started"
        );
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "outbox tick failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("outbox processor shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Publish one batch of pending rows.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let batch = self
            .store
            .get_pending(self.config.batch_size, self.config.retry.max_retries)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(count = batch.len(), "publishing outbox batch");
        for message in batch {
            self.deliver(message).await;
        }
        self.store.persist().await?;
        Ok(())
    }

    async fn deliver(&self, message: OutboxMessage) {
        match self.publish_one(&message).await {
            Ok(()) => {
                debug!(
                    message_id = %message.id,
                    notification_type = %message.notification_type,
                    "outbox message published"
                );
                if let Err(e) = self.store.mark_processed(message.id).await {
                    warn!(message_id = %message.id, error = %e, "failed to mark outbox message processed");
                }
            }
            Err(error) => {
                let attempt = message.retry_count + 1;
                let next_retry_at = self.config.retry.next_retry_at(attempt, Utc::now());
                if next_retry_at.is_none() {
                    warn!(
                        message_id = %message.id,
                        notification_type = %message.notification_type,
                        attempts = attempt,
                        error = %error,
                        "outbox message exhausted its retry budget"
                    );
                } else {
                    debug!(
                        message_id = %message.id,
                        attempt,
                        error = %error,
                        "outbox publication failed, scheduling retry"
                    );
                }
                if let Err(e) = self
                    .store
                    .mark_failed(message.id, &error, next_retry_at)
                    .await
                {
                    warn!(message_id = %message.id, error = %e, "failed to mark outbox message failed");
                }
            }
        }
    }

    /// Unknown tags, bad payloads, and publish failures are all the same
    /// thing to the loop: a failed attempt.
    async fn publish_one(&self, message: &OutboxMessage) -> Result<(), String> {
        let erased = self
            .registry
            .decode(&message.notification_type, &message.payload)
            .map_err(|e| e.to_string())?;
        let ctx = RequestContext::new().with_message_id(message.id.to_string());
        self.mediator
            .publish_erased(erased, ctx)
            .await
            .map_err(|e| e.to_string())
    }
}
