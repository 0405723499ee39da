//! Scheduled dispatch: durable one-shot and recurring requests.
//!
//! A [`ScheduledMessage`] is a serialized request plus a due time. The
//! [`ScheduledProcessor`] polls for due rows and replays them through the
//! mediator via the [`ScheduledRequestRegistry`]. One-shot rows leave the due
//! set when marked processed; recurring rows complete through `reschedule`
//! instead, which advances the due time to the next cron occurrence and
//! resets the retry state, so `processed_at` never makes a recurring row
//! ineligible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mediator::Mediator;
use crate::registry::{ScheduledRequestRegistry, WireError};
use crate::request::RequestContext;
use crate::retry::RetryPolicy;

/// One durable scheduled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    /// Row identity.
    pub id: Uuid,
    /// Type tag resolved through the [`ScheduledRequestRegistry`].
    pub request_type: String,
    /// Serialized request.
    pub payload: serde_json::Value,
    /// When the row is next due.
    pub scheduled_at: DateTime<Utc>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When a one-shot row completed. Recurring rows may carry this while
    /// still being due; `reschedule` is their completion path.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the row last dispatched successfully.
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Failed-attempt counter; reset by `reschedule`.
    pub retry_count: u32,
    /// Earliest time the next attempt may run.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Rendered error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Whether the row repeats.
    pub recurring: bool,
    /// Cron expression driving recurrence; present when `recurring`.
    /// Standard five-field form, with an optional leading seconds field
    /// (six fields total).
    pub recurrence: Option<String>,
}

impl ScheduledMessage {
    /// Build a one-shot row due at `scheduled_at`.
    pub fn new<R: Serialize>(
        request_type: impl Into<String>,
        request: &R,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Self, WireError> {
        Ok(Self {
            id: Uuid::new_v4(),
            request_type: request_type.into(),
            payload: serde_json::to_value(request)?,
            scheduled_at,
            created_at: Utc::now(),
            processed_at: None,
            last_executed_at: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            recurring: false,
            recurrence: None,
        })
    }

    /// Build a recurring row, first due at `first_at`, repeating per the
    /// cron expression.
    pub fn recurring<R: Serialize>(
        request_type: impl Into<String>,
        request: &R,
        first_at: DateTime<Utc>,
        recurrence: impl Into<String>,
    ) -> Result<Self, WireError> {
        let mut message = Self::new(request_type, request, first_at)?;
        message.recurring = true;
        message.recurrence = Some(recurrence.into());
        Ok(message)
    }
}

/// Storage contract for scheduled rows.
///
/// Due = `scheduled_at <= now`, `retry_count < max_retries`, `next_retry_at`
/// unset or due; for recurring rows, regardless of `processed_at`.
#[async_trait]
pub trait ScheduledStore: Send + Sync {
    /// Append a row.
    async fn add(&self, message: ScheduledMessage) -> anyhow::Result<()>;

    /// Fetch up to `batch_size` due rows, oldest due time first.
    async fn get_due(
        &self,
        batch_size: usize,
        max_retries: u32,
    ) -> anyhow::Result<Vec<ScheduledMessage>>;

    /// Complete a one-shot row; stamps `processed_at` and `last_executed_at`.
    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<()>;

    /// Record a failed attempt with the next retry time (`None` = terminal).
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    /// Complete one occurrence of a recurring row: stamp `last_executed_at`,
    /// clear processed/error/retry state, and advance `scheduled_at`.
    async fn reschedule(&self, id: Uuid, next_time: DateTime<Utc>) -> anyhow::Result<()>;

    /// Remove a row outright, one-shot or recurring.
    async fn cancel(&self, id: Uuid) -> anyhow::Result<()>;

    /// Flush buffered mutations.
    async fn persist(&self) -> anyhow::Result<()>;
}

/// Scheduled loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledProcessorConfig {
    /// Whether the loop runs at all.
    pub enabled: bool,
    /// Sleep between ticks.
    pub poll_interval: Duration,
    /// Maximum rows per tick.
    pub batch_size: usize,
    /// Backoff schedule for failed dispatches.
    pub retry: RetryPolicy,
}

impl Default for ScheduledProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Polling loop dispatching due scheduled requests.
pub struct ScheduledProcessor {
    store: Arc<dyn ScheduledStore>,
    mediator: Arc<Mediator>,
    registry: Arc<ScheduledRequestRegistry>,
    config: ScheduledProcessorConfig,
}

impl ScheduledProcessor {
    /// Build a processor over a store, mediator, and wire registry.
    pub fn new(
        store: Arc<dyn ScheduledStore>,
        mediator: Arc<Mediator>,
        registry: Arc<ScheduledRequestRegistry>,
        config: ScheduledProcessorConfig,
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
            info!("scheduled processor disabled, not starting");
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "scheduled processor started"
        );
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "scheduled tick failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduled processor shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Dispatch one batch of due rows.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let batch = self
            .store
            .get_due(self.config.batch_size, self.config.retry.max_retries)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(count = batch.len(), "dispatching scheduled batch");
        for message in batch {
            self.dispatch(message).await;
        }
        self.store.persist().await?;
        Ok(())
    }

    async fn dispatch(&self, message: ScheduledMessage) {
        let outcome = self.send_one(&message).await;
        // An unparseable recurrence after a successful dispatch is still a
        // failed attempt: the row must not silently stop recurring.
        let outcome = match outcome {
            Ok(()) if message.recurring => {
                match next_occurrence(message.recurrence.as_deref()) {
                    Ok(next_time) => {
                        debug!(
                            message_id = %message.id,
                            next_time = %next_time,
                            "recurring message dispatched, rescheduling"
                        );
                        if let Err(e) = self.store.reschedule(message.id, next_time).await {
                            warn!(message_id = %message.id, error = %e, "failed to reschedule recurring message");
                        }
                        return;
                    }
                    Err(error) => Err(error),
                }
            }
            other => other,
        };
        match outcome {
            Ok(()) => {
                debug!(message_id = %message.id, request_type = %message.request_type, "scheduled message dispatched");
                if let Err(e) = self.store.mark_processed(message.id).await {
                    warn!(message_id = %message.id, error = %e, "failed to mark scheduled message processed");
                }
            }
            Err(error) => {
                let attempt = message.retry_count + 1;
                let next_retry_at = self.config.retry.next_retry_at(attempt, Utc::now());
                if next_retry_at.is_none() {
                    warn!(
                        message_id = %message.id,
                        request_type = %message.request_type,
                        attempts = attempt,
                        error = %error,
                        "scheduled message exhausted its retry budget"
                    );
                }
                if let Err(e) = self
                    .store
                    .mark_failed(message.id, &error, next_retry_at)
                    .await
                {
                    warn!(message_id = %message.id, error = %e, "failed to mark scheduled message failed");
                }
            }
        }
    }

    async fn send_one(&self, message: &ScheduledMessage) -> Result<(), String> {
        let erased = self
            .registry
            .decode(&message.request_type, &message.payload)
            .map_err(|e| e.to_string())?;
        let ctx = RequestContext::new().with_message_id(message.id.to_string());
        self.mediator
            .send_erased(erased, ctx)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

fn next_occurrence(recurrence: Option<&str>) -> Result<DateTime<Utc>, String> {
    let expression = recurrence.ok_or("recurring message has no recurrence expression")?;
    let cron = Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| format!("invalid recurrence {expression:?}: {e}"))?;
    cron.find_next_occurrence(&Utc::now(), false)
        .map_err(|e| format!("no next occurrence for {expression:?}: {e}"))
}
