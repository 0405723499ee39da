//! Idempotent inbox: consumer-side dedup keyed by caller-supplied message id.
//!
//! [`InboxGuard`] sits in the interceptor chain and activates only for
//! requests registered with the idempotent capability. The first delivery of
//! a message id runs the handler and caches the **full outcome**, success or
//! failure, in the inbox row; every later delivery of the same id replays
//! that outcome verbatim without invoking the handler again. This is the
//! receiving half of at-least-once delivery: producers may redeliver freely.
//!
//! [`InboxCleanup`] is the companion sweep that deletes processed rows once
//! their retention window has passed. Pending rows are never expired away; a
//! stuck pending row surfaces as `max_retries_exceeded`, not as silence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::failure::{DispatchResult, Failure};
use crate::handler::{ErasedResponse, RequestMeta};
use crate::pipeline::{Interceptor, Invocation, Next};
use crate::request::RequestContext;

/// One inbox row tracking a message id's delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Caller-supplied idempotency key; unique per row.
    pub message_id: String,
    /// Request type name, for diagnostics.
    pub request_type: String,
    /// When the first delivery arrived.
    pub received_at: DateTime<Utc>,
    /// When processing completed; set once.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the row becomes eligible for cleanup.
    pub expires_at: DateTime<Utc>,
    /// Serialized [`CachedOutcome`]; present once processed.
    pub response: Option<serde_json::Value>,
    /// Rendered error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Failed-attempt counter; monotonic.
    pub retry_count: u32,
    /// Advisory retry schedule recorded with failures.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Correlation id of the first delivery.
    pub correlation_id: Uuid,
    /// Tenant scope of the first delivery.
    pub tenant_id: Option<String>,
    /// Acting user of the first delivery.
    pub user_id: Option<String>,
}

impl InboxMessage {
    /// Build a pending row for a first delivery.
    pub fn new(
        message_id: impl Into<String>,
        request_type: impl Into<String>,
        retention: Duration,
        ctx: &RequestContext,
    ) -> Self {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        Self {
            message_id: message_id.into(),
            request_type: request_type.into(),
            received_at: now,
            processed_at: None,
            expires_at: now + retention,
            response: None,
            last_error: None,
            retry_count: 0,
            next_retry_at: None,
            correlation_id: ctx.correlation_id,
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user_id.clone(),
        }
    }
}

/// The cached outcome of one idempotent request, replayed on duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum CachedOutcome {
    /// Serialized successful response.
    Ok(serde_json::Value),
    /// The failure the first execution produced.
    Err(Failure),
}

/// Storage contract for inbox rows.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Look a row up by message id.
    async fn get(&self, message_id: &str) -> anyhow::Result<Option<InboxMessage>>;

    /// Insert a pending row.
    async fn add(&self, message: InboxMessage) -> anyhow::Result<()>;

    /// Record completion with the serialized outcome.
    async fn mark_processed(
        &self,
        message_id: &str,
        response: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Record a failed attempt; increments `retry_count`.
    async fn mark_failed(
        &self,
        message_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    /// Message ids of processed rows past expiry, oldest-first, capped.
    async fn get_expired(&self, batch_size: usize) -> anyhow::Result<Vec<String>>;

    /// Delete rows outright.
    async fn remove(&self, message_ids: &[String]) -> anyhow::Result<()>;

    /// Flush buffered mutations.
    async fn persist(&self) -> anyhow::Result<()>;
}

/// Inbox guard configuration.
#[derive(Debug, Clone, Copy)]
pub struct InboxConfig {
    /// Delivery attempts allowed for one message id before it is rejected
    /// with `max_retries_exceeded`.
    pub max_retries: u32,
    /// How long processed rows are kept for duplicate detection.
    pub retention: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Pipeline interceptor deduplicating idempotent requests by message id.
pub struct InboxGuard {
    store: Arc<dyn InboxStore>,
    config: InboxConfig,
}

impl InboxGuard {
    /// Build a guard over a store.
    pub fn new(store: Arc<dyn InboxStore>, config: InboxConfig) -> Self {
        Self { store, config }
    }

    fn replay(
        &self,
        meta: &RequestMeta,
        row: &InboxMessage,
    ) -> DispatchResult<ErasedResponse> {
        debug!(
            message_id = %row.message_id,
            request_type = meta.type_name,
            "duplicate delivery, replaying cached outcome"
        );
        let value = row
            .response
            .as_ref()
            .ok_or_else(|| Failure::internal("processed inbox row has no cached outcome"))?;
        let outcome: CachedOutcome =
            serde_json::from_value(value.clone()).map_err(Failure::serialization)?;
        match outcome {
            CachedOutcome::Ok(response) => {
                let codec = meta
                    .response_codec
                    .ok_or_else(|| Failure::internal("idempotent request has no response codec"))?;
                codec.decode(&response)
            }
            CachedOutcome::Err(failure) => Err(failure),
        }
    }

    /// Cache the outcome and hand it back to the caller.
    ///
    /// Takes the result by value: the outcome is encoded synchronously
    /// before any store call, so no borrow of the erased response is held
    /// across an await.
    async fn record(
        &self,
        meta: &RequestMeta,
        message_id: &str,
        result: DispatchResult<ErasedResponse>,
    ) -> DispatchResult<ErasedResponse> {
        let outcome = match encode_outcome(meta, &result) {
            Ok(outcome) => outcome,
            Err(failure) => {
                // The handler succeeded but its response cannot be cached;
                // the row stays pending so a redelivery can try again.
                let _ = self
                    .store
                    .mark_failed(message_id, &failure.to_string(), None)
                    .await;
                return Err(failure);
            }
        };
        let value = serde_json::to_value(&outcome).map_err(Failure::serialization)?;
        self.store
            .mark_processed(message_id, value)
            .await
            .map_err(|e| Failure::unavailable(format!("inbox mark_processed: {e:#}")))?;
        result
    }
}

fn encode_outcome(
    meta: &RequestMeta,
    result: &DispatchResult<ErasedResponse>,
) -> DispatchResult<CachedOutcome> {
    match result {
        Ok(response) => {
            let codec = meta
                .response_codec
                .ok_or_else(|| Failure::internal("idempotent request has no response codec"))?;
            Ok(CachedOutcome::Ok(codec.encode(response.as_ref())?))
        }
        Err(failure) => Ok(CachedOutcome::Err(failure.clone())),
    }
}

#[async_trait]
impl Interceptor for InboxGuard {
    async fn intercept(
        &self,
        invocation: Invocation,
        next: Next<'_>,
    ) -> DispatchResult<ErasedResponse> {
        if !invocation.meta.capabilities.idempotent {
            return next.run(invocation).await;
        }
        let meta = Arc::clone(&invocation.meta);
        let Some(message_id) = invocation.ctx.message_id.clone() else {
            return Err(Failure::missing_message_id(meta.type_name));
        };

        let existing = self
            .store
            .get(&message_id)
            .await
            .map_err(|e| Failure::unavailable(e))?;
        match existing {
            None => {
                let row = InboxMessage::new(
                    &message_id,
                    meta.type_name,
                    self.config.retention,
                    &invocation.ctx,
                );
                self.store.add(row).await.map_err(|e| Failure::unavailable(e))?;
            }
            Some(row) if row.processed_at.is_some() => {
                return self.replay(&meta, &row);
            }
            Some(row) if row.retry_count >= self.config.max_retries => {
                warn!(
                    message_id = %message_id,
                    request_type = meta.type_name,
                    retry_count = row.retry_count,
                    "message rejected, retry budget exhausted"
                );
                return Err(Failure::max_retries_exceeded(
                    &message_id,
                    self.config.max_retries,
                ));
            }
            Some(_) => {
                // A pending row means an earlier delivery started but never
                // completed; count it as a failed attempt and run again.
                self.store
                    .mark_failed(&message_id, "redelivered before completion", None)
                    .await
                    .map_err(|e| Failure::unavailable(e))?;
            }
        }

        let result = next.run(invocation).await;
        self.record(&meta, &message_id, result).await
    }
}

/// Inbox cleanup loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct InboxCleanupConfig {
    /// Whether the sweep runs at all.
    pub enabled: bool,
    /// Sleep between sweeps.
    pub cleanup_interval: Duration,
    /// Maximum rows removed per sweep.
    pub batch_size: usize,
}

impl Default for InboxCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval: Duration::from_secs(60 * 60),
            batch_size: 100,
        }
    }
}

/// Background sweep deleting processed rows past their retention window.
pub struct InboxCleanup {
    store: Arc<dyn InboxStore>,
    config: InboxCleanupConfig,
}

impl InboxCleanup {
    /// Build a sweep over a store.
    pub fn new(store: Arc<dyn InboxStore>, config: InboxCleanupConfig) -> Self {
        Self { store, config }
    }

    /// Run until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("inbox cleanup disabled, not starting");
            return;
        }
        info!(
            cleanup_interval_s = self.config.cleanup_interval.as_secs(),
            batch_size = self.config.batch_size,
            "inbox cleanup started"
        );
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "inbox cleanup sweep failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("inbox cleanup shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.cleanup_interval) => {}
            }
        }
    }

    /// Remove one batch of expired processed rows.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let expired = self.store.get_expired(self.config.batch_size).await?;
        if expired.is_empty() {
            return Ok(());
        }
        debug!(count = expired.len(), "removing expired inbox rows");
        self.store.remove(&expired).await?;
        self.store.persist().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestHandler;
    use crate::mediator::Mediator;
    use crate::registry::HandlerRegistry;
    use crate::request::Request;
    use crate::testing::InMemoryInboxStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Charge {
        amount: i64,
    }

    impl Request for Charge {
        type Response = String;
    }

    struct ChargeHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl RequestHandler<Charge> for ChargeHandler {
        async fn handle(&self, request: Charge, _ctx: &RequestContext) -> DispatchResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Failure::validation("amount rejected"))
            } else {
                Ok(format!("receipt-{}", request.amount))
            }
        }
    }

    fn guarded_mediator(
        fail: bool,
        calls: Arc<AtomicUsize>,
        store: Arc<InMemoryInboxStore>,
    ) -> Mediator {
        let registry = HandlerRegistry::builder()
            .module("billing", move |m| {
                m.interceptor(InboxGuard::new(store, InboxConfig::default()));
                m.idempotent_command::<Charge, _>(ChargeHandler { calls, fail });
            })
            .build();
        Mediator::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_duplicate_delivery_replays_without_rerunning() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryInboxStore::new());
        let mediator = guarded_mediator(false, Arc::clone(&calls), store);

        let ctx = RequestContext::new().with_message_id("msg-1");
        let first = mediator
            .send_with(Charge { amount: 100 }, ctx.clone())
            .await
            .unwrap();
        let second = mediator
            .send_with(Charge { amount: 100 }, ctx)
            .await
            .unwrap();

        assert_eq!(first, "receipt-100");
        assert_eq!(second, "receipt-100");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guarded_dispatch_is_spawnable() {
        // The whole guarded dispatch, erased response included, must stay a
        // Send future so callers can run it on a spawned task.
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryInboxStore::new());
        let mediator = Arc::new(guarded_mediator(false, Arc::clone(&calls), store));

        let handle = tokio::spawn({
            let mediator = Arc::clone(&mediator);
            async move {
                let ctx = RequestContext::new().with_message_id("msg-spawned");
                mediator.send_with(Charge { amount: 3 }, ctx).await
            }
        });

        assert_eq!(handle.await.unwrap().unwrap(), "receipt-3");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_failure_is_replayed_verbatim() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryInboxStore::new());
        let mediator = guarded_mediator(true, Arc::clone(&calls), store);

        let ctx = RequestContext::new().with_message_id("msg-2");
        let first = mediator
            .send_with(Charge { amount: 1 }, ctx.clone())
            .await
            .unwrap_err();
        let second = mediator
            .send_with(Charge { amount: 1 }, ctx)
            .await
            .unwrap_err();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_message_id_is_rejected_before_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryInboxStore::new());
        let mediator = guarded_mediator(false, Arc::clone(&calls), store);

        let failure = mediator.send(Charge { amount: 5 }).await.unwrap_err();
        assert_eq!(failure.code, crate::failure::FailureCode::MissingMessageId);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pending_row_at_retry_limit_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryInboxStore::new());
        let mediator = guarded_mediator(false, Arc::clone(&calls), Arc::clone(&store));

        let ctx = RequestContext::new().with_message_id("msg-3");
        let mut row = InboxMessage::new("msg-3", "Charge", Duration::from_secs(60), &ctx);
        row.retry_count = 3;
        store.add(row).await.unwrap();

        let failure = mediator
            .send_with(Charge { amount: 9 }, ctx)
            .await
            .unwrap_err();
        assert_eq!(failure.code, crate::failure::FailureCode::MaxRetriesExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redelivery_of_pending_row_bumps_retry_and_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryInboxStore::new());
        let mediator = guarded_mediator(false, Arc::clone(&calls), Arc::clone(&store));

        let ctx = RequestContext::new().with_message_id("msg-4");
        // Simulate a delivery that started but never completed.
        store
            .add(InboxMessage::new(
                "msg-4",
                "Charge",
                Duration::from_secs(60),
                &ctx,
            ))
            .await
            .unwrap();

        let response = mediator
            .send_with(Charge { amount: 2 }, ctx)
            .await
            .unwrap();
        assert_eq!(response, "receipt-2");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let row = store.get_row("msg-4").unwrap();
        assert_eq!(row.retry_count, 1);
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_non_idempotent_requests_bypass_the_guard() {
        #[derive(Debug)]
        struct Plain;

        impl Request for Plain {
            type Response = ();
        }

        struct PlainHandler;

        #[async_trait]
        impl RequestHandler<Plain> for PlainHandler {
            async fn handle(&self, _request: Plain, _ctx: &RequestContext) -> DispatchResult<()> {
                Ok(())
            }
        }

        let store = Arc::new(InMemoryInboxStore::new());
        let registry = HandlerRegistry::builder()
            .module("misc", {
                let store = Arc::clone(&store);
                move |m| {
                    m.interceptor(InboxGuard::new(store, InboxConfig::default()));
                    m.command::<Plain, _>(PlainHandler);
                }
            })
            .build();
        let mediator = Mediator::new(Arc::new(registry));

        // No message id, yet this succeeds: the guard never activates.
        mediator.send(Plain).await.unwrap();
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_processed_rows() {
        let store = Arc::new(InMemoryInboxStore::new());
        let ctx = RequestContext::new();

        let mut expired = InboxMessage::new("old", "Charge", Duration::from_secs(60), &ctx);
        expired.processed_at = Some(Utc::now() - chrono::Duration::days(10));
        expired.expires_at = Utc::now() - chrono::Duration::days(3);
        store.add(expired).await.unwrap();

        let mut pending_past_expiry =
            InboxMessage::new("pending", "Charge", Duration::from_secs(60), &ctx);
        pending_past_expiry.expires_at = Utc::now() - chrono::Duration::days(3);
        store.add(pending_past_expiry).await.unwrap();

        let fresh = InboxMessage::new("fresh", "Charge", Duration::from_secs(3600), &ctx);
        store.add(fresh).await.unwrap();

        let cleanup = InboxCleanup::new(Arc::clone(&store) as Arc<dyn InboxStore>, InboxCleanupConfig::default());
        cleanup.tick().await.unwrap();

        assert!(store.get_row("old").is_none());
        // Pending rows are never expired away.
        assert!(store.get_row("pending").is_some());
        assert!(store.get_row("fresh").is_some());
    }
}
