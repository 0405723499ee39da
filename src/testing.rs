//! In-memory implementations of the four store contracts.
//!
//! Useful for tests and prototyping; real deployments implement the store
//! traits over durable storage. Each store is a `Mutex<HashMap>` honoring the
//! same contract a durable implementation must: pending/due filters, counter
//! increments, `started_at` preservation, reschedule resets.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::inbox::{InboxMessage, InboxStore};
use crate::outbox::{OutboxMessage, OutboxStore};
use crate::saga::{SagaState, SagaStatus, SagaStore};
use crate::scheduled::{ScheduledMessage, ScheduledStore};

fn lock<T>(mutex: &Mutex<T>) -> anyhow::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow::anyhow!("in-memory store mutex poisoned"))
}

// =============================================================================
// Outbox
// =============================================================================

/// In-memory [`OutboxStore`].
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<HashMap<Uuid, OutboxMessage>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a row outside the trait, for assertions.
    pub fn get(&self, id: Uuid) -> Option<OutboxMessage> {
        self.rows.lock().ok()?.get(&id).cloned()
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, message: OutboxMessage) -> anyhow::Result<()> {
        lock(&self.rows)?.insert(message.id, message);
        Ok(())
    }

    async fn get_pending(
        &self,
        batch_size: usize,
        max_retries: u32,
    ) -> anyhow::Result<Vec<OutboxMessage>> {
        let now = Utc::now();
        let mut pending: Vec<OutboxMessage> = lock(&self.rows)?
            .values()
            .filter(|m| {
                m.processed_at.is_none()
                    && m.retry_count < max_retries
                    && m.next_retry_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);
        pending.truncate(batch_size);
        Ok(pending)
    }

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(&id) {
            row.processed_at = Some(Utc::now());
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(&id) {
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            row.next_retry_at = next_retry_at;
        }
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Inbox
// =============================================================================

/// In-memory [`InboxStore`].
#[derive(Default)]
pub struct InMemoryInboxStore {
    rows: Mutex<HashMap<String, InboxMessage>>,
}

impl InMemoryInboxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a row outside the trait, for assertions.
    pub fn get_row(&self, message_id: &str) -> Option<InboxMessage> {
        self.rows.lock().ok()?.get(message_id).cloned()
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn get(&self, message_id: &str) -> anyhow::Result<Option<InboxMessage>> {
        Ok(lock(&self.rows)?.get(message_id).cloned())
    }

    async fn add(&self, message: InboxMessage) -> anyhow::Result<()> {
        lock(&self.rows)?.insert(message.message_id.clone(), message);
        Ok(())
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        response: serde_json::Value,
    ) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(message_id) {
            row.processed_at = Some(Utc::now());
            row.response = Some(response);
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        message_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(message_id) {
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            row.next_retry_at = next_retry_at;
        }
        Ok(())
    }

    async fn get_expired(&self, batch_size: usize) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        let mut expired: Vec<(DateTime<Utc>, String)> = lock(&self.rows)?
            .values()
            .filter(|m| m.processed_at.is_some() && m.expires_at <= now)
            .map(|m| (m.expires_at, m.message_id.clone()))
            .collect();
        expired.sort_by_key(|(at, _)| *at);
        expired.truncate(batch_size);
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn remove(&self, message_ids: &[String]) -> anyhow::Result<()> {
        let mut rows = lock(&self.rows)?;
        for id in message_ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Saga
// =============================================================================

/// In-memory [`SagaStore`].
#[derive(Default)]
pub struct InMemorySagaStore {
    rows: Mutex<HashMap<Uuid, SagaState>>,
}

impl InMemorySagaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect an instance outside the trait, for assertions.
    pub fn get_saga(&self, id: Uuid) -> Option<SagaState> {
        self.rows.lock().ok()?.get(&id).cloned()
    }

    /// Number of instances held.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<SagaState>> {
        Ok(lock(&self.rows)?.get(&id).cloned())
    }

    async fn add(&self, saga: SagaState) -> anyhow::Result<()> {
        let mut rows = lock(&self.rows)?;
        if rows.contains_key(&saga.id) {
            anyhow::bail!("saga {} already exists", saga.id);
        }
        rows.insert(saga.id, saga);
        Ok(())
    }

    async fn update(&self, mut saga: SagaState) -> anyhow::Result<()> {
        let mut rows = lock(&self.rows)?;
        let existing = rows
            .get(&saga.id)
            .ok_or_else(|| anyhow::anyhow!("saga {} does not exist", saga.id))?;
        saga.started_at = existing.started_at;
        saga.last_updated_at = Utc::now();
        rows.insert(saga.id, saga);
        Ok(())
    }

    async fn get_stuck(
        &self,
        older_than: DateTime<Utc>,
        batch_size: usize,
    ) -> anyhow::Result<Vec<SagaState>> {
        let mut stuck: Vec<SagaState> = lock(&self.rows)?
            .values()
            .filter(|s| {
                matches!(s.status, SagaStatus::Running | SagaStatus::Compensating)
                    && s.last_updated_at < older_than
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|s| s.last_updated_at);
        stuck.truncate(batch_size);
        Ok(stuck)
    }

    async fn persist(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Scheduled
// =============================================================================

/// In-memory [`ScheduledStore`].
#[derive(Default)]
pub struct InMemoryScheduledStore {
    rows: Mutex<HashMap<Uuid, ScheduledMessage>>,
}

impl InMemoryScheduledStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a row outside the trait, for assertions.
    pub fn get(&self, id: Uuid) -> Option<ScheduledMessage> {
        self.rows.lock().ok()?.get(&id).cloned()
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ScheduledStore for InMemoryScheduledStore {
    async fn add(&self, message: ScheduledMessage) -> anyhow::Result<()> {
        lock(&self.rows)?.insert(message.id, message);
        Ok(())
    }

    async fn get_due(
        &self,
        batch_size: usize,
        max_retries: u32,
    ) -> anyhow::Result<Vec<ScheduledMessage>> {
        let now = Utc::now();
        let mut due: Vec<ScheduledMessage> = lock(&self.rows)?
            .values()
            .filter(|m| {
                // Recurrence is the completion signal for recurring rows, so
                // processed_at does not exclude them.
                (m.recurring || m.processed_at.is_none())
                    && m.scheduled_at <= now
                    && m.retry_count < max_retries
                    && m.next_retry_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|m| m.scheduled_at);
        due.truncate(batch_size);
        Ok(due)
    }

    async fn mark_processed(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(&id) {
            let now = Utc::now();
            row.processed_at = Some(now);
            row.last_executed_at = Some(now);
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(&id) {
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            row.next_retry_at = next_retry_at;
        }
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, next_time: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(row) = lock(&self.rows)?.get_mut(&id) {
            row.last_executed_at = Some(Utc::now());
            row.scheduled_at = next_time;
            row.processed_at = None;
            row.last_error = None;
            row.retry_count = 0;
            row.next_retry_at = None;
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> anyhow::Result<()> {
        lock(&self.rows)?.remove(&id);
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
