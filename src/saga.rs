//! Durable saga state: long-running multi-step processes that survive
//! restarts.
//!
//! The crate stores and validates saga *state*; it does not orchestrate
//! steps. Orchestration lives in handlers, which load the saga, advance it,
//! and write it back. The status graph is enforced here so an illegal jump
//! (completing a saga twice, compensating a compensated one) surfaces as a
//! `Conflict` failure at the call site that attempted it.
//!
//! ```text
//! Running ──► Completed
//!    │
//!    ├─────► Failed
//!    │
//!    └─────► Compensating ──► Compensated
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::failure::{DispatchResult, Failure};

/// Lifecycle status of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Forward path in progress.
    Running,
    /// Terminal: every step succeeded.
    Completed,
    /// Terminal: gave up without compensation.
    Failed,
    /// Undo path in progress.
    Compensating,
    /// Terminal: undo path finished.
    Compensated,
}

impl SagaStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensated
        )
    }

    /// Whether `self → to` is a legal edge of the status graph.
    pub fn can_transition_to(self, to: SagaStatus) -> bool {
        matches!(
            (self, to),
            (
                SagaStatus::Running,
                SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensating
            ) | (SagaStatus::Compensating, SagaStatus::Compensated)
        )
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        };
        f.write_str(s)
    }
}

/// Durable state of one saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState {
    /// Instance identity.
    pub id: Uuid,
    /// Which saga definition this instance belongs to.
    pub saga_type: String,
    /// Opaque application state blob.
    pub state: serde_json::Value,
    /// Current lifecycle status.
    pub status: SagaStatus,
    /// Forward-path step counter; monotonic.
    pub current_step: u32,
    /// When the instance was created; immutable thereafter.
    pub started_at: DateTime<Utc>,
    /// Bumped on every mutation; the staleness signal for recovery.
    pub last_updated_at: DateTime<Utc>,
    /// Stamped when a terminal status is entered.
    pub completed_at: Option<DateTime<Utc>>,
    /// Rendered error that drove a `Failed`/`Compensating` transition.
    pub error: Option<String>,
}

impl SagaState {
    /// Start a new saga in `Running` at step 0.
    pub fn new(saga_type: impl Into<String>, state: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            state,
            status: SagaStatus::Running,
            current_step: 0,
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Move to a new status, validating the graph.
    ///
    /// Terminal statuses stamp `completed_at`; every transition bumps
    /// `last_updated_at`. An illegal edge is a `Conflict` failure and leaves
    /// the state untouched.
    pub fn transition(&mut self, to: SagaStatus) -> DispatchResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(Failure::conflict(format!(
                "illegal saga transition {} -> {} (saga {})",
                self.status, to, self.id
            )));
        }
        debug!(saga_id = %self.id, from = %self.status, to = %to, "saga transition");
        self.status = to;
        self.touch();
        if to.is_terminal() {
            self.completed_at = Some(self.last_updated_at);
        }
        Ok(())
    }

    /// Record the error that is driving a failure or compensation.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Advance the forward-path step counter.
    ///
    /// Only legal while `Running`; the counter never moves during
    /// compensation or after a terminal status.
    pub fn advance_step(&mut self) -> DispatchResult<u32> {
        if self.status != SagaStatus::Running {
            return Err(Failure::conflict(format!(
                "cannot advance step while {} (saga {})",
                self.status, self.id
            )));
        }
        self.current_step += 1;
        self.touch();
        Ok(self.current_step)
    }

    /// Replace the application state blob.
    pub fn set_state(&mut self, state: serde_json::Value) {
        self.state = state;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Storage contract for saga state.
///
/// `update` must preserve `started_at` and bump `last_updated_at` even if the
/// caller forgot to; staleness detection depends on it.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Load an instance.
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<SagaState>>;

    /// Insert a new instance.
    async fn add(&self, saga: SagaState) -> anyhow::Result<()>;

    /// Overwrite an existing instance.
    async fn update(&self, saga: SagaState) -> anyhow::Result<()>;

    /// Non-terminal instances not updated since the cutoff, oldest-first,
    /// capped at `batch_size`.
    async fn get_stuck(
        &self,
        older_than: DateTime<Utc>,
        batch_size: usize,
    ) -> anyhow::Result<Vec<SagaState>>;

    /// Flush buffered mutations.
    async fn persist(&self) -> anyhow::Result<()>;
}

/// Read-only sweep surfacing sagas that stopped making progress.
///
/// Recovery deliberately mutates nothing: what "stuck" means and what to do
/// about it (resume, compensate, page someone) is an application decision.
pub struct SagaRecovery {
    store: Arc<dyn SagaStore>,
}

impl SagaRecovery {
    /// Build a recovery view over a store.
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self { store }
    }

    /// Sagas in `Running` or `Compensating` whose `last_updated_at` is older
    /// than `threshold` ago.
    pub async fn find_stuck(
        &self,
        threshold: Duration,
        batch_size: usize,
    ) -> anyhow::Result<Vec<SagaState>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.store.get_stuck(cutoff, batch_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureCode;
    use crate::testing::InMemorySagaStore;

    #[test]
    fn test_new_saga_is_running_at_step_zero() {
        let saga = SagaState::new("order-fulfillment", serde_json::json!({ "order": 1 }));
        assert_eq!(saga.status, SagaStatus::Running);
        assert_eq!(saga.current_step, 0);
        assert!(saga.completed_at.is_none());
        assert_eq!(saga.started_at, saga.last_updated_at);
    }

    #[test]
    fn test_legal_transitions() {
        let mut saga = SagaState::new("s", serde_json::json!({}));
        saga.transition(SagaStatus::Compensating).unwrap();
        saga.transition(SagaStatus::Compensated).unwrap();
        assert!(saga.completed_at.is_some());

        let mut saga = SagaState::new("s", serde_json::json!({}));
        saga.transition(SagaStatus::Completed).unwrap();
        assert!(saga.completed_at.is_some());

        let mut saga = SagaState::new("s", serde_json::json!({}));
        saga.transition(SagaStatus::Failed).unwrap();
        assert!(saga.completed_at.is_some());
    }

    #[test]
    fn test_illegal_transition_is_conflict_and_leaves_state_untouched() {
        let mut saga = SagaState::new("s", serde_json::json!({}));
        saga.transition(SagaStatus::Completed).unwrap();
        let before = saga.clone();

        let failure = saga.transition(SagaStatus::Compensating).unwrap_err();
        assert_eq!(failure.code, FailureCode::Conflict);
        assert_eq!(saga.status, before.status);
        assert_eq!(saga.last_updated_at, before.last_updated_at);
    }

    #[test]
    fn test_step_advances_only_while_running() {
        let mut saga = SagaState::new("s", serde_json::json!({}));
        assert_eq!(saga.advance_step().unwrap(), 1);
        assert_eq!(saga.advance_step().unwrap(), 2);

        saga.transition(SagaStatus::Compensating).unwrap();
        let failure = saga.advance_step().unwrap_err();
        assert_eq!(failure.code, FailureCode::Conflict);
        assert_eq!(saga.current_step, 2);
    }

    #[tokio::test]
    async fn test_find_stuck_honors_threshold_and_status() {
        let store = Arc::new(InMemorySagaStore::new());

        let mut stuck = SagaState::new("s", serde_json::json!({}));
        stuck.last_updated_at = Utc::now() - chrono::Duration::minutes(45);
        let stuck_id = stuck.id;
        store.add(stuck).await.unwrap();

        let mut fresh = SagaState::new("s", serde_json::json!({}));
        fresh.last_updated_at = Utc::now() - chrono::Duration::minutes(5);
        store.add(fresh).await.unwrap();

        let mut done = SagaState::new("s", serde_json::json!({}));
        done.transition(SagaStatus::Completed).unwrap();
        done.last_updated_at = Utc::now() - chrono::Duration::hours(2);
        store.add(done).await.unwrap();

        let recovery = SagaRecovery::new(Arc::clone(&store) as Arc<dyn SagaStore>);
        let found = recovery
            .find_stuck(Duration::from_secs(30 * 60), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stuck_id);
    }
}
