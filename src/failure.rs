//! The universal outcome type for dispatch and the reliability loops.
//!
//! `Failure` is a value, not an exception: every public operation returns
//! [`DispatchResult`] and no component signals an *expected* failure by
//! panicking. Panics are reserved for genuinely unexpected faults, which the
//! dispatch boundary catches exactly once and converts into an
//! [`FailureCode::Internal`] failure.
//!
//! # Why serializable
//!
//! The inbox caches the full outcome of an idempotent request - success or
//! failure - and replays it verbatim on duplicate delivery. That only works if
//! failures round-trip through storage, so `Failure` derives `serde` and keeps
//! its cause as a rendered string rather than a live error object.
//!
//! # Aggregates
//!
//! Notification fan-out can produce several independent failures. Those are
//! merged into a single composite failure with [`Failure::aggregate`]; the
//! caller recovers every constituent through [`Failure::constituents`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used by every public operation in the crate.
pub type DispatchResult<T> = Result<T, Failure>;

/// Machine-readable failure classification.
///
/// The taxonomy determines handling, not wording:
/// - `Validation` / `Unauthorized` - caller input or permission rejected
///   before the handler ran; never retried automatically.
/// - `HandlerMissing` / `NotFound` - returned immediately.
/// - `Conflict` - optimistic-write collision; returned as a value, optionally
///   escalated to a panic by [`crate::MediatorConfig::panic_on_conflict`].
/// - `Serialization` / `Unavailable` - transient or environmental; the
///   background loops turn these into failed attempts with backoff.
/// - `Aggregate` - composite fan-out failure carrying its constituents.
/// - `Internal` - an unexpected fault converted at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// No handler is registered for the request type.
    HandlerMissing,
    /// An idempotent request arrived without an idempotency key.
    MissingMessageId,
    /// An inbox row has exhausted its retry budget.
    MaxRetriesExceeded,
    /// Caller input rejected before the handler ran.
    Validation,
    /// Caller permission rejected before the handler ran.
    Unauthorized,
    /// A referenced entity does not exist.
    NotFound,
    /// Optimistic-concurrency collision.
    Conflict,
    /// A payload or cached response failed to (de)serialize.
    Serialization,
    /// A store or downstream dependency was unreachable.
    Unavailable,
    /// Composite failure from notification fan-out.
    Aggregate,
    /// Unexpected fault caught at the dispatch boundary.
    Internal,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCode::HandlerMissing => "handler_missing",
            FailureCode::MissingMessageId => "missing_message_id",
            FailureCode::MaxRetriesExceeded => "max_retries_exceeded",
            FailureCode::Validation => "validation",
            FailureCode::Unauthorized => "unauthorized",
            FailureCode::NotFound => "not_found",
            FailureCode::Conflict => "conflict",
            FailureCode::Serialization => "serialization",
            FailureCode::Unavailable => "unavailable",
            FailureCode::Aggregate => "aggregate",
            FailureCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A structured, storable failure value.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Failure {
    /// Machine-readable classification.
    pub code: FailureCode,
    /// Human-readable description.
    pub message: String,
    /// Rendered source chain, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Constituent failures; non-empty only for `Aggregate`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<Failure>,
}

impl Failure {
    /// Create a failure with a code and message.
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            related: Vec::new(),
        }
    }

    /// Attach a rendered cause.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// No handler registered for `type_name`.
    pub fn handler_missing(type_name: &str) -> Self {
        Self::new(
            FailureCode::HandlerMissing,
            format!("no handler registered for request type {type_name}"),
        )
    }

    /// Idempotent request dispatched without a message id in its context.
    pub fn missing_message_id(type_name: &str) -> Self {
        Self::new(
            FailureCode::MissingMessageId,
            format!("idempotent request {type_name} requires a message id"),
        )
    }

    /// Inbox retry budget exhausted for `message_id`.
    pub fn max_retries_exceeded(message_id: &str, max_retries: u32) -> Self {
        Self::new(
            FailureCode::MaxRetriesExceeded,
            format!("message {message_id} exceeded {max_retries} delivery attempts"),
        )
    }

    /// Caller input rejected.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Validation, message)
    }

    /// Caller permission rejected.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Unauthorized, message)
    }

    /// Referenced entity missing.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(FailureCode::NotFound, format!("{} not found", resource.into()))
    }

    /// Optimistic-write collision.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Conflict, message)
    }

    /// Payload or cached response failed to (de)serialize.
    pub fn serialization(cause: impl fmt::Display) -> Self {
        Self::new(FailureCode::Serialization, "serialization failed").with_cause(cause)
    }

    /// Store or downstream dependency unreachable.
    pub fn unavailable(cause: impl fmt::Display) -> Self {
        Self::new(FailureCode::Unavailable, "dependency unavailable").with_cause(cause)
    }

    /// Unexpected fault converted at the dispatch boundary.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Internal, message)
    }

    /// Fault recovered from a caught panic.
    pub fn from_panic(panic_message: &str) -> Self {
        Self::new(
            FailureCode::Internal,
            format!("handler panicked: {panic_message}"),
        )
    }

    /// Merge fan-out failures into one composite failure.
    ///
    /// Every constituent remains recoverable via [`Failure::constituents`].
    pub fn aggregate(failures: Vec<Failure>) -> Self {
        let message = format!("{} notification handler(s) failed", failures.len());
        Self {
            code: FailureCode::Aggregate,
            message,
            cause: None,
            related: failures,
        }
    }

    /// The constituent failures of an aggregate, or the failure itself.
    pub fn constituents(&self) -> &[Failure] {
        if self.related.is_empty() {
            std::slice::from_ref(self)
        } else {
            &self.related
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_message() {
        let f = Failure::handler_missing("CreateOrder");
        assert!(f.to_string().starts_with("handler_missing:"));
        assert!(f.to_string().contains("CreateOrder"));
    }

    #[test]
    fn test_cause_is_preserved() {
        let f = Failure::unavailable("connection refused");
        assert_eq!(f.cause.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_aggregate_counts_constituents() {
        let f = Failure::aggregate(vec![
            Failure::validation("bad input"),
            Failure::not_found("order"),
        ]);
        assert_eq!(f.code, FailureCode::Aggregate);
        assert_eq!(f.constituents().len(), 2);
        assert!(f.to_string().contains("2 notification handler(s) failed"));
    }

    #[test]
    fn test_constituents_of_plain_failure_is_itself() {
        let f = Failure::conflict("revision mismatch");
        assert_eq!(f.constituents().len(), 1);
        assert_eq!(f.constituents()[0].code, FailureCode::Conflict);
    }

    #[test]
    fn test_failure_round_trips_through_json() {
        let f = Failure::aggregate(vec![Failure::unauthorized("nope").with_cause("no claim")]);
        let value = serde_json::to_value(&f).unwrap();
        let back: Failure = serde_json::from_value(value).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_failure_is_pattern_matchable() {
        let f = Failure::max_retries_exceeded("msg-1", 3);
        match f.code {
            FailureCode::MaxRetriesExceeded => {}
            other => panic!("unexpected code: {other}"),
        }
    }
}
