//! Request and notification traits, capability flags, and per-call context.
//!
//! Courier separates **requests** from **notifications**:
//! - [`Request`] = a typed message with exactly one handler and a typed response
//! - [`Notification`] = a fact fanned out to zero-or-more handlers
//!
//! Behavior selection is explicit, not attribute-driven: a request's kind
//! (command vs query) and its idempotency are [`RequestCapabilities`] attached
//! at registration time and checked once while the interceptor chain is
//! composed, never per call.

use std::fmt;

use uuid::Uuid;

/// A typed request with exactly one handler.
///
/// # Example
///
/// ```ignore
/// struct CreateOrder { customer: Uuid }
///
/// impl Request for CreateOrder {
///     type Response = Uuid;
/// }
/// ```
pub trait Request: Send + 'static {
    /// The response produced by this request's handler.
    type Response: Send + 'static;
}

/// A notification fanned out to zero-or-more handlers.
///
/// Blanket-implemented for any shareable type; handlers receive the
/// notification by reference so fan-out never requires `Clone`.
pub trait Notification: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Notification for T {}

/// Whether a request mutates state or only reads it.
///
/// Interceptors can scope themselves to one kind; the distinction carries no
/// runtime behavior of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Mutating request.
    Command,
    /// Read-only request.
    Query,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Command => f.write_str("command"),
            RequestKind::Query => f.write_str("query"),
        }
    }
}

/// Capability flags attached to a request type at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCapabilities {
    /// Command or query.
    pub kind: RequestKind,
    /// Whether the inbox guard deduplicates this request by message id.
    pub idempotent: bool,
}

impl RequestCapabilities {
    /// A plain, non-idempotent command.
    pub fn command() -> Self {
        Self {
            kind: RequestKind::Command,
            idempotent: false,
        }
    }

    /// A read-only query.
    pub fn query() -> Self {
        Self {
            kind: RequestKind::Query,
            idempotent: false,
        }
    }

    /// A command deduplicated by the inbox guard.
    pub fn idempotent_command() -> Self {
        Self {
            kind: RequestKind::Command,
            idempotent: true,
        }
    }
}

/// Caller context for a single logical dispatch.
///
/// The context is shared across the whole interceptor chain of one call and
/// never leaks across concurrent calls. It is cheap to clone.
///
/// `message_id` is the caller-supplied idempotency key; it is required for
/// requests registered as idempotent and ignored otherwise.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller-supplied idempotency key.
    pub message_id: Option<String>,
    /// Correlation id tying related work together.
    pub correlation_id: Uuid,
    /// Optional tenant scope.
    pub tenant_id: Option<String>,
    /// Optional acting-user identity.
    pub user_id: Option<String>,
}

impl RequestContext {
    /// A fresh context with a random correlation id.
    pub fn new() -> Self {
        Self {
            message_id: None,
            correlation_id: Uuid::new_v4(),
            tenant_id: None,
            user_id: None,
        }
    }

    /// Set the idempotency key.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the tenant scope.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the acting user.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
