//! # courier
//!
//! In-process request/notification mediation with at-least-once delivery
//! reliability.
//!
//! The core is a [`Mediator`]: `send` routes a typed request to its single
//! registered handler through an ordered interceptor chain; `publish` fans a
//! notification out to every registered handler. Around that core sit four
//! durable building blocks, each defined as a storage contract plus the loop
//! or interceptor that drives it:
//!
//! - **Outbox**: notifications staged durably by handlers and published by a
//!   polling loop ([`OutboxStore`], [`OutboxProcessor`]).
//! - **Inbox**: consumer-side dedup of idempotent requests by message id,
//!   with verbatim replay of cached outcomes ([`InboxStore`], [`InboxGuard`],
//!   [`InboxCleanup`]).
//! - **Saga**: durable multi-step process state with a validated status
//!   graph ([`SagaStore`], [`SagaRecovery`]).
//! - **Scheduled**: one-shot and cron-recurring requests dispatched when due
//!   ([`ScheduledStore`], [`ScheduledProcessor`]).
//!
//! Delivery is at-least-once everywhere: loops may redeliver after a crash
//! and several loop instances may run concurrently; the inbox guard is the
//! dedup point. Every expected failure is a [`Failure`] value, never a panic;
//! panics escaping a handler are caught once at the dispatch boundary and
//! surfaced as `internal` failures.
//!
//! ```ignore
//! let registry = HandlerRegistry::builder()
//!     .module("billing", |m| {
//!         m.interceptor(InboxGuard::new(inbox_store, InboxConfig::default()));
//!         m.idempotent_command::<ChargeCard, _>(ChargeCardHandler::new(gateway));
//!         m.notification::<CardCharged, _>(ReceiptMailer::new(mailer));
//!     })
//!     .build();
//!
//! let mediator = Arc::new(Mediator::new(Arc::new(registry)));
//! let ctx = RequestContext::new().with_message_id(delivery.message_id);
//! let receipt = mediator.send_with(ChargeCard { amount }, ctx).await?;
//! ```
//!
//! Storage is a trait boundary; the crate ships in-memory implementations in
//! [`testing`] (feature `testing`) and leaves durable adapters to callers.

pub mod failure;
pub mod handler;
pub mod inbox;
pub mod mediator;
pub mod outbox;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod retry;
pub mod saga;
pub mod scheduled;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use failure::{DispatchResult, Failure, FailureCode};
pub use handler::{NotificationHandler, RequestHandler, RequestMeta};
pub use inbox::{
    CachedOutcome, InboxCleanup, InboxCleanupConfig, InboxConfig, InboxGuard, InboxMessage,
    InboxStore,
};
pub use mediator::{Mediator, MediatorConfig, PublishStrategy};
pub use outbox::{OutboxMessage, OutboxProcessor, OutboxProcessorConfig, OutboxStore};
pub use pipeline::{Interceptor, InterceptorScope, Invocation, Next};
pub use registry::{
    ErasedNotification, ErasedRequest, HandlerRegistry, ModuleRegistrar, NotificationRegistry,
    RegistryBuilder, RegistryError, ScheduledRequestRegistry, WireError,
};
pub use request::{Notification, Request, RequestCapabilities, RequestContext, RequestKind};
pub use retry::RetryPolicy;
pub use saga::{SagaRecovery, SagaState, SagaStatus, SagaStore};
pub use scheduled::{
    ScheduledMessage, ScheduledProcessor, ScheduledProcessorConfig, ScheduledStore,
};

// The traits above are `async_trait`; re-export the macro so implementors
// need no direct dependency.
pub use async_trait::async_trait;
