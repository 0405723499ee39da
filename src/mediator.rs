//! The dispatch engine: `send` for requests, `publish` for notifications.
//!
//! The mediator owns an immutable [`HandlerRegistry`] and a per-request-type
//! cache of compiled interceptor chains. A `send` resolves exactly one handler
//! or fails with `handler_missing`; a `publish` fans out to every registered
//! handler for the notification type, zero handlers being a successful no-op.
//!
//! # Panic boundary
//!
//! Dispatch is the crate's single panic boundary. A panic escaping a handler
//! or interceptor is caught exactly once per dispatch and converted into an
//! `internal` failure carrying the panic message; it never tears down the
//! caller or a background loop.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::failure::{DispatchResult, Failure, FailureCode};
use crate::handler::{ErasedRequestBox, ErasedResponse, SharedNotificationHandler};
use crate::pipeline::CompiledChain;
use crate::registry::{ErasedNotification, ErasedRequest, HandlerRegistry};
use crate::request::{Notification, Request, RequestContext};

/// How `publish` treats multiple notification handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishStrategy {
    /// Run handlers in registration order; run all of them even when some
    /// fail, then report every failure as one aggregate.
    #[default]
    SequentialAggregate,
    /// Run handlers in registration order; stop at the first failure.
    SequentialFailFast,
    /// Run all handlers concurrently; report failures as one aggregate.
    Parallel,
}

/// Mediator behavior knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediatorConfig {
    /// Fan-out strategy for `publish`.
    pub publish_strategy: PublishStrategy,
    /// Escalate a `Conflict` failure surfacing from `send` into a panic.
    ///
    /// Off by default; conflicts are ordinary values for callers that retry
    /// optimistic writes themselves.
    pub panic_on_conflict: bool,
}

/// The dispatch engine.
pub struct Mediator {
    registry: Arc<HandlerRegistry>,
    config: MediatorConfig,
    chains: DashMap<TypeId, Arc<CompiledChain>>,
}

impl Mediator {
    /// Build a mediator with default configuration.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::with_config(registry, MediatorConfig::default())
    }

    /// Build a mediator with explicit configuration.
    pub fn with_config(registry: Arc<HandlerRegistry>, config: MediatorConfig) -> Self {
        Self {
            registry,
            config,
            chains: DashMap::new(),
        }
    }

    /// The registry this mediator dispatches against.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    // =========================================================================
    // send
    // =========================================================================

    /// Dispatch a request with a fresh context.
    pub async fn send<R: Request>(&self, request: R) -> DispatchResult<R::Response> {
        self.send_with(request, RequestContext::new()).await
    }

    /// Dispatch a request with an explicit context.
    pub async fn send_with<R: Request>(
        &self,
        request: R,
        ctx: RequestContext,
    ) -> DispatchResult<R::Response> {
        let response = self
            .send_dyn(
                TypeId::of::<R>(),
                std::any::type_name::<R>(),
                Box::new(request),
                ctx,
            )
            .await?;
        response
            .downcast::<R::Response>()
            .map(|boxed| *boxed)
            .map_err(|_| Failure::internal("response type mismatch after dispatch"))
    }

    /// Dispatch a request rebuilt from storage by a wire registry.
    pub async fn send_erased(
        &self,
        request: ErasedRequest,
        ctx: RequestContext,
    ) -> DispatchResult<ErasedResponse> {
        self.send_dyn(request.type_id, request.type_name, request.request, ctx)
            .await
    }

    async fn send_dyn(
        &self,
        type_id: TypeId,
        type_name: &str,
        request: ErasedRequestBox,
        ctx: RequestContext,
    ) -> DispatchResult<ErasedResponse> {
        let chain = self
            .chain_for(type_id)
            .ok_or_else(|| Failure::handler_missing(type_name))?;

        debug!(
            request_type = chain.meta().type_name,
            kind = %chain.meta().capabilities.kind,
            correlation_id = %ctx.correlation_id,
            "dispatching request"
        );

        let outcome = std::panic::AssertUnwindSafe(chain.invoke(request, ctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = extract_panic_message(&payload);
                warn!(
                    request_type = chain.meta().type_name,
                    panic_message = %message,
                    "dispatch panicked"
                );
                Err(Failure::from_panic(&message))
            }
        };

        if self.config.panic_on_conflict {
            if let Err(failure) = &result {
                if failure.code == FailureCode::Conflict {
                    panic!("unresolved write conflict: {failure}");
                }
            }
        }
        result
    }

    fn chain_for(&self, type_id: TypeId) -> Option<Arc<CompiledChain>> {
        if let Some(chain) = self.chains.get(&type_id) {
            return Some(Arc::clone(chain.value()));
        }
        let registered = self.registry.request(type_id)?;
        let chain = Arc::new(CompiledChain::compile(
            self.registry.interceptors(),
            registered,
        ));
        // Two tasks may race here; both compile the same chain, last write
        // wins, either copy is valid.
        self.chains.insert(type_id, Arc::clone(&chain));
        Some(chain)
    }

    // =========================================================================
    // publish
    // =========================================================================

    /// Fan a notification out with a fresh context.
    pub async fn publish<N: Notification>(&self, notification: N) -> DispatchResult<()> {
        self.publish_with(notification, RequestContext::new()).await
    }

    /// Fan a notification out with an explicit context.
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        ctx: RequestContext,
    ) -> DispatchResult<()> {
        self.publish_dyn(
            TypeId::of::<N>(),
            std::any::type_name::<N>(),
            &notification,
            ctx,
        )
        .await
    }

    /// Fan out a notification rebuilt from storage by a wire registry.
    pub async fn publish_erased(
        &self,
        notification: ErasedNotification,
        ctx: RequestContext,
    ) -> DispatchResult<()> {
        self.publish_dyn(
            notification.type_id,
            notification.type_name,
            notification.value.as_ref(),
            ctx,
        )
        .await
    }

    async fn publish_dyn(
        &self,
        type_id: TypeId,
        type_name: &str,
        notification: &(dyn Any + Send + Sync),
        ctx: RequestContext,
    ) -> DispatchResult<()> {
        let Some(handlers) = self.registry.notification_handlers(type_id) else {
            debug!(notification_type = type_name, "no handlers registered, skipping");
            return Ok(());
        };

        debug!(
            notification_type = type_name,
            handler_count = handlers.len(),
            correlation_id = %ctx.correlation_id,
            strategy = ?self.config.publish_strategy,
            "publishing notification"
        );

        let failures = match self.config.publish_strategy {
            PublishStrategy::SequentialAggregate => {
                let mut failures = Vec::new();
                for handler in handlers {
                    if let Err(failure) = run_handler(handler, notification, &ctx).await {
                        failures.push(failure);
                    }
                }
                failures
            }
            PublishStrategy::SequentialFailFast => {
                for handler in handlers {
                    run_handler(handler, notification, &ctx).await?;
                }
                Vec::new()
            }
            PublishStrategy::Parallel => {
                let futures = handlers
                    .iter()
                    .map(|handler| run_handler(handler, notification, &ctx));
                join_all(futures)
                    .await
                    .into_iter()
                    .filter_map(Result::err)
                    .collect()
            }
        };

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(
                notification_type = type_name,
                failed = failures.len(),
                "notification fan-out produced failures"
            );
            Err(Failure::aggregate(failures))
        }
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("cached_chains", &self.chains.len())
            .finish()
    }
}

/// Run one notification handler behind its own panic boundary.
async fn run_handler(
    handler: &SharedNotificationHandler,
    notification: &(dyn Any + Send + Sync),
    ctx: &RequestContext,
) -> DispatchResult<()> {
    let outcome = std::panic::AssertUnwindSafe(handler.handle_any(notification, ctx))
        .catch_unwind()
        .await;
    match outcome {
        Ok(result) => result,
        Err(payload) => Err(Failure::from_panic(&extract_panic_message(&payload))),
    }
}

// Best-effort: payloads routed through panic_fmt are neither &str nor
// String, in which case only the fixed marker survives.
fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
