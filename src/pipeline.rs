//! The interceptor pipeline wrapped around every request dispatch.
//!
//! Interceptors form an ordered chain around the handler, onion-style: the
//! first registered interceptor is outermost. Each link receives the erased
//! [`Invocation`] and a [`Next`] continuation; calling `next.run(invocation)`
//! proceeds inward, not calling it short-circuits the dispatch.
//!
//! Chains are composed per request type, once: [`CompiledChain::compile`]
//! filters the registered interceptors by scope against the request's
//! capabilities and pins the surviving order. Dispatch never re-evaluates
//! scope per call.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use smallvec::SmallVec;

use crate::failure::DispatchResult;
use crate::handler::{AnyRequestHandler, ErasedRequestBox, ErasedResponse, RequestMeta};
use crate::registry::RegisteredRequest;
use crate::request::{Request, RequestContext, RequestKind};

/// Which request kinds an interceptor participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterceptorScope {
    /// Every request.
    #[default]
    All,
    /// Commands only.
    Commands,
    /// Queries only.
    Queries,
}

impl InterceptorScope {
    /// Whether this scope covers the given request kind.
    pub fn applies_to(self, kind: RequestKind) -> bool {
        match self {
            InterceptorScope::All => true,
            InterceptorScope::Commands => kind == RequestKind::Command,
            InterceptorScope::Queries => kind == RequestKind::Query,
        }
    }
}

/// One link in the dispatch chain.
///
/// # Example
///
/// ```ignore
/// struct Timing;
///
/// #[async_trait]
/// impl Interceptor for Timing {
///     async fn intercept(
///         &self,
///         invocation: Invocation,
///         next: Next<'_>,
///     ) -> DispatchResult<ErasedResponse> {
///         let started = std::time::Instant::now();
///         let result = next.run(invocation).await;
///         tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "dispatch timed");
///         result
///     }
/// }
/// ```
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Which request kinds this interceptor wraps. Checked once at chain
    /// composition.
    fn scope(&self) -> InterceptorScope {
        InterceptorScope::All
    }

    /// Wrap the rest of the chain.
    async fn intercept(
        &self,
        invocation: Invocation,
        next: Next<'_>,
    ) -> DispatchResult<ErasedResponse>;
}

/// The erased in-flight request handed through the chain.
pub struct Invocation {
    pub(crate) request: ErasedRequestBox,
    /// Registration-time metadata of the request type.
    pub meta: Arc<RequestMeta>,
    /// Caller context; interceptors may enrich it before passing inward.
    pub ctx: RequestContext,
}

impl Invocation {
    /// Borrow the concrete request, if it is of type `R`.
    pub fn request_as<R: Request>(&self) -> Option<&R> {
        let request: &(dyn Any + Send) = self.request.as_ref();
        request.downcast_ref::<R>()
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("type_name", &self.meta.type_name)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// Continuation representing the remainder of the chain plus the handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn AnyRequestHandler,
}

impl<'a> Next<'a> {
    /// Proceed to the next link, or the handler when the chain is exhausted.
    pub fn run(self, invocation: Invocation) -> BoxFuture<'a, DispatchResult<ErasedResponse>> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    handler: self.handler,
                };
                head.intercept(invocation, next)
            }
            None => Box::pin(async move {
                self.handler
                    .handle_any(invocation.request, &invocation.ctx)
                    .await
            }),
        }
    }
}

/// An interceptor chain composed once for one request type.
pub(crate) struct CompiledChain {
    interceptors: SmallVec<[Arc<dyn Interceptor>; 4]>,
    handler: crate::handler::SharedRequestHandler,
    meta: Arc<RequestMeta>,
}

impl CompiledChain {
    /// Filter the registered interceptors by scope and pin the chain.
    pub(crate) fn compile(
        interceptors: &[Arc<dyn Interceptor>],
        registered: &RegisteredRequest,
    ) -> Self {
        let kind = registered.meta.capabilities.kind;
        let chain = interceptors
            .iter()
            .filter(|i| i.scope().applies_to(kind))
            .cloned()
            .collect();
        Self {
            interceptors: chain,
            handler: Arc::clone(&registered.handler),
            meta: Arc::clone(&registered.meta),
        }
    }

    pub(crate) fn meta(&self) -> &Arc<RequestMeta> {
        &self.meta
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Run the full chain for one erased request.
    pub(crate) fn invoke(
        &self,
        request: ErasedRequestBox,
        ctx: RequestContext,
    ) -> BoxFuture<'_, DispatchResult<ErasedResponse>> {
        let invocation = Invocation {
            request,
            meta: Arc::clone(&self.meta),
            ctx,
        };
        let next = Next {
            chain: &self.interceptors,
            handler: self.handler.as_ref(),
        };
        next.run(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Failure;
    use crate::handler::{RequestHandler, RequestHandlerWrapper};
    use crate::request::RequestCapabilities;
    use std::sync::Mutex;

    struct Double {
        value: i32,
    }

    impl Request for Double {
        type Response = i32;
    }

    struct DoubleHandler;

    #[async_trait]
    impl RequestHandler<Double> for DoubleHandler {
        async fn handle(&self, request: Double, _ctx: &RequestContext) -> DispatchResult<i32> {
            Ok(request.value * 2)
        }
    }

    struct Trace {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        scope: InterceptorScope,
    }

    #[async_trait]
    impl Interceptor for Trace {
        fn scope(&self) -> InterceptorScope {
            self.scope
        }

        async fn intercept(
            &self,
            invocation: Invocation,
            next: Next<'_>,
        ) -> DispatchResult<ErasedResponse> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:before", self.label));
            let result = next.run(invocation).await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    struct Reject;

    #[async_trait]
    impl Interceptor for Reject {
        async fn intercept(
            &self,
            _invocation: Invocation,
            _next: Next<'_>,
        ) -> DispatchResult<ErasedResponse> {
            Err(Failure::unauthorized("blocked"))
        }
    }

    fn registered(capabilities: RequestCapabilities) -> RegisteredRequest {
        RegisteredRequest {
            handler: Arc::new(RequestHandlerWrapper::new(DoubleHandler)),
            meta: Arc::new(RequestMeta {
                type_name: "Double",
                capabilities,
                response_codec: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_chain_runs_onion_ordered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Trace {
                label: "outer",
                log: Arc::clone(&log),
                scope: InterceptorScope::All,
            }),
            Arc::new(Trace {
                label: "inner",
                log: Arc::clone(&log),
                scope: InterceptorScope::All,
            }),
        ];
        let chain = CompiledChain::compile(&interceptors, &registered(RequestCapabilities::command()));

        let response = chain
            .invoke(Box::new(Double { value: 21 }), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(*response.downcast::<i32>().unwrap(), 42);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_scope_filtering_happens_at_compile() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Trace {
                label: "commands-only",
                log: Arc::clone(&log),
                scope: InterceptorScope::Commands,
            }),
            Arc::new(Trace {
                label: "all",
                log: Arc::clone(&log),
                scope: InterceptorScope::All,
            }),
        ];
        let chain = CompiledChain::compile(&interceptors, &registered(RequestCapabilities::query()));
        assert_eq!(chain.len(), 1);

        chain
            .invoke(Box::new(Double { value: 1 }), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["all:before", "all:after"]);
    }

    #[tokio::test]
    async fn test_interceptor_short_circuits_without_reaching_handler() {
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Reject)];
        let chain = CompiledChain::compile(&interceptors, &registered(RequestCapabilities::command()));

        let failure = chain
            .invoke(Box::new(Double { value: 1 }), RequestContext::new())
            .await
            .unwrap_err();
        assert_eq!(failure.code, crate::failure::FailureCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_invocation_exposes_typed_request() {
        struct Peek {
            seen: Arc<Mutex<Option<i32>>>,
        }

        #[async_trait]
        impl Interceptor for Peek {
            async fn intercept(
                &self,
                invocation: Invocation,
                next: Next<'_>,
            ) -> DispatchResult<ErasedResponse> {
                *self.seen.lock().unwrap() =
                    invocation.request_as::<Double>().map(|r| r.value);
                next.run(invocation).await
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Peek {
            seen: Arc::clone(&seen),
        })];
        let chain = CompiledChain::compile(&interceptors, &registered(RequestCapabilities::command()));

        chain
            .invoke(Box::new(Double { value: 7 }), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn test_scope_applies_to() {
        assert!(InterceptorScope::All.applies_to(RequestKind::Command));
        assert!(InterceptorScope::Commands.applies_to(RequestKind::Command));
        assert!(!InterceptorScope::Commands.applies_to(RequestKind::Query));
        assert!(InterceptorScope::Queries.applies_to(RequestKind::Query));
        assert!(!InterceptorScope::Queries.applies_to(RequestKind::Command));
    }
}
