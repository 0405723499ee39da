//! Handler traits and the type-erasure layer beneath the dispatch engine.
//!
//! Callers and handler authors work with the typed [`RequestHandler`] and
//! [`NotificationHandler`] traits. Internally the registry stores handlers
//! behind `TypeId`-keyed erased wrappers so one mediator can dispatch any
//! registered type; the wrappers downcast back to the concrete types at the
//! innermost link of the chain.
//!
//! [`ResponseCodec`] is captured at registration for idempotent requests: the
//! inbox guard needs to serialize a response into storage and rebuild it for
//! replay, and only the registration site still knows the concrete type.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::failure::{DispatchResult, Failure};
use crate::request::{Notification, Request, RequestCapabilities, RequestContext};

/// A request travelling through the erased pipeline.
pub type ErasedRequestBox = Box<dyn Any + Send>;

/// A response travelling back through the erased pipeline.
pub type ErasedResponse = Box<dyn Any + Send>;

/// Handles a single request type.
///
/// Exactly one handler exists per request type; resolution failure surfaces as
/// a `handler_missing` failure from `send`, not a panic.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    /// Execute the request and produce its response.
    async fn handle(&self, request: R, ctx: &RequestContext) -> DispatchResult<R::Response>;
}

/// Handles one notification type; many handlers may exist per type.
///
/// Handlers receive the notification by reference because fan-out may invoke
/// several of them against the same value.
#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    /// React to the notification.
    async fn handle(&self, notification: &N, ctx: &RequestContext) -> DispatchResult<()>;
}

/// Static metadata recorded for a request type at registration.
#[derive(Clone)]
pub struct RequestMeta {
    /// Rust type name, used in failures and log fields.
    pub type_name: &'static str,
    /// Capability flags checked during chain composition.
    pub capabilities: RequestCapabilities,
    /// Response serializer/deserializer; present only for idempotent requests.
    pub(crate) response_codec: Option<ResponseCodec>,
}

impl std::fmt::Debug for RequestMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMeta")
            .field("type_name", &self.type_name)
            .field("capabilities", &self.capabilities)
            .field("has_response_codec", &self.response_codec.is_some())
            .finish()
    }
}

/// Paired serialize/deserialize functions for one response type.
///
/// Captured as monomorphized fn pointers at registration, so the codec itself
/// stays `Copy` and carries no allocation.
#[derive(Clone, Copy)]
pub(crate) struct ResponseCodec {
    encode: fn(&dyn Any) -> DispatchResult<serde_json::Value>,
    decode: fn(&serde_json::Value) -> DispatchResult<ErasedResponse>,
}

impl ResponseCodec {
    /// Build a codec for a concrete response type.
    pub(crate) fn of<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Self {
            encode: encode_response::<T>,
            decode: decode_response::<T>,
        }
    }

    /// Serialize an erased response of the codec's type.
    pub(crate) fn encode(&self, response: &dyn Any) -> DispatchResult<serde_json::Value> {
        (self.encode)(response)
    }

    /// Rebuild an erased response from its serialized form.
    pub(crate) fn decode(&self, value: &serde_json::Value) -> DispatchResult<ErasedResponse> {
        (self.decode)(value)
    }
}

fn encode_response<T>(response: &dyn Any) -> DispatchResult<serde_json::Value>
where
    T: Serialize + 'static,
{
    let typed = response
        .downcast_ref::<T>()
        .ok_or_else(|| Failure::internal("response type mismatch while encoding"))?;
    serde_json::to_value(typed).map_err(Failure::serialization)
}

fn decode_response<T>(value: &serde_json::Value) -> DispatchResult<ErasedResponse>
where
    T: DeserializeOwned + Send + 'static,
{
    let typed: T = serde_json::from_value(value.clone()).map_err(Failure::serialization)?;
    Ok(Box::new(typed))
}

/// Type-erased request handler stored by the registry.
#[async_trait]
pub(crate) trait AnyRequestHandler: Send + Sync {
    async fn handle_any(
        &self,
        request: ErasedRequestBox,
        ctx: &RequestContext,
    ) -> DispatchResult<ErasedResponse>;
}

/// Wrapper making a concrete [`RequestHandler`] implement [`AnyRequestHandler`].
pub(crate) struct RequestHandlerWrapper<H, R> {
    handler: H,
    _phantom: PhantomData<fn(R)>,
}

impl<H, R> RequestHandlerWrapper<H, R>
where
    H: RequestHandler<R>,
    R: Request,
{
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, R> AnyRequestHandler for RequestHandlerWrapper<H, R>
where
    H: RequestHandler<R>,
    R: Request,
{
    async fn handle_any(
        &self,
        request: ErasedRequestBox,
        ctx: &RequestContext,
    ) -> DispatchResult<ErasedResponse> {
        let request = request.downcast::<R>().map_err(|_| {
            Failure::internal(format!(
                "request type mismatch: expected {}",
                std::any::type_name::<R>()
            ))
        })?;
        let response = self.handler.handle(*request, ctx).await?;
        Ok(Box::new(response))
    }
}

/// Type-erased notification handler stored by the registry.
#[async_trait]
pub(crate) trait AnyNotificationHandler: Send + Sync {
    async fn handle_any(
        &self,
        notification: &(dyn Any + Send + Sync),
        ctx: &RequestContext,
    ) -> DispatchResult<()>;
}

/// Wrapper making a concrete [`NotificationHandler`] implement
/// [`AnyNotificationHandler`].
pub(crate) struct NotificationHandlerWrapper<H, N> {
    handler: H,
    _phantom: PhantomData<fn(N)>,
}

impl<H, N> NotificationHandlerWrapper<H, N>
where
    H: NotificationHandler<N>,
    N: Notification,
{
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, N> AnyNotificationHandler for NotificationHandlerWrapper<H, N>
where
    H: NotificationHandler<N>,
    N: Notification,
{
    async fn handle_any(
        &self,
        notification: &(dyn Any + Send + Sync),
        ctx: &RequestContext,
    ) -> DispatchResult<()> {
        let typed = notification.downcast_ref::<N>().ok_or_else(|| {
            Failure::internal(format!(
                "notification type mismatch: expected {}",
                std::any::type_name::<N>()
            ))
        })?;
        self.handler.handle(typed, ctx).await
    }
}

/// Shared handle to an erased request handler.
pub(crate) type SharedRequestHandler = Arc<dyn AnyRequestHandler>;

/// Shared handle to an erased notification handler.
pub(crate) type SharedNotificationHandler = Arc<dyn AnyNotificationHandler>;
