//! Handler registry: explicit, module-scoped registration built once at
//! start-up and immutable afterwards.
//!
//! Registration replaces assembly scanning with an explicit table: each source
//! module registers its handlers under a stable module name, and re-scanning a
//! module that was already registered is a no-op rather than a duplicate. The
//! built [`HandlerRegistry`] is shared behind an `Arc` and never written to
//! after `build()`.
//!
//! The wire registries at the bottom of this module serve the background
//! loops: a stored outbox/scheduled row carries only a type *tag* and a JSON
//! payload, and [`NotificationRegistry`] / [`ScheduledRequestRegistry`] map
//! tags back to typed values for redispatch.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::handler::{
    AnyNotificationHandler, AnyRequestHandler, ErasedRequestBox, NotificationHandler,
    NotificationHandlerWrapper, RequestHandler, RequestHandlerWrapper, RequestMeta, ResponseCodec,
    SharedNotificationHandler, SharedRequestHandler,
};
use crate::pipeline::Interceptor;
use crate::request::{Notification, Request, RequestCapabilities};

/// Registration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handler is already registered for this request type.
    #[error("handler already registered for request type {type_name} (module {module})")]
    DuplicateHandler {
        /// The request type that collided.
        type_name: &'static str,
        /// The module attempting the duplicate registration.
        module: &'static str,
    },
}

/// A request handler plus its registration-time metadata.
pub(crate) struct RegisteredRequest {
    pub(crate) handler: SharedRequestHandler,
    pub(crate) meta: Arc<RequestMeta>,
}

/// Immutable handler table produced by [`RegistryBuilder::build`].
pub struct HandlerRegistry {
    requests: HashMap<TypeId, RegisteredRequest>,
    notifications: HashMap<TypeId, Vec<SharedNotificationHandler>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl HandlerRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Whether a handler exists for the request type.
    pub fn has_request<R: Request>(&self) -> bool {
        self.requests.contains_key(&TypeId::of::<R>())
    }

    /// Number of registered request types.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Number of handlers registered for a notification type.
    pub fn notification_handler_count<N: Notification>(&self) -> usize {
        self.notifications
            .get(&TypeId::of::<N>())
            .map_or(0, Vec::len)
    }

    /// Number of registered interceptors.
    pub fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }

    pub(crate) fn request(&self, type_id: TypeId) -> Option<&RegisteredRequest> {
        self.requests.get(&type_id)
    }

    pub(crate) fn notification_handlers(
        &self,
        type_id: TypeId,
    ) -> Option<&[SharedNotificationHandler]> {
        self.notifications.get(&type_id).map(Vec::as_slice)
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("request_count", &self.requests.len())
            .field("notification_types", &self.notifications.len())
            .field("interceptor_count", &self.interceptors.len())
            .finish()
    }
}

/// Builder accumulating module registrations.
///
/// # Example
///
/// ```ignore
/// let registry = HandlerRegistry::builder()
///     .module("billing", |m| {
///         m.command::<ChargeCard, _>(ChargeCardHandler::new(gateway));
///         m.notification::<CardCharged, _>(ReceiptMailer::new(mailer));
///     })
///     .module("billing", |_| unreachable!("already scanned, skipped"))
///     .build();
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    seen_modules: HashSet<&'static str>,
    requests: HashMap<TypeId, RegisteredRequest>,
    notifications: HashMap<TypeId, Vec<SharedNotificationHandler>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl RegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one module's handlers.
    ///
    /// A module name that was already registered is skipped entirely, so
    /// repeated scans of the same module deduplicate instead of doubling.
    pub fn module(
        mut self,
        name: &'static str,
        register: impl FnOnce(&mut ModuleRegistrar<'_>),
    ) -> Self {
        if !self.seen_modules.insert(name) {
            debug!(module = name, "module already registered, skipping rescan");
            return self;
        }
        let mut registrar = ModuleRegistrar {
            builder: &mut self,
            module: name,
        };
        register(&mut registrar);
        self
    }

    /// Finalize into an immutable registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            requests: self.requests,
            notifications: self.notifications,
            interceptors: self.interceptors,
        }
    }
}

/// Registration surface scoped to one named module.
pub struct ModuleRegistrar<'a> {
    builder: &'a mut RegistryBuilder,
    module: &'static str,
}

impl ModuleRegistrar<'_> {
    /// Register a command handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `R` in another module.
    /// Use [`ModuleRegistrar::try_command`] for a non-panicking version.
    pub fn command<R, H>(&mut self, handler: H) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.try_command::<R, H>(handler)
            .unwrap_or_else(|e| panic!("{e}"));
        self
    }

    /// Register a command handler, returning an error on duplicates.
    pub fn try_command<R, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.try_register::<R, H>(handler, RequestCapabilities::command(), None)
    }

    /// Register a query handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `R` in another module.
    pub fn query<R, H>(&mut self, handler: H) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.try_register::<R, H>(handler, RequestCapabilities::query(), None)
            .unwrap_or_else(|e| panic!("{e}"));
        self
    }

    /// Register an idempotent command handler.
    ///
    /// The response type must serialize so the inbox guard can cache and
    /// replay outcomes for duplicate deliveries.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `R` in another module.
    pub fn idempotent_command<R, H>(&mut self, handler: H) -> &mut Self
    where
        R: Request,
        R::Response: serde::Serialize + DeserializeOwned,
        H: RequestHandler<R>,
    {
        self.try_register::<R, H>(
            handler,
            RequestCapabilities::idempotent_command(),
            Some(ResponseCodec::of::<R::Response>()),
        )
        .unwrap_or_else(|e| panic!("{e}"));
        self
    }

    fn try_register<R, H>(
        &mut self,
        handler: H,
        capabilities: RequestCapabilities,
        response_codec: Option<ResponseCodec>,
    ) -> Result<(), RegistryError>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let type_id = TypeId::of::<R>();
        if self.builder.requests.contains_key(&type_id) {
            return Err(RegistryError::DuplicateHandler {
                type_name: std::any::type_name::<R>(),
                module: self.module,
            });
        }
        let registered = RegisteredRequest {
            handler: Arc::new(RequestHandlerWrapper::new(handler)) as Arc<dyn AnyRequestHandler>,
            meta: Arc::new(RequestMeta {
                type_name: std::any::type_name::<R>(),
                capabilities,
                response_codec,
            }),
        };
        self.builder.requests.insert(type_id, registered);
        Ok(())
    }

    /// Register a notification handler.
    ///
    /// Multiple handlers per notification type are allowed; first-seen order
    /// is preserved and duplicates are kept.
    pub fn notification<N, H>(&mut self, handler: H) -> &mut Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let entry = self
            .builder
            .notifications
            .entry(TypeId::of::<N>())
            .or_default();
        entry.push(Arc::new(NotificationHandlerWrapper::new(handler))
            as Arc<dyn AnyNotificationHandler>);
        self
    }

    /// Register an interceptor at the next position in the ordered chain.
    pub fn interceptor(&mut self, interceptor: impl Interceptor) -> &mut Self {
        self.builder.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Register an already-shared interceptor.
    pub fn interceptor_arc(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.builder.interceptors.push(interceptor);
        self
    }
}

// =============================================================================
// Wire registries
// =============================================================================

/// Errors resolving a stored payload back into a typed value.
#[derive(Debug, Error)]
pub enum WireError {
    /// No decoder is registered for this type tag.
    #[error("unknown type tag: {0}")]
    UnknownType(String),

    /// The stored payload does not deserialize as the registered type.
    #[error("invalid payload for {tag}: {source}")]
    InvalidPayload {
        /// The type tag whose payload failed.
        tag: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A value failed to serialize on its way into a store.
    #[error("payload serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A notification rebuilt from a stored payload, ready for `publish`.
pub struct ErasedNotification {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) value: Box<dyn std::any::Any + Send + Sync>,
}

impl ErasedNotification {
    /// Erase a typed notification.
    pub fn erase<N: Notification>(notification: N) -> Self {
        Self {
            type_id: TypeId::of::<N>(),
            type_name: std::any::type_name::<N>(),
            value: Box::new(notification),
        }
    }
}

impl std::fmt::Debug for ErasedNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedNotification")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// A request rebuilt from a stored payload, ready for `send`.
pub struct ErasedRequest {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) request: ErasedRequestBox,
}

impl ErasedRequest {
    /// Erase a typed request.
    pub fn erase<R: Request>(request: R) -> Self {
        Self {
            type_id: TypeId::of::<R>(),
            type_name: std::any::type_name::<R>(),
            request: Box::new(request),
        }
    }
}

impl std::fmt::Debug for ErasedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedRequest")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

type DecodeNotificationFn =
    Box<dyn Fn(&serde_json::Value) -> Result<ErasedNotification, WireError> + Send + Sync>;

/// Maps notification type tags to decoders for the outbox publisher.
///
/// The tag is the durable identity of a notification type; it must not change
/// once rows referencing it exist.
#[derive(Default)]
pub struct NotificationRegistry {
    decoders: HashMap<&'static str, DecodeNotificationFn>,
}

impl NotificationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification type under a tag.
    ///
    /// # Panics
    ///
    /// Panics if the tag is already registered.
    pub fn register<N>(&mut self, tag: &'static str)
    where
        N: Notification + DeserializeOwned,
    {
        if self.decoders.contains_key(tag) {
            panic!("notification type already registered for tag: {tag}");
        }
        let decode: DecodeNotificationFn = Box::new(move |payload| {
            let notification: N =
                serde_json::from_value(payload.clone()).map_err(|source| {
                    WireError::InvalidPayload {
                        tag: tag.to_string(),
                        source,
                    }
                })?;
            Ok(ErasedNotification::erase(notification))
        });
        self.decoders.insert(tag, decode);
    }

    /// Resolve a stored payload into an erased notification.
    pub fn decode(
        &self,
        tag: &str,
        payload: &serde_json::Value,
    ) -> Result<ErasedNotification, WireError> {
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| WireError::UnknownType(tag.to_string()))?;
        decode(payload)
    }

    /// Whether a tag is registered.
    pub fn has(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("tags", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

type DecodeRequestFn =
    Box<dyn Fn(&serde_json::Value) -> Result<ErasedRequest, WireError> + Send + Sync>;

/// Maps request type tags to decoders for the scheduled dispatch loop.
#[derive(Default)]
pub struct ScheduledRequestRegistry {
    decoders: HashMap<&'static str, DecodeRequestFn>,
}

impl ScheduledRequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request type under a tag.
    ///
    /// # Panics
    ///
    /// Panics if the tag is already registered.
    pub fn register<R>(&mut self, tag: &'static str)
    where
        R: Request + DeserializeOwned,
    {
        if self.decoders.contains_key(tag) {
            panic!("request type already registered for tag: {tag}");
        }
        let decode: DecodeRequestFn = Box::new(move |payload| {
            let request: R = serde_json::from_value(payload.clone()).map_err(|source| {
                WireError::InvalidPayload {
                    tag: tag.to_string(),
                    source,
                }
            })?;
            Ok(ErasedRequest::erase(request))
        });
        self.decoders.insert(tag, decode);
    }

    /// Resolve a stored payload into an erased request.
    pub fn decode(
        &self,
        tag: &str,
        payload: &serde_json::Value,
    ) -> Result<ErasedRequest, WireError> {
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| WireError::UnknownType(tag.to_string()))?;
        decode(payload)
    }

    /// Whether a tag is registered.
    pub fn has(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for ScheduledRequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledRequestRegistry")
            .field("tags", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::DispatchResult;
    use crate::request::RequestContext;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    struct CreateItem;

    impl Request for CreateItem {
        type Response = u64;
    }

    struct CreateItemHandler;

    #[async_trait]
    impl RequestHandler<CreateItem> for CreateItemHandler {
        async fn handle(&self, _request: CreateItem, _ctx: &RequestContext) -> DispatchResult<u64> {
            Ok(1)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ItemCreated {
        id: u64,
    }

    struct ItemCreatedHandler;

    #[async_trait]
    impl NotificationHandler<ItemCreated> for ItemCreatedHandler {
        async fn handle(
            &self,
            _notification: &ItemCreated,
            _ctx: &RequestContext,
        ) -> DispatchResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_module_rescan_is_deduplicated() {
        let registry = HandlerRegistry::builder()
            .module("items", |m| {
                m.command::<CreateItem, _>(CreateItemHandler);
            })
            .module("items", |_| {
                panic!("second scan of the same module must be skipped");
            })
            .build();

        assert!(registry.has_request::<CreateItem>());
        assert_eq!(registry.request_count(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_request_handler_panics() {
        let _ = HandlerRegistry::builder()
            .module("a", |m| {
                m.command::<CreateItem, _>(CreateItemHandler);
            })
            .module("b", |m| {
                m.command::<CreateItem, _>(CreateItemHandler);
            })
            .build();
    }

    #[test]
    fn test_try_command_reports_duplicate() {
        let _ = HandlerRegistry::builder()
            .module("a", |m| {
                m.command::<CreateItem, _>(CreateItemHandler);
            })
            .module("b", |m| {
                let err = m.try_command::<CreateItem, _>(CreateItemHandler).unwrap_err();
                match err {
                    RegistryError::DuplicateHandler { module, .. } => assert_eq!(module, "b"),
                }
            })
            .build();
    }

    #[test]
    fn test_notification_handlers_accumulate_in_order() {
        let registry = HandlerRegistry::builder()
            .module("items", |m| {
                m.notification::<ItemCreated, _>(ItemCreatedHandler);
                m.notification::<ItemCreated, _>(ItemCreatedHandler);
            })
            .build();

        assert_eq!(registry.notification_handler_count::<ItemCreated>(), 2);
    }

    #[test]
    fn test_notification_registry_decode() {
        let mut registry = NotificationRegistry::new();
        registry.register::<ItemCreated>("items.created");

        let payload = serde_json::json!({ "id": 7 });
        let erased = registry.decode("items.created", &payload).unwrap();
        let typed = erased.value.downcast_ref::<ItemCreated>().unwrap();
        assert_eq!(typed.id, 7);
    }

    #[test]
    fn test_notification_registry_unknown_tag() {
        let registry = NotificationRegistry::new();
        let result = registry.decode("nope", &serde_json::json!({}));
        assert!(matches!(result, Err(WireError::UnknownType(_))));
    }

    #[test]
    fn test_notification_registry_invalid_payload() {
        let mut registry = NotificationRegistry::new();
        registry.register::<ItemCreated>("items.created");

        let result = registry.decode("items.created", &serde_json::json!({ "wrong": true }));
        assert!(matches!(result, Err(WireError::InvalidPayload { .. })));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_notification_registry_duplicate_tag_panics() {
        let mut registry = NotificationRegistry::new();
        registry.register::<ItemCreated>("items.created");
        registry.register::<ItemCreated>("items.created");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Reindex {
        shard: u32,
    }

    impl Request for Reindex {
        type Response = ();
    }

    #[test]
    fn test_scheduled_request_registry_decode() {
        let mut registry = ScheduledRequestRegistry::new();
        registry.register::<Reindex>("search.reindex");

        let erased = registry
            .decode("search.reindex", &serde_json::json!({ "shard": 3 }))
            .unwrap();
        let typed = erased.request.downcast_ref::<Reindex>().unwrap();
        assert_eq!(typed.shard, 3);
        assert!(registry.has("search.reindex"));
        assert_eq!(registry.len(), 1);
    }
}
