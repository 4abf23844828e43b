//! # Handler Registry
//!
//! Maps a concrete message type (`TypeId`) to every handler registered for it.
//! Handlers are stored type-erased; the body is downcast back to `M` at
//! dispatch time.

use crate::error::HandlerError;
use crate::messaging::Message;
use crate::pipeline::MessageContext;
use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Application logic for one message type
#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: &M, ctx: &mut MessageContext) -> Result<(), HandlerError>;
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    fn handler_name(&self) -> &'static str;

    async fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerError>;
}

struct TypedHandler<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for TypedHandler<M, H>
where
    M: Message,
    H: Handler<M>,
{
    fn handler_name(&self) -> &'static str {
        type_name::<H>()
    }

    async fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let body = ctx.body_handle();
        let message = body
            .downcast_ref::<M>()
            .ok_or_else(|| HandlerError::NoHandler {
                type_name: ctx.message_type().type_name().to_string(),
            })?;
        self.handler.handle(message, ctx).await
    }
}

/// Registered handlers keyed by message type, in registration order
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, H>(&mut self, handler: H)
    where
        M: Message,
        H: Handler<M>,
    {
        debug!(
            message_type = type_name::<M>(),
            handler = type_name::<H>(),
            "Registered message handler"
        );
        self.handlers
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(TypedHandler {
                handler,
                _message: PhantomData,
            }));
    }

    pub(crate) fn handlers_for(&self, type_id: TypeId) -> &[Arc<dyn ErasedHandler>] {
        self.handlers
            .get(&type_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handler_count(&self, type_id: TypeId) -> usize {
        self.handlers_for(type_id).len()
    }

    pub fn handler_names(&self, type_id: TypeId) -> Vec<&'static str> {
        self.handlers_for(type_id)
            .iter()
            .map(|handler| handler.handler_name())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.handlers.len())
            .finish()
    }
}
