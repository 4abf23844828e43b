//! Terminal dispatcher: plain handlers first, then sagas.

use crate::error::HandlerError;
use crate::pipeline::{Dispatcher, MessageContext};
use crate::registry::HandlerRegistry;
use crate::saga::{SagaProcessor, SagaRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs every handler and saga registered for the message's concrete type
#[derive(Debug)]
pub struct HandlerDispatcher {
    handlers: Arc<HandlerRegistry>,
    sagas: Arc<SagaRegistry>,
    saga_processor: Arc<SagaProcessor>,
}

impl HandlerDispatcher {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        sagas: Arc<SagaRegistry>,
        saga_processor: Arc<SagaProcessor>,
    ) -> Self {
        Self {
            handlers,
            sagas,
            saga_processor,
        }
    }
}

#[async_trait]
impl Dispatcher for HandlerDispatcher {
    async fn dispatch(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        let entry = Arc::clone(ctx.message_type());
        let handlers = self.handlers.handlers_for(entry.type_id());
        let sagas = self.sagas.dispatches_for(entry.type_id());

        if handlers.is_empty() && sagas.is_empty() {
            return Err(HandlerError::NoHandler {
                type_name: entry.type_name().to_string(),
            });
        }

        for handler in handlers {
            handler.invoke(ctx).await?;
        }
        for saga in sagas {
            self.saga_processor.process(saga.as_ref(), ctx).await?;
        }
        Ok(())
    }
}
