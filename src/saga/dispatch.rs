//! Type-erased saga dispatch and the registry the bus builder fills.

use super::{Saga, SagaHandler, SagaKey, SagaMapperCache, SagaMetadata, SagaRecord, SagaState};
use crate::config::ConfigurationError;
use crate::error::{BusError, HandlerError};
use crate::identity::TypeRegistry;
use crate::messaging::{Message, MessageKind, QueueMessage, SubscribedMessage};
use crate::pipeline::MessageContext;
use crate::serialization::{Serializer, SerializerExt};
use crate::validation::SagaName;
use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Result of running saga logic for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SagaOutcome {
    pub data: String,
    pub complete: bool,
}

#[async_trait]
pub(crate) trait SagaDispatch: Send + Sync {
    fn saga_name(&self) -> &SagaName;

    /// Whether this message type may create a new instance
    fn starts(&self) -> bool;

    fn correlate(
        &self,
        mappers: &SagaMapperCache,
        ctx: &MessageContext,
    ) -> Result<SagaKey, HandlerError>;

    /// Serialized default data for a new instance
    fn initial_data(&self, serializer: &dyn Serializer) -> Result<String, HandlerError>;

    async fn invoke(
        &self,
        ctx: &mut MessageContext,
        key: SagaKey,
        record: &SagaRecord,
        metadata: SagaMetadata,
        is_new: bool,
        serializer: &dyn Serializer,
    ) -> Result<SagaOutcome, HandlerError>;
}

struct TypedSagaDispatch<S, M> {
    saga: Arc<S>,
    name: SagaName,
    starts: bool,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> TypedSagaDispatch<S, M>
where
    M: Message,
{
    fn message<'b>(&self, body: &'b crate::identity::MessageBody) -> Result<&'b M, HandlerError> {
        body.downcast_ref::<M>().ok_or_else(|| HandlerError::NoHandler {
            type_name: type_name::<M>().to_string(),
        })
    }
}

#[async_trait]
impl<S, M> SagaDispatch for TypedSagaDispatch<S, M>
where
    S: SagaHandler<M>,
    M: Message,
{
    fn saga_name(&self) -> &SagaName {
        &self.name
    }

    fn starts(&self) -> bool {
        self.starts
    }

    fn correlate(
        &self,
        mappers: &SagaMapperCache,
        ctx: &MessageContext,
    ) -> Result<SagaKey, HandlerError> {
        let body = ctx.body_handle();
        let message = self.message(&body)?;
        mappers.mapper_for(self.saga.as_ref()).key_of(message)
    }

    fn initial_data(&self, serializer: &dyn Serializer) -> Result<String, HandlerError> {
        Ok(serializer.serialize(&S::Data::default())?)
    }

    async fn invoke(
        &self,
        ctx: &mut MessageContext,
        key: SagaKey,
        record: &SagaRecord,
        metadata: SagaMetadata,
        is_new: bool,
        serializer: &dyn Serializer,
    ) -> Result<SagaOutcome, HandlerError> {
        let body = ctx.body_handle();
        let message = self.message(&body)?;
        let data: S::Data = serializer.deserialize(&record.data)?;

        let state = SagaState {
            key,
            saga_id: record.saga_id,
            data,
            complete: false,
            started: metadata.started,
            last_message_time: metadata.last_message_time,
            is_new,
        };

        let transition = SagaHandler::<M>::handle(self.saga.as_ref(), message, state, ctx).await?;
        for outgoing in transition.outgoing {
            ctx.send(outgoing);
        }

        Ok(SagaOutcome {
            data: serializer.serialize(&transition.state.data)?,
            complete: transition.state.complete,
        })
    }
}

/// Saga dispatches keyed by message type
#[derive(Default)]
pub struct SagaRegistry {
    dispatches: HashMap<TypeId, Vec<Arc<dyn SagaDispatch>>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dispatches_for(&self, type_id: TypeId) -> &[Arc<dyn SagaDispatch>] {
        self.dispatches
            .get(&type_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn saga_count(&self, type_id: TypeId) -> usize {
        self.dispatches_for(type_id).len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    fn add(
        &mut self,
        type_id: TypeId,
        message_type: &'static str,
        dispatch: Arc<dyn SagaDispatch>,
    ) -> Result<(), ConfigurationError> {
        let entries = self.dispatches.entry(type_id).or_default();
        if entries
            .iter()
            .any(|existing| existing.saga_name() == dispatch.saga_name())
        {
            return Err(ConfigurationError::validation_error(format!(
                "saga '{}' registers message type {message_type} more than once",
                dispatch.saga_name()
            )));
        }
        entries.push(dispatch);
        Ok(())
    }
}

impl std::fmt::Debug for SagaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRegistry")
            .field("message_types", &self.dispatches.len())
            .finish()
    }
}

/// Declares which messages start or continue one saga type. Registration
/// problems are collected and reported when the bus is built.
pub struct SagaRegistrar<'a, S: Saga> {
    saga: Arc<S>,
    name: SagaName,
    types: &'a mut TypeRegistry,
    sagas: &'a mut SagaRegistry,
    errors: &'a mut Vec<BusError>,
}

impl<'a, S: Saga> SagaRegistrar<'a, S> {
    pub(crate) fn new(
        saga: Arc<S>,
        name: SagaName,
        types: &'a mut TypeRegistry,
        sagas: &'a mut SagaRegistry,
        errors: &'a mut Vec<BusError>,
    ) -> Self {
        Self {
            saga,
            name,
            types,
            sagas,
            errors,
        }
    }

    /// `M` may create a new instance
    pub fn starts_with<M>(&mut self) -> &mut Self
    where
        M: QueueMessage,
        S: SagaHandler<M>,
    {
        self.add::<M>(MessageKind::Queue, true)
    }

    /// `M` continues an existing instance
    pub fn handles<M>(&mut self) -> &mut Self
    where
        M: QueueMessage,
        S: SagaHandler<M>,
    {
        self.add::<M>(MessageKind::Queue, false)
    }

    pub fn starts_with_subscribed<M>(&mut self) -> &mut Self
    where
        M: SubscribedMessage,
        S: SagaHandler<M>,
    {
        self.add::<M>(MessageKind::Subscribed, true)
    }

    pub fn handles_subscribed<M>(&mut self) -> &mut Self
    where
        M: SubscribedMessage,
        S: SagaHandler<M>,
    {
        self.add::<M>(MessageKind::Subscribed, false)
    }

    fn add<M>(&mut self, kind: MessageKind, starts: bool) -> &mut Self
    where
        M: Message,
        S: SagaHandler<M>,
    {
        if let Err(error) = self.types.register::<M>(kind) {
            self.errors.push(error.into());
            return self;
        }

        let dispatch = Arc::new(TypedSagaDispatch::<S, M> {
            saga: Arc::clone(&self.saga),
            name: self.name.clone(),
            starts,
            _message: PhantomData,
        });
        match self.sagas.add(TypeId::of::<M>(), type_name::<M>(), dispatch) {
            Ok(()) => debug!(
                saga = %self.name,
                message_type = type_name::<M>(),
                starts,
                "Registered saga message"
            ),
            Err(error) => self.errors.push(error.into()),
        }
        self
    }
}
