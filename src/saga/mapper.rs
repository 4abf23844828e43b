//! Message-to-saga-key correlation.

use super::{Saga, SagaKey};
use crate::error::HandlerError;
use crate::messaging::Message;
use dashmap::DashMap;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A message reached a saga that never declared how to key it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("saga '{saga}' has no key mapping for message type {message_type}")]
pub struct SagaMapError {
    pub saga: String,
    pub message_type: String,
}

type KeyFn = Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;

/// Key extractors for one saga type, filled by [`Saga::configure_message_keys`]
pub struct SagaKeyMapper {
    saga: &'static str,
    keys: HashMap<TypeId, KeyFn>,
}

impl SagaKeyMapper {
    pub fn new(saga: &'static str) -> Self {
        Self {
            saga,
            keys: HashMap::new(),
        }
    }

    /// Declare how messages of type `M` find their saga instance
    pub fn map<M, F>(&mut self, key: F) -> &mut Self
    where
        M: Message,
        F: Fn(&M) -> String + Send + Sync + 'static,
    {
        self.keys.insert(
            TypeId::of::<M>(),
            Arc::new(move |body: &dyn Any| body.downcast_ref::<M>().map(&key)),
        );
        self
    }

    pub fn is_mapped<M: Message>(&self) -> bool {
        self.keys.contains_key(&TypeId::of::<M>())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Correlation key for `message`
    pub fn key_of<M: Message>(&self, message: &M) -> Result<SagaKey, HandlerError> {
        let raw = self
            .keys
            .get(&TypeId::of::<M>())
            .and_then(|key| key(message as &dyn Any))
            .ok_or_else(|| SagaMapError {
                saga: self.saga.to_string(),
                message_type: type_name::<M>().to_string(),
            })?;
        SagaKey::new(raw).map_err(HandlerError::InvalidSagaKey)
    }
}

impl std::fmt::Debug for SagaKeyMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaKeyMapper")
            .field("saga", &self.saga)
            .field("mapped_types", &self.keys.len())
            .finish()
    }
}

/// One configured mapper per saga type, built on first use
#[derive(Debug, Default)]
pub struct SagaMapperCache {
    mappers: DashMap<TypeId, Arc<SagaKeyMapper>>,
}

impl SagaMapperCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mapper for `S`, running `configure_message_keys` only the first time
    pub fn mapper_for<S: Saga>(&self, saga: &S) -> Arc<SagaKeyMapper> {
        if let Some(mapper) = self.mappers.get(&TypeId::of::<S>()) {
            return Arc::clone(mapper.value());
        }

        // entry() holds the shard lock, so concurrent first uses configure once
        let mapper = self.mappers.entry(TypeId::of::<S>()).or_insert_with(|| {
            let mut mapper = SagaKeyMapper::new(S::saga_name());
            saga.configure_message_keys(&mut mapper);
            debug!(
                saga = S::saga_name(),
                mapped_types = mapper.len(),
                "🔑 Configured saga key mapping"
            );
            Arc::new(mapper)
        });
        Arc::clone(mapper.value())
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}
