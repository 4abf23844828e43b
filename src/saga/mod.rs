//! # Sagas
//!
//! Stateful workflows correlated across messages by a [`SagaKey`]. Each saga
//! type declares how every message it handles maps to a key
//! ([`Saga::configure_message_keys`]); the bus then locks, loads or creates
//! the matching instance, hands its state to the saga as an explicit
//! [`SagaState`], and persists the returned [`SagaTransition`] in the same
//! unit of work as the message completion.
//!
//! An instance is locked while a message is being processed for it. A second
//! message for the same key is deferred until the lock clears or its lease
//! expires.
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use workbus::error::HandlerError;
//! use workbus::messaging::{Message, QueueMessage};
//! use workbus::pipeline::MessageContext;
//! use workbus::saga::{Saga, SagaHandler, SagaKeyMapper, SagaState, SagaTransition};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced { order_id: String }
//! impl Message for OrderPlaced {
//!     fn class_identity() -> &'static str { "orders.placed" }
//! }
//! impl QueueMessage for OrderPlaced {}
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct FulfilmentData { placed: bool }
//!
//! struct Fulfilment;
//!
//! impl Saga for Fulfilment {
//!     type Data = FulfilmentData;
//!     fn saga_name() -> &'static str { "fulfilment" }
//!     fn configure_message_keys(&self, mapper: &mut SagaKeyMapper) {
//!         mapper.map::<OrderPlaced, _>(|m| m.order_id.clone());
//!     }
//! }
//!
//! #[async_trait]
//! impl SagaHandler<OrderPlaced> for Fulfilment {
//!     async fn handle(
//!         &self,
//!         _message: &OrderPlaced,
//!         mut state: SagaState<FulfilmentData>,
//!         _ctx: &MessageContext,
//!     ) -> Result<SagaTransition<FulfilmentData>, HandlerError> {
//!         state.data.placed = true;
//!         Ok(SagaTransition::new(state))
//!     }
//! }
//! ```

mod dispatch;
mod mapper;
mod processor;
mod records;

pub(crate) use dispatch::SagaDispatch;
pub use dispatch::{SagaRegistrar, SagaRegistry};
pub use mapper::{SagaKeyMapper, SagaMapError, SagaMapperCache};
pub use processor::SagaProcessor;
pub use records::{NewSagaRow, SagaKey, SagaMetadata, SagaRecord};

use crate::error::HandlerError;
use crate::messaging::{Message, OutgoingMessage};
use crate::pipeline::MessageContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// A saga type: its persisted data and how messages correlate to instances
pub trait Saga: Send + Sync + 'static {
    type Data: Serialize + DeserializeOwned + Default + Send + Sync + 'static;

    /// Storage name; must satisfy the same rules as queue names
    fn saga_name() -> &'static str;

    /// Called once per saga type, on first use
    fn configure_message_keys(&self, mapper: &mut SagaKeyMapper);
}

/// Saga instance state handed to a handler
#[derive(Debug, Clone, PartialEq)]
pub struct SagaState<D> {
    pub key: SagaKey,
    pub saga_id: Uuid,
    pub data: D,
    /// Once set, the instance is deleted instead of saved
    pub complete: bool,
    pub started: DateTime<Utc>,
    pub last_message_time: DateTime<Utc>,
    /// The instance was created by the current message
    pub is_new: bool,
}

impl<D> SagaState<D> {
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }
}

/// What a saga handler returns: the state to persist and messages to send
#[derive(Debug, Clone, PartialEq)]
pub struct SagaTransition<D> {
    pub state: SagaState<D>,
    pub outgoing: Vec<OutgoingMessage>,
}

impl<D> SagaTransition<D> {
    pub fn new(state: SagaState<D>) -> Self {
        Self {
            state,
            outgoing: Vec::new(),
        }
    }

    pub fn send(mut self, message: OutgoingMessage) -> Self {
        self.outgoing.push(message);
        self
    }
}

/// Saga logic for one message type
#[async_trait]
pub trait SagaHandler<M: Message>: Saga {
    async fn handle(
        &self,
        message: &M,
        state: SagaState<Self::Data>,
        ctx: &MessageContext,
    ) -> Result<SagaTransition<Self::Data>, HandlerError>;
}
