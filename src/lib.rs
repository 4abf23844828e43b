#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Workbus Core
//!
//! Durable message bus on top of a relational store: queues, publish/subscribe
//! topics and long-running sagas, with at-least-once delivery.
//!
//! ## Overview
//!
//! Producers write rows into per-queue and per-topic tables. One polling worker
//! per queue or subscription claims the next eligible row inside a unit of
//! work, runs it through an ordered pipeline of interceptors into the
//! registered handlers and sagas, and records a single outcome in the same
//! transaction: completed, rescheduled for retry, or failed with the error
//! captured in its headers.
//!
//! ## Module Organization
//!
//! - [`validation`] - Validated queue, topic, subscriber and saga names
//! - [`messaging`] - Message capabilities, headers and persisted rows
//! - [`identity`] - Class identity ⇄ type resolution with caching
//! - [`serialization`] - Body and header codecs
//! - [`retry`] - Retry strategies and exponential backoff
//! - [`resilience`] - Circuit breakers around the store
//! - [`pipeline`] - Priority-ordered interceptor chain
//! - [`registry`] - Message type → handler registry
//! - [`saga`] - Saga correlation, locking and persistence
//! - [`store`] - `MessageStore` / `UnitOfWork` with memory and PostgreSQL backends
//! - [`orchestration`] - Bus assembly, producer, processor and workers
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use workbus::messaging::{Message, QueueMessage};
//! use workbus::orchestration::{EnqueueOptions, MessageBus};
//! use workbus::pipeline::MessageContext;
//! use workbus::registry::Handler;
//! use workbus::store::MemoryMessageStore;
//! use workbus::validation::QueueName;
//! use workbus::HandlerError;
//!
//! #[derive(Serialize, Deserialize)]
//! struct ShipOrder {
//!     order_id: u64,
//! }
//!
//! impl Message for ShipOrder {
//!     fn class_identity() -> &'static str {
//!         "orders.ship"
//!     }
//! }
//! impl QueueMessage for ShipOrder {}
//!
//! struct Shipper;
//!
//! #[async_trait]
//! impl Handler<ShipOrder> for Shipper {
//!     async fn handle(&self, order: &ShipOrder, _ctx: &mut MessageContext) -> Result<(), HandlerError> {
//!         println!("shipping {}", order.order_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> workbus::Result<()> {
//! let orders = QueueName::new("orders")?;
//! let bus = MessageBus::builder(Arc::new(MemoryMessageStore::new()))
//!     .handle::<ShipOrder, _>(Shipper)
//!     .queue(orders.clone())
//!     .build()?;
//!
//! bus.producer()
//!     .enqueue(&orders, &ShipOrder { order_id: 42 }, EnqueueOptions::default())
//!     .await?;
//!
//! let handle = bus.start().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod saga;
pub mod serialization;
pub mod store;
pub mod validation;

pub use config::{BusConfig, ConfigManager, ConfigurationError};
pub use error::{BusError, ErrorCategory, HandlerError, Result};
pub use messaging::{Headers, Message, QueueMessage, SubscribedMessage};
pub use orchestration::{
    EnqueueOptions, MessageBus, MessageBusBuilder, ProcessOutcome, Producer, PublishOptions,
};
pub use pipeline::{MessageContext, PipelineStep};
pub use registry::Handler;
pub use saga::{Saga, SagaHandler, SagaState, SagaTransition};
pub use store::{MessageStore, MessageTarget, UnitOfWork};
pub use validation::{MessageId, QueueName, SagaName, SubscriberName, TopicName, ValidationError};
