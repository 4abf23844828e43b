//! # Orchestration Engine
//!
//! Message lifecycle: producers write pending rows, one polling [`Worker`] per
//! queue or subscription claims them, and a [`MessageProcessor`] dispatches
//! each through the pipeline and records exactly one terminal outcome.
//!
//! ## Core Components
//!
//! - **MessageBusBuilder / MessageBus**: assembly, validation and worker startup
//! - **Producer**: enqueue, publish, subscribe and unsubscribe
//! - **MessageProcessor**: claim → decode → pipeline → complete, retry or fail
//! - **HandlerDispatcher**: terminal pipeline stage running handlers, then sagas
//! - **Worker**: polling loop with idle delay, error back-off and shutdown
//! - **FailedMessageHandler**: per-target hook after a terminal failure
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use workbus::orchestration::{EnqueueOptions, MessageBus};
//! use workbus::store::MemoryMessageStore;
//! use workbus::validation::QueueName;
//!
//! # async fn example() -> workbus::Result<()> {
//! let queue = QueueName::new("orders")?;
//! let bus = MessageBus::builder(Arc::new(MemoryMessageStore::new()))
//!     .queue(queue)
//!     .build()?;
//!
//! let handle = bus.start().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod dispatcher;
pub mod failed;
pub mod processor;
pub mod producer;
pub mod worker;

pub use bus::{BusHandle, MessageBus, MessageBusBuilder};
pub use dispatcher::HandlerDispatcher;
pub use failed::{FailedMessage, FailedMessageHandler};
pub use processor::{MessageProcessor, ProcessOutcome};
pub use producer::{EnqueueOptions, Producer, PublishOptions};
pub use worker::Worker;
