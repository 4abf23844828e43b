//! # Registry Infrastructure
//!
//! Lookup tables assembled once by the bus builder and shared read-only by
//! every worker.
//!
//! ## Available Registries
//!
//! - **HandlerRegistry**: message type to plain handlers
//! - **SagaRegistry** (in [`crate::saga`]): message type to saga dispatches
//! - **TypeRegistry** (in [`crate::identity`]): class identity to message type
//!
//! ## Usage
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use workbus::error::HandlerError;
//! use workbus::messaging::{Message, QueueMessage};
//! use workbus::pipeline::MessageContext;
//! use workbus::registry::{Handler, HandlerRegistry};
//!
//! #[derive(Serialize, Deserialize)]
//! struct ShipOrder { order_id: u64 }
//!
//! impl Message for ShipOrder {
//!     fn class_identity() -> &'static str { "orders.ship" }
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
//! let mut registry = HandlerRegistry::new();
//! registry.register::<ShipOrder, _>(Shipper);
//! ```

pub mod handler_registry;

pub(crate) use handler_registry::ErasedHandler;
pub use handler_registry::{Handler, HandlerRegistry};
