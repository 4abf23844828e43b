//! # Messaging Module
//!
//! Message capabilities, header documents and the persisted row shapes that
//! travel between producers, the store and the orchestrator.

pub mod headers;
pub mod message;
pub mod records;

pub use headers::{Diagnostics, Headers, UserHeaders};
pub use message::{
    Destination, Message, MessageKind, OutgoingMessage, QueueMessage, SubscribedMessage,
};
pub use records::{
    ClaimedMessage, MessageState, NewMessage, QueueMessageRecord, SubscribedMessageRecord,
};
