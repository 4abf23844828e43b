//! # Class Identity Resolution
//!
//! Maps the stable `MessageClass` string stored in headers to a runtime type and
//! back. Types are registered once at startup into a [`TypeRegistry`]; the
//! [`CachedClassResolver`] memoizes lookups (misses included) on top of it.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use workbus::identity::{CachedClassResolver, ClassResolver, TypeRegistry};
//! use workbus::messaging::{Message, QueueMessage};
//!
//! #[derive(Serialize, Deserialize)]
//! struct ShipOrder { order_id: u64 }
//!
//! impl Message for ShipOrder {
//!     fn class_identity() -> &'static str { "orders.ship" }
//! }
//! impl QueueMessage for ShipOrder {}
//!
//! let mut registry = TypeRegistry::new();
//! registry.register_queue_message::<ShipOrder>().unwrap();
//!
//! let resolver = CachedClassResolver::new(registry);
//! assert!(resolver.resolve("orders.ship").is_some());
//! assert!(resolver.resolve("orders.unknown").is_none());
//! ```

mod cache;

pub use cache::{CacheStats, CachedClassResolver};

use crate::messaging::{Message, MessageKind, QueueMessage, SubscribedMessage};
use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Decoded message body, shared between pipeline steps and handlers
pub type MessageBody = Arc<dyn std::any::Any + Send + Sync>;

type DecodeFn = fn(serde_json::Value) -> serde_json::Result<MessageBody>;

/// Stable textual identifier of a message type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassIdentity(String);

impl ClassIdentity {
    pub fn new(identity: impl Into<String>) -> Result<Self, RegistrationError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(RegistrationError::EmptyIdentity);
        }
        Ok(Self(identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised while registering message types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("class identity must not be empty")]
    EmptyIdentity,

    #[error("class identity '{identity}' is already registered to {existing}, cannot register {attempted}")]
    IdentityConflict {
        identity: String,
        existing: &'static str,
        attempted: &'static str,
    },
}

/// Everything the dispatcher needs to know about one registered type
pub struct TypeEntry {
    identity: ClassIdentity,
    type_id: TypeId,
    type_name: &'static str,
    kinds: HashSet<MessageKind>,
    decode: DecodeFn,
}

impl TypeEntry {
    fn of<M: Message>(kind: MessageKind) -> Result<Self, RegistrationError> {
        Ok(Self {
            identity: ClassIdentity::new(M::class_identity())?,
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            kinds: HashSet::from([kind]),
            decode: decode_as::<M>,
        })
    }

    pub fn identity(&self) -> &ClassIdentity {
        &self.identity
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the type carries the marker for `kind`
    pub fn supports(&self, kind: MessageKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Decode a JSON value into this entry's concrete type
    pub fn decode(&self, value: serde_json::Value) -> serde_json::Result<MessageBody> {
        (self.decode)(value)
    }
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("identity", &self.identity)
            .field("type_name", &self.type_name)
            .field("kinds", &self.kinds)
            .finish()
    }
}

fn decode_as<M: Message>(value: serde_json::Value) -> serde_json::Result<MessageBody> {
    let message: M = serde_json::from_value(value)?;
    Ok(Arc::new(message))
}

/// Bidirectional identity ⇄ type lookup
pub trait ClassResolver: Send + Sync {
    /// Type registered under `identity`, if any
    fn resolve(&self, identity: &str) -> Option<Arc<TypeEntry>>;

    /// Identity assigned to the type, if registered
    fn identity_for(&self, type_id: TypeId) -> Option<ClassIdentity>;
}

/// Non-caching resolver backed by the startup registration list
#[derive(Debug, Default)]
pub struct TypeRegistry {
    entries: Vec<Arc<TypeEntry>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_queue_message<M: QueueMessage>(&mut self) -> Result<(), RegistrationError> {
        self.register::<M>(MessageKind::Queue)
    }

    pub fn register_subscribed_message<M: SubscribedMessage>(
        &mut self,
    ) -> Result<(), RegistrationError> {
        self.register::<M>(MessageKind::Subscribed)
    }

    /// Register `M` for `kind`. Registering a type again merges kinds.
    pub(crate) fn register<M: Message>(&mut self, kind: MessageKind) -> Result<(), RegistrationError> {
        let candidate = TypeEntry::of::<M>(kind)?;

        if let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.identity == candidate.identity)
        {
            let existing = &self.entries[position];
            if existing.type_id != candidate.type_id {
                return Err(RegistrationError::IdentityConflict {
                    identity: candidate.identity.0,
                    existing: existing.type_name,
                    attempted: candidate.type_name,
                });
            }

            let mut kinds = existing.kinds.clone();
            kinds.insert(kind);
            self.entries[position] = Arc::new(TypeEntry { kinds, ..candidate });
            return Ok(());
        }

        tracing::debug!(
            identity = %candidate.identity,
            type_name = candidate.type_name,
            kind = %kind,
            "Registered message type"
        );
        self.entries.push(Arc::new(candidate));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ClassResolver for TypeRegistry {
    fn resolve(&self, identity: &str) -> Option<Arc<TypeEntry>> {
        self.entries
            .iter()
            .find(|entry| entry.identity.as_str() == identity)
            .cloned()
    }

    fn identity_for(&self, type_id: TypeId) -> Option<ClassIdentity> {
        self.entries
            .iter()
            .find(|entry| entry.type_id == type_id)
            .map(|entry| entry.identity.clone())
    }
}

impl<R: ClassResolver + ?Sized> ClassResolver for Arc<R> {
    fn resolve(&self, identity: &str) -> Option<Arc<TypeEntry>> {
        (**self).resolve(identity)
    }

    fn identity_for(&self, type_id: TypeId) -> Option<ClassIdentity> {
        (**self).identity_for(type_id)
    }
}
