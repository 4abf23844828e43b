//! # System Constants
//!
//! Operational boundaries shared by the store adapters, the validation layer and
//! the orchestration loop.

/// Breaker keys for the protected resources
pub mod breakers {
    /// Message claim/complete/enqueue traffic
    pub const MESSAGE_STORE: &str = "message_store";
    /// Saga lock acquisition and release
    pub const SAGA_STORE: &str = "saga_store";
}

/// Table naming conventions for the relational store
pub mod tables {
    pub const PENDING_SUFFIX: &str = "_pending";
    pub const COMPLETED_SUFFIX: &str = "_completed";
    pub const FAILED_SUFFIX: &str = "_failed";
    pub const SUBSCRIBED_INFIX: &str = "_subscribed";
    pub const SAGA_DATA_SUFFIX: &str = "_sagadata";
    pub const SUBSCRIPTIONS_TABLE: &str = "workbus_subscriptions";
}

/// Limits enforced on validated values
pub mod limits {
    /// Longest queue/topic/subscriber/saga name accepted. Leaves room for the
    /// longest table suffix inside PostgreSQL's 63 byte identifier limit.
    pub const MAX_NAME_LENGTH: usize = 40;

    /// Longest saga correlation key accepted
    pub const MAX_SAGA_KEY_LENGTH: usize = 500;

    /// Retry counter is persisted as an unsigned byte
    pub const MAX_RETRIES_STORED: i16 = u8::MAX as i16;

    /// Unrecognized class identities remembered by the resolver cache; later
    /// unknown identities are resolved uncached
    pub const MAX_CACHED_MISSES: usize = 1_024;
}

/// Well-known user header names
pub mod headers {
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CONVERSATION_ID: &str = "conversation-id";
}
