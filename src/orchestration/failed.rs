//! Notification hook for messages moved to the failed table.

use crate::error::ErrorCategory;
use crate::messaging::Headers;
use crate::store::MessageTarget;
use async_trait::async_trait;
use uuid::Uuid;

/// A message that has just been failed terminally
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    pub target: MessageTarget,
    pub message_id: Uuid,
    pub record_id: i64,
    /// Headers as written to the failed row, `ExceptionDetails` included
    pub headers: Headers,
    pub body: String,
    pub retries: i16,
    pub category: ErrorCategory,
    pub error: String,
}

/// Called after a terminal failure has been committed. Errors here cannot
/// undo the failure, so the hook returns nothing.
#[async_trait]
pub trait FailedMessageHandler: Send + Sync {
    async fn on_failed(&self, failure: &FailedMessage);
}
