use super::{MessageContext, Next, PipelineStep};
use crate::error::HandlerError;
use crate::logging::duration_ms;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, warn};

/// Outermost step by default: logs each dispatch with its duration
#[derive(Debug, Clone)]
pub struct LoggingStep {
    priority: i32,
}

impl LoggingStep {
    pub fn new() -> Self {
        Self {
            priority: i32::MIN,
        }
    }

    pub fn with_priority(priority: i32) -> Self {
        Self { priority }
    }
}

impl Default for LoggingStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStep for LoggingStep {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "logging"
    }

    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), HandlerError> {
        let started = Instant::now();
        debug!(
            message_id = %ctx.message_id,
            message_class = %ctx.headers.message_class,
            target = %ctx.target,
            retries = ctx.retries,
            "📨 Dispatching message"
        );

        let result = next.run(ctx).await;
        let elapsed_ms = duration_ms(started.elapsed());

        match &result {
            Ok(()) => debug!(
                message_id = %ctx.message_id,
                duration_ms = elapsed_ms,
                outgoing = ctx.outgoing().len(),
                "✅ Message dispatched"
            ),
            Err(error) => warn!(
                message_id = %ctx.message_id,
                duration_ms = elapsed_ms,
                category = %error.category(),
                error = %error,
                "⚠️ Message dispatch failed"
            ),
        }
        result
    }
}
