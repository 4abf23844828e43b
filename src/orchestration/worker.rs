//! Polling loop driving one [`MessageProcessor`].

use super::processor::{MessageProcessor, ProcessOutcome};
use crate::config::PollingConfig;
use crate::error::BusError;
use crate::logging::duration_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Runs until the shutdown signal flips to `true` or its sender is dropped
pub struct Worker {
    processor: Arc<MessageProcessor>,
    polling: PollingConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        processor: Arc<MessageProcessor>,
        polling: PollingConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            processor,
            polling,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let target = self.processor.target().to_string();
        info!(
            target = %target,
            idle_delay_ms = self.polling.idle_delay_ms,
            "🚀 Starting message processing loop"
        );

        let mut error_delay = self.polling.error_delay();
        let mut processed: u64 = 0;

        while !*self.shutdown.borrow() {
            let wait = match self.processor.process_next().await {
                Ok(ProcessOutcome::Idle) => {
                    error_delay = self.polling.error_delay();
                    Some(self.polling.idle_delay())
                }
                Ok(outcome) => {
                    processed += 1;
                    error_delay = self.polling.error_delay();
                    debug!(target = %target, outcome = ?outcome, "Processed message");
                    // more work is likely, poll again immediately
                    None
                }
                Err(BusError::CircuitOpen {
                    component,
                    retry_after,
                }) => {
                    warn!(
                        target = %target,
                        component = %component,
                        retry_after_ms = duration_ms(retry_after),
                        "⚡ Circuit open, pausing worker"
                    );
                    Some(retry_after.max(Duration::from_millis(1)))
                }
                Err(e) => {
                    error!(
                        target = %target,
                        category = %e.category(),
                        error = %e,
                        backoff_ms = duration_ms(error_delay),
                        "Error in message processing loop"
                    );
                    let wait = error_delay;
                    error_delay = next_error_delay(error_delay, self.polling.max_error_delay());
                    Some(wait)
                }
            };

            if let Some(wait) = wait {
                // Wait with ability to be interrupted by shutdown
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {},
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            debug!(target = %target, "Shutdown sender dropped");
                            break;
                        }
                    }
                }
            }
        }

        info!(target = %target, processed, "🛑 Message processing loop ended");
    }
}

/// Doubling back-off, capped
fn next_error_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
