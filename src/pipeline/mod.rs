//! # Pipeline Engine
//!
//! An onion of [`PipelineStep`]s around a terminal [`Dispatcher`]. Steps are
//! stable-sorted by ascending priority when the [`Pipeline`] is built, so the
//! lowest priority is the outermost layer: priorities `[3, 1, 2]` run as
//! `1, 2, 3, handler, 3, 2, 1`. A step that returns without calling
//! [`Next::run`] short-circuits everything inside it.
//!
//! One pipeline is built per worker. Step instances are shared `Arc`s, so any
//! state they keep must use interior mutability.

mod context;
mod steps;

pub use context::MessageContext;
pub(crate) use context::{HeldSagaLock, SagaWrite};
pub use steps::LoggingStep;

use crate::error::HandlerError;
use async_trait::async_trait;
use std::sync::Arc;

/// Innermost element of a pipeline
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, ctx: &mut MessageContext) -> Result<(), HandlerError>;
}

/// Interceptor wrapping everything registered at a higher priority
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Lower values run further out
    fn priority(&self) -> i32;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), HandlerError>;
}

/// The remainder of the chain after the current step
pub struct Next<'a> {
    steps: &'a [Arc<dyn PipelineStep>],
    terminal: &'a dyn Dispatcher,
}

impl<'a> Next<'a> {
    /// Run the inner steps and the dispatcher
    pub async fn run(self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        match self.steps.split_first() {
            Some((step, rest)) => {
                step.invoke(
                    ctx,
                    Next {
                        steps: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.dispatch(ctx).await,
        }
    }
}

/// Ordered steps plus the terminal dispatcher
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    terminal: Arc<dyn Dispatcher>,
}

impl Pipeline {
    pub fn new(mut steps: Vec<Arc<dyn PipelineStep>>, terminal: Arc<dyn Dispatcher>) -> Self {
        // stable: equal priorities keep registration order
        steps.sort_by_key(|step| step.priority());
        Self { steps, terminal }
    }

    pub async fn run(&self, ctx: &mut MessageContext) -> Result<(), HandlerError> {
        Next {
            steps: &self.steps,
            terminal: self.terminal.as_ref(),
        }
        .run(ctx)
        .await
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}
