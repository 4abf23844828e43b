//! # Bus Assembly
//!
//! [`MessageBusBuilder`] collects message types, handlers, sagas, pipeline
//! steps and the queues/subscriptions to consume, then validates everything at
//! once in [`MessageBusBuilder::build`]. Registration mistakes are reported
//! there as the first collected error, before any worker runs.

use super::dispatcher::HandlerDispatcher;
use super::failed::FailedMessageHandler;
use super::processor::{MessageProcessor, ProcessorComponents};
use super::producer::Producer;
use super::worker::Worker;
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::identity::{CacheStats, CachedClassResolver, ClassResolver, TypeRegistry};
use crate::messaging::{MessageKind, QueueMessage, SubscribedMessage};
use crate::pipeline::{Dispatcher, Pipeline, PipelineStep};
use crate::registry::{Handler, HandlerRegistry};
use crate::resilience::{BreakerKey, CircuitBreakerManager};
use crate::retry::{FailFastStrategy, RetryStrategy};
use crate::saga::{Saga, SagaProcessor, SagaRegistrar, SagaRegistry};
use crate::serialization::{JsonSerializer, Serializer};
use crate::store::{MessageStore, MessageTarget};
use crate::validation::{QueueName, SagaName, SubscriberName, TopicName};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Collects the bus definition
pub struct MessageBusBuilder {
    store: Arc<dyn MessageStore>,
    config: BusConfig,
    serializer: Arc<dyn Serializer>,
    types: TypeRegistry,
    handlers: HandlerRegistry,
    sagas: SagaRegistry,
    steps: Vec<Arc<dyn PipelineStep>>,
    targets: Vec<MessageTarget>,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    retry_overrides: HashMap<MessageTarget, Arc<dyn RetryStrategy>>,
    failed_handlers: HashMap<MessageTarget, Arc<dyn FailedMessageHandler>>,
    errors: Vec<BusError>,
}

impl MessageBusBuilder {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            config: BusConfig::default(),
            serializer: Arc::new(JsonSerializer),
            types: TypeRegistry::new(),
            handlers: HandlerRegistry::new(),
            sagas: SagaRegistry::new(),
            steps: Vec::new(),
            targets: Vec::new(),
            retry_strategy: None,
            retry_overrides: HashMap::new(),
            failed_handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Make `M` sendable to queues without handling it in this process
    pub fn queue_message<M: QueueMessage>(mut self) -> Self {
        self.register_type::<M>(MessageKind::Queue);
        self
    }

    /// Make `M` publishable without handling it in this process
    pub fn subscribed_message<M: SubscribedMessage>(mut self) -> Self {
        self.register_type::<M>(MessageKind::Subscribed);
        self
    }

    /// Handle queue message `M`. Several handlers may share a type; they run
    /// in registration order.
    pub fn handle<M, H>(mut self, handler: H) -> Self
    where
        M: QueueMessage,
        H: Handler<M>,
    {
        if self.register_type::<M>(MessageKind::Queue) {
            self.handlers.register::<M, H>(handler);
        }
        self
    }

    /// Handle subscribed message `M`
    pub fn handle_subscribed<M, H>(mut self, handler: H) -> Self
    where
        M: SubscribedMessage,
        H: Handler<M>,
    {
        if self.register_type::<M>(MessageKind::Subscribed) {
            self.handlers.register::<M, H>(handler);
        }
        self
    }

    /// Register saga `S`, declaring its messages in `configure`
    pub fn saga<S, F>(mut self, saga: S, configure: F) -> Self
    where
        S: Saga,
        F: FnOnce(&mut SagaRegistrar<'_, S>),
    {
        let name = match SagaName::new(S::saga_name()) {
            Ok(name) => name,
            Err(error) => {
                self.errors.push(error.into());
                return self;
            }
        };
        let mut registrar = SagaRegistrar::new(
            Arc::new(saga),
            name,
            &mut self.types,
            &mut self.sagas,
            &mut self.errors,
        );
        configure(&mut registrar);
        self
    }

    pub fn pipeline_step(mut self, step: impl PipelineStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Consume `queue` with one worker
    pub fn queue(mut self, queue: QueueName) -> Self {
        self.add_target(MessageTarget::queue(queue));
        self
    }

    /// Consume `topic` as `subscriber`; the subscription is activated when
    /// the bus starts
    pub fn subscription(mut self, topic: TopicName, subscriber: SubscriberName) -> Self {
        self.add_target(MessageTarget::subscriber(topic, subscriber));
        self
    }

    /// Replace the default retry strategy for every target
    pub fn retry_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.retry_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn retry_strategy_for(
        mut self,
        target: MessageTarget,
        strategy: impl RetryStrategy + 'static,
    ) -> Self {
        self.retry_overrides.insert(target, Arc::new(strategy));
        self
    }

    pub fn failed_message_handler_for(
        mut self,
        target: MessageTarget,
        handler: impl FailedMessageHandler + 'static,
    ) -> Self {
        self.failed_handlers.insert(target, Arc::new(handler));
        self
    }

    fn register_type<M: crate::messaging::Message>(&mut self, kind: MessageKind) -> bool {
        match self.types.register::<M>(kind) {
            Ok(()) => true,
            Err(error) => {
                self.errors.push(error.into());
                false
            }
        }
    }

    fn add_target(&mut self, target: MessageTarget) {
        let valid = match &target {
            MessageTarget::Queue(queue) => queue.value().map(|_| ()),
            MessageTarget::Subscriber { topic, subscriber } => {
                topic.value().and_then(|_| subscriber.value()).map(|_| ())
            }
        };
        if let Err(error) = valid {
            self.errors.push(error.into());
            return;
        }
        if self.targets.contains(&target) {
            warn!(target = %target, "Target registered more than once, ignoring duplicate");
            return;
        }
        self.targets.push(target);
    }

    /// Validate the definition and wire every component
    pub fn build(mut self) -> Result<MessageBus> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        self.config.validate()?;

        for target in self
            .retry_overrides
            .keys()
            .chain(self.failed_handlers.keys())
        {
            if !self.targets.contains(target) {
                return Err(BusError::Configuration(
                    crate::config::ConfigurationError::validation_error(format!(
                        "{target} has per-target settings but is not consumed by this bus"
                    )),
                ));
            }
        }

        let breakers = Arc::new(self.config.circuit_breakers.to_manager());
        let message_breaker = breakers.get_circuit_breaker(&BreakerKey::MESSAGE_STORE);
        let saga_breaker = breakers.get_circuit_breaker(&BreakerKey::SAGA_STORE);

        let resolver = Arc::new(CachedClassResolver::new(self.types));
        let class_resolver: Arc<dyn ClassResolver> = resolver.clone();

        let saga_processor = Arc::new(SagaProcessor::new(
            Arc::clone(&self.store),
            saga_breaker,
            Arc::clone(&self.serializer),
            self.config.saga.lock_lease(),
        ));
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(HandlerDispatcher::new(
            Arc::new(self.handlers),
            Arc::new(self.sagas),
            Arc::clone(&saga_processor),
        ));

        let default_strategy: Arc<dyn RetryStrategy> = self
            .retry_strategy
            .unwrap_or_else(|| Arc::new(FailFastStrategy::new(self.config.retry_strategy())));

        let processors = self
            .targets
            .iter()
            .map(|target| {
                let strategy = self
                    .retry_overrides
                    .get(target)
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&default_strategy));
                Arc::new(MessageProcessor::new(
                    target.clone(),
                    Pipeline::new(self.steps.clone(), Arc::clone(&dispatcher)),
                    strategy,
                    self.failed_handlers.get(target).cloned(),
                    ProcessorComponents {
                        store: Arc::clone(&self.store),
                        breaker: Arc::clone(&message_breaker),
                        resolver: Arc::clone(&class_resolver),
                        serializer: Arc::clone(&self.serializer),
                        saga_processor: Arc::clone(&saga_processor),
                        saga_retry_delay: self.config.saga.lock_retry_delay(),
                        subscription_retention: self.config.subscriptions.retention(),
                    },
                ))
            })
            .collect::<Vec<_>>();

        let producer = Producer::new(
            Arc::clone(&self.store),
            class_resolver,
            self.serializer,
            message_breaker,
            self.config.subscriptions.retention(),
        );

        info!(
            targets = processors.len(),
            message_types = resolver.inner().len(),
            pipeline_steps = self.steps.len(),
            "✅ Message bus assembled"
        );

        Ok(MessageBus {
            config: self.config,
            producer,
            processors,
            breakers,
            resolver,
        })
    }
}

/// An assembled bus, ready to produce and to start its workers
pub struct MessageBus {
    config: BusConfig,
    producer: Producer,
    processors: Vec<Arc<MessageProcessor>>,
    breakers: Arc<CircuitBreakerManager>,
    resolver: Arc<CachedClassResolver<TypeRegistry>>,
}

impl MessageBus {
    pub fn builder(store: Arc<dyn MessageStore>) -> MessageBusBuilder {
        MessageBusBuilder::new(store)
    }

    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    /// Processor consuming `target`, for driving messages one at a time
    pub fn processor_for(&self, target: &MessageTarget) -> Option<Arc<MessageProcessor>> {
        self.processors
            .iter()
            .find(|processor| processor.target() == target)
            .cloned()
    }

    pub fn targets(&self) -> Vec<&MessageTarget> {
        self.processors.iter().map(|p| p.target()).collect()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn resolver_stats(&self) -> CacheStats {
        self.resolver.stats()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Activate subscriptions, then spawn one worker per target
    pub async fn start(&self) -> Result<BusHandle> {
        for processor in &self.processors {
            if let MessageTarget::Subscriber { topic, subscriber } = processor.target() {
                self.producer.subscribe(topic, subscriber).await?;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self
            .processors
            .iter()
            .map(|processor| {
                let worker = Worker::new(
                    Arc::clone(processor),
                    self.config.polling.clone(),
                    shutdown_rx.clone(),
                );
                (processor.target().to_string(), tokio::spawn(worker.run()))
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), "🚀 Message bus started");
        Ok(BusHandle {
            shutdown_tx,
            workers,
        })
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("targets", &self.targets())
            .field("producer", &self.producer)
            .finish()
    }
}

/// Running workers. Dropping the handle without calling
/// [`BusHandle::shutdown`] also stops them, at their next wait.
#[derive(Debug)]
pub struct BusHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl BusHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait for in-flight messages to finish
    pub async fn shutdown(self) -> Result<()> {
        info!(workers = self.workers.len(), "🛑 Shutting down message bus");
        // receivers are held by the workers; a send error only means all exited
        let _ = self.shutdown_tx.send(true);

        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        let results = join_all(handles).await;

        let mut first_error = None;
        for (worker, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                warn!(worker = %worker, error = %e, "Worker terminated abnormally");
                first_error.get_or_insert(BusError::WorkerFailed {
                    worker,
                    reason: e.to_string(),
                });
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
