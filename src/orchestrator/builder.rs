use super::{BatchOrchestrator, FailedBatchRef};
use crate::classify::{RuleBasedClassifier, SharedClassifier};
use crate::config::RuntimeConfig;
use crate::events::{noop_sink, SharedEventSink};
use crate::pool::{ConnectionPool, ResourceFactory};
use crate::recovery::{CheckpointStore, ConsistencySource, RecoveryManager};
use crate::resilience::{CircuitBreakerRegistry, DeadLetterQueue, RetryCoordinator};
use crate::sizing::{BatchSizer, LoadProbe, SizingPolicy};
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Wires the components of a [`BatchOrchestrator`] from one [`RuntimeConfig`].
///
/// ```rust,no_run
/// use batchline::{BatchOrchestrator, RuntimeConfig};
/// use batchline::pool::NoopResourceFactory;
///
/// # fn main() -> batchline::Result<()> {
/// let orchestrator = BatchOrchestrator::builder(NoopResourceFactory)
///     .with_config(RuntimeConfig::default())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct BatchOrchestratorBuilder<F: ResourceFactory> {
    factory: F,
    config: RuntimeConfig,
    classifier: Option<SharedClassifier>,
    store: Option<Arc<dyn CheckpointStore>>,
    events: Option<SharedEventSink>,
    load_probe: Option<Arc<dyn LoadProbe>>,
    sizing_policy: Option<Arc<dyn SizingPolicy>>,
    consistency_source: Option<Arc<dyn ConsistencySource>>,
    cancel: Option<CancellationToken>,
}

impl<F: ResourceFactory> BatchOrchestratorBuilder<F> {
    pub(super) fn new(factory: F) -> Self {
        Self {
            factory,
            config: RuntimeConfig::default(),
            classifier: None,
            store: None,
            events: None,
            load_probe: None,
            sizing_policy: None,
            consistency_source: None,
            cancel: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_classifier(mut self, classifier: SharedClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: SharedEventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_load_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.load_probe = Some(probe);
        self
    }

    pub fn with_sizing_policy(mut self, policy: Arc<dyn SizingPolicy>) -> Self {
        self.sizing_policy = Some(policy);
        self
    }

    /// Source for the periodic checks started by [`BatchOrchestrator::start`]
    /// when `consistency.enabled` is set.
    pub fn with_consistency_source(mut self, source: Arc<dyn ConsistencySource>) -> Self {
        self.consistency_source = Some(source);
        self
    }

    /// Token that stops dispatch of new batches when cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate the configuration and construct every component.
    pub fn build(self) -> Result<BatchOrchestrator<F>> {
        self.config.validate()?;
        let config = self.config;
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(RuleBasedClassifier::new()));
        let events = self.events.unwrap_or_else(noop_sink);

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let retry = Arc::new(
            RetryCoordinator::new(breakers, classifier.clone()).with_events(events.clone()),
        );

        let mut recovery = RecoveryManager::new(classifier)
            .with_config(config.recovery.clone())
            .with_retry_coordinator(retry.clone())
            .with_events(events.clone());
        if let Some(store) = self.store {
            recovery = recovery.with_checkpoint_store(store);
        }

        let sizer = match self.sizing_policy {
            Some(policy) => BatchSizer::with_policy(config.sizing.clone(), policy),
            None => BatchSizer::new(config.sizing.clone()),
        };
        let pool = ConnectionPool::new(self.factory, config.pool.clone()).with_events(events.clone());
        let dead_letters = DeadLetterQueue::<FailedBatchRef>::new(config.dead_letter_capacity);

        Ok(BatchOrchestrator {
            sizer: Arc::new(sizer),
            pool,
            retry,
            recovery: Arc::new(recovery),
            dead_letters: Arc::new(dead_letters),
            load_probe: self.load_probe,
            consistency_source: self.consistency_source,
            events,
            cancel: self.cancel.unwrap_or_default(),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }
}
