use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache::{Lookup, MemoCache};
use crate::config::Config;
use crate::engine::{Engine, panic_message};
use crate::entry::{Completer, Status, SubscriptionId, TransformResult};
use crate::error::{ConfigError, TransformError};
use crate::executor::{self, Executor, Inline};
use crate::registry::{UnitDescriptor, UnitRegistry};

/// The consumer that displays a transformed value.
///
/// The coordinator calls it at most once per trigger: either `set_value`, or
/// (on failure) the optional fallback `set_value` followed by `report_error`.
/// `detach` follows in both cases and signals that the value is final.
pub trait Sink: Send + Sync {
    /// Display the value.
    fn set_value(&self, value: &str);

    /// Show that transforming failed.
    fn report_error(&self, error: &TransformError) {
        let _ = error;
    }

    /// Drop any live-update wiring: the value will not change anymore.
    fn detach(&self) {}
}

/// Where the coordinator gets its engine from.
pub enum EngineSource {
    /// A fixed engine, shared by all computations.
    Static(Arc<dyn Engine>),
    /// A unit compiled through the registry. Every computation mints a fresh
    /// instance; the compiled artifact is shared.
    Unit {
        registry: Arc<UnitRegistry>,
        descriptor: UnitDescriptor,
    },
}

impl EngineSource {
    /// Use a fixed engine.
    pub fn fixed(engine: impl Engine + 'static) -> Self {
        Self::Static(Arc::new(engine))
    }

    /// Use a unit from the registry.
    pub fn unit(registry: Arc<UnitRegistry>, descriptor: UnitDescriptor) -> Self {
        Self::Unit { registry, descriptor }
    }

    /// The engine's name, without compiling anything.
    pub fn name(&self) -> String {
        match self {
            Self::Static(engine) => engine.name().into(),
            Self::Unit { descriptor, .. } => descriptor.qualified_name(),
        }
    }

    /// Obtain an engine, compiling the unit on first use.
    fn resolve(&self) -> Result<Arc<dyn Engine>, TransformError> {
        match self {
            Self::Static(engine) => Ok(engine.clone()),
            Self::Unit { registry, descriptor } => {
                let unit = registry.get_or_build(descriptor);
                if let Some(error) = unit.error() {
                    return Err(error.into());
                }
                Ok(Arc::new(registry.mint_instance(&unit)?))
            }
        }
    }
}

impl Debug for EngineSource {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let kind = match self {
            Self::Static(_) => "Static",
            Self::Unit { .. } => "Unit",
        };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}

/// A trigger's pending or finished delivery.
#[derive(Debug)]
pub struct Delivery<K> {
    entry: Arc<TransformResult<K, String>>,
    subscription: Option<SubscriptionId>,
    /// Set once the sink's calls have returned.
    delivered: Arc<AtomicBool>,
}

impl<K> Delivery<K> {
    /// The entry the trigger is attached to.
    pub fn entry(&self) -> &Arc<TransformResult<K, String>> {
        &self.entry
    }

    /// Whether the sink has been notified already.
    ///
    /// Stays `false` for a while after the entry settles, until the sink's
    /// calls have returned.
    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Stop the delivery to the sink, e.g. because it no longer exists.
    ///
    /// The shared computation continues. Returns whether the sink was still
    /// waiting.
    pub fn cancel(self) -> bool {
        let cancelled = self.subscription.is_some_and(|id| self.entry.unsubscribe(id));
        tracing::trace!(cancelled, "delivery cancelled");
        cancelled
    }
}

/// Connects triggers, the memo cache, engines and sinks.
///
/// For every trigger the coordinator looks the key up: a settled entry is
/// delivered right away, a pending one is awaited, and a new one is computed on
/// the executor. Cache and registry may be shared between coordinators as long
/// as coordinators sharing a cache also share the engine.
pub struct Coordinator<K> {
    cache: Arc<MemoCache<K, String>>,
    source: Arc<EngineSource>,
    executor: Arc<dyn Executor>,
    config: Config,
}

impl<K> Coordinator<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    /// A coordinator with its own cache that computes on the triggering thread.
    pub fn new(source: EngineSource) -> Self {
        Self {
            cache: Arc::new(MemoCache::new()),
            source: Arc::new(source),
            executor: Arc::new(Inline),
            config: Config::default(),
        }
    }

    /// A coordinator set up from a configuration, with a worker pool if the
    /// configuration asks for one.
    pub fn from_config(source: EngineSource, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut coordinator = Self::new(source);
        if let Some(workers) = config.workers {
            let pool = executor::pool(workers)
                .map_err(|err| ConfigError::Invalid(format!("cannot start workers: {err}")))?;
            coordinator.executor = Arc::new(pool);
        }
        coordinator.config = config;
        Ok(coordinator)
    }

    /// Share a cache with other coordinators.
    pub fn with_cache(mut self, cache: Arc<MemoCache<K, String>>) -> Self {
        self.cache = cache;
        self
    }

    /// Run computations on the given executor.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Use the given settings. The `workers` field is ignored here; pass an
    /// executor instead.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// The memo cache.
    pub fn cache(&self) -> &Arc<MemoCache<K, String>> {
        &self.cache
    }

    /// The settings.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle a raw value for a key, eventually notifying the sink.
    ///
    /// Empty values are ignored and yield `None`.
    pub fn trigger(&self, key: K, raw: &str, sink: Arc<dyn Sink>) -> Option<Delivery<K>> {
        if raw.is_empty() {
            tracing::trace!(?key, "ignoring empty value");
            return None;
        }

        let (entry, completer) = if self.config.enabled {
            match self.cache.lookup_or_create(key, raw) {
                Lookup::Created(completer) => (completer.entry().clone(), Some(completer)),
                Lookup::Existing(entry) => (entry, None),
            }
        } else {
            let completer = self.cache.detached(key, raw);
            (completer.entry().clone(), Some(completer))
        };

        match (&completer, entry.status()) {
            (Some(_), _) => tracing::debug!(key = ?entry.key(), "miss: computing"),
            (None, Status::Pending) => tracing::debug!(key = ?entry.key(), "attaching to computation"),
            (None, _) => tracing::debug!(key = ?entry.key(), "hit"),
        }

        // Subscribe before computing so that an inline computation delivers
        // through the same path as a pooled one.
        let delivered = Arc::new(AtomicBool::new(false));
        let subscription = self.attach(&entry, sink, delivered.clone());
        if let Some(completer) = completer {
            self.compute(completer);
        }

        Some(Delivery { entry, subscription, delivered })
    }

    /// Evict settled entries older than the configured maximum age.
    pub fn evict(&self) {
        self.cache.evict(self.config.max_age);
    }

    fn attach(
        &self,
        entry: &TransformResult<K, String>,
        sink: Arc<dyn Sink>,
        delivered: Arc<AtomicBool>,
    ) -> Option<SubscriptionId> {
        let ready = sink.clone();
        let ready_delivered = delivered.clone();
        let fallback = self.config.fallback.clone();
        entry.subscribe(
            move |output: &String| {
                ready.set_value(output);
                ready.detach();
                ready_delivered.store(true, Ordering::Release);
            },
            move |error| {
                if let Some(fallback) = &fallback {
                    sink.set_value(fallback);
                }
                sink.report_error(error);
                sink.detach();
                delivered.store(true, Ordering::Release);
            },
        )
    }

    fn compute(&self, completer: Completer<K, String>) {
        let source = self.source.clone();
        self.executor.execute(Box::new(move || {
            let raw = completer.entry().raw();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let engine = source.resolve()?;
                engine.invoke(raw).map_err(|err| {
                    tracing::warn!(engine = engine.name(), %err, "transformation failed");
                    err
                })
            }))
            .unwrap_or_else(|payload| {
                Err(TransformError::Panicked {
                    engine: source.name(),
                    message: panic_message(payload.as_ref()),
                })
            });

            match result {
                Ok(output) => completer.complete(output),
                Err(error) => completer.fail(error),
            }
        }));
    }
}

impl<K> Debug for Coordinator<K> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("source", &self.source)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::StaticEngine;
    use crate::executor::Job;
    use crate::registry::Contract;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Sink for Recorder {
        fn set_value(&self, value: &str) {
            self.events.lock().push(format!("value {value}"));
        }

        fn report_error(&self, error: &TransformError) {
            self.events.lock().push(format!("error {error}"));
        }

        fn detach(&self) {
            self.events.lock().push("detach".into());
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    struct Counting(AtomicUsize);

    impl Engine for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn invoke(&self, raw: &str) -> Result<String, TransformError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            StaticEngine::hex().invoke(raw)
        }
    }

    #[test]
    fn test_hit_does_not_recompute() {
        let engine = Arc::new(Counting(AtomicUsize::new(0)));
        let coordinator = Coordinator::new(EngineSource::Static(engine.clone()));
        let sink = Arc::new(Recorder::default());

        let first = coordinator.trigger("42", "42", sink.clone()).unwrap();
        assert!(first.is_delivered());
        assert_eq!(sink.take(), ["value 0x2A", "detach"]);

        coordinator.trigger("42", "42", sink.clone()).unwrap();
        assert_eq!(sink.take(), ["value 0x2A", "detach"]);
        assert_eq!(engine.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_value_is_ignored() {
        let coordinator = Coordinator::<&str>::new(EngineSource::fixed(StaticEngine::hex()));
        let sink = Arc::new(Recorder::default());
        assert!(coordinator.trigger("k", "", sink.clone()).is_none());
        assert!(sink.take().is_empty());
        assert!(coordinator.cache().is_empty());
    }

    #[test]
    fn test_failure_uses_fallback() {
        let coordinator = Coordinator::new(EngineSource::fixed(StaticEngine::hex()))
            .with_config(Config { fallback: Some("#ERR".into()), ..Config::default() });
        let sink = Arc::new(Recorder::default());
        coordinator.trigger("x", "x", sink.clone());
        assert_eq!(
            sink.take(),
            ["value #ERR", "error `hex` failed: `x` is not an integer", "detach"]
        );
        assert_eq!(coordinator.cache().status(&"x"), Some(Status::Failed));
    }

    #[test]
    fn test_compile_failure_is_local() {
        let registry = Arc::new(UnitRegistry::new().unwrap());
        let broken = UnitDescriptor::new("demo", "Broken", Contract::converter(), "(module (func");
        let coordinator = Coordinator::new(EngineSource::unit(registry.clone(), broken));
        let sink = Arc::new(Recorder::default());

        coordinator.trigger(1, "a", sink.clone());
        coordinator.trigger(2, "b", sink.clone());
        let events = sink.take();
        assert_eq!(events.len(), 4);
        assert!(events[0].starts_with("error failed to compile `demo.Broken`"));
        assert_eq!(registry.compilations(), 1);
    }

    #[test]
    fn test_panicking_engine_fails_entry() {
        fn explode(_: &str) -> Result<String, TransformError> {
            panic!("engine blew up")
        }

        let coordinator =
            Coordinator::new(EngineSource::fixed(StaticEngine::new("explode", explode)));
        let sink = Arc::new(Recorder::default());
        coordinator.trigger("k", "v", sink.clone());
        assert_eq!(sink.take().len(), 2);
        let error = coordinator.cache().peek(&"k").unwrap().error().unwrap();
        assert!(matches!(error, TransformError::Panicked { message, .. } if message == "engine blew up"));
    }

    #[test]
    fn test_disabled_memoization_recomputes() {
        let engine = Arc::new(Counting(AtomicUsize::new(0)));
        let coordinator = Coordinator::new(EngineSource::Static(engine.clone()))
            .with_config(Config { enabled: false, ..Config::default() });
        let sink = Arc::new(Recorder::default());
        coordinator.trigger("7", "7", sink.clone());
        coordinator.trigger("7", "7", sink.clone());
        assert_eq!(engine.0.load(Ordering::SeqCst), 2);
        assert!(coordinator.cache().is_empty());
        assert_eq!(sink.take(), ["value 0x7", "detach", "value 0x7", "detach"]);
    }

    /// Holds jobs until told to run them.
    #[derive(Default)]
    struct Deferred(Mutex<Vec<Job>>);

    impl Executor for Deferred {
        fn execute(&self, job: Job) {
            self.0.lock().push(job);
        }
    }

    impl Deferred {
        fn run_all(&self) {
            let jobs = std::mem::take(&mut *self.0.lock());
            for job in jobs {
                job();
            }
        }
    }

    #[test]
    fn test_delivery_tracks_the_sink() {
        let executor = Arc::new(Deferred::default());
        let coordinator = Coordinator::new(EngineSource::fixed(StaticEngine::hex()))
            .with_executor(executor.clone());
        let sink = Arc::new(Recorder::default());

        let delivery = coordinator.trigger("9", "9", sink.clone()).unwrap();
        assert!(!delivery.is_delivered());
        executor.run_all();
        assert!(delivery.is_delivered());
        assert_eq!(sink.take(), ["value 0x9", "detach"]);

        let cancelled = coordinator.trigger("10", "10", sink.clone()).unwrap();
        let kept = coordinator.trigger("10", "10", sink.clone()).unwrap();
        assert!(cancelled.cancel());
        executor.run_all();
        assert!(kept.is_delivered());
        assert_eq!(sink.take(), ["value 0xA", "detach"]);
    }
}
