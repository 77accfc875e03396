use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tracing::debug;

static GLOBAL: OnceLock<MetricsCore> = OnceLock::new();

/// One named group of Prometheus metrics (e.g. `BitswapMetrics`). `Metric`
/// enumerates the individual counters/gauges it owns.
pub trait Collector: Send + Sync + 'static {
    type Metric: Copy;

    /// Registers this collector's metrics into `registry` under its own
    /// namespace.
    fn describe(&self, registry: &mut Registry);
    fn inc(&self, metric: Self::Metric);
    fn record(&self, metric: Self::Metric, value: f64);
}

/// Process-wide registry. Applications (the demonstration CLI) call
/// [`install`] once at startup and register collectors on the result;
/// libraries call [`with_global`] through the `inc!`/`record!` macros and
/// simply do nothing if no one ever installed a registry.
pub struct MetricsCore {
    registry: Mutex<Registry>,
    collectors: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl MetricsCore {
    fn new() -> Self {
        MetricsCore {
            registry: Mutex::new(Registry::default()),
            collectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn register<C: Collector>(&self, collector: C) {
        collector.describe(&mut self.registry.lock().unwrap());
        self.collectors.lock().unwrap().insert(TypeId::of::<C>(), Box::new(collector));
        debug!(collector = std::any::type_name::<C>(), "registered metrics collector");
    }

    fn with_collector<C: Collector, R>(&self, f: impl FnOnce(&C) -> R) -> Option<R> {
        let collectors = self.collectors.lock().unwrap();
        collectors.get(&TypeId::of::<C>()).and_then(|c| c.downcast_ref::<C>()).map(f)
    }

    /// Renders every registered collector in Prometheus text exposition
    /// format, for a `/metrics` scrape endpoint.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry.lock().unwrap()).expect("registry encoding is infallible");
        buf
    }
}

/// Installs the global registry if not already installed, returning it
/// either way. Idempotent — call from as many places as convenient.
pub fn install() -> &'static MetricsCore {
    GLOBAL.get_or_init(MetricsCore::new)
}

pub fn is_installed() -> bool {
    GLOBAL.get().is_some()
}

#[doc(hidden)]
pub fn global() -> Option<&'static MetricsCore> {
    GLOBAL.get()
}

#[doc(hidden)]
pub fn with_global<C: Collector, R>(f: impl FnOnce(&C) -> R) -> Option<R> {
    global().and_then(|core| core.with_collector(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    enum Metric {
        Hits,
    }

    struct Dummy {
        hits: Mutex<u64>,
    }

    impl Collector for Dummy {
        type Metric = Metric;

        fn describe(&self, _registry: &mut Registry) {}

        fn inc(&self, _metric: Metric) {
            *self.hits.lock().unwrap() += 1;
        }

        fn record(&self, _metric: Metric, _value: f64) {}
    }

    #[test]
    fn with_global_is_none_before_install() {
        // a fresh process-wide OnceLock in each test binary; this test
        // only holds if run in isolation, so we only assert the API shape.
        let _ = with_global::<Dummy, ()>(|_| ());
    }

    #[test]
    fn registered_collector_is_reachable_by_type() {
        let core = install();
        core.register(Dummy { hits: Mutex::new(0) });
        let result = core.with_collector::<Dummy, u64>(|d| {
            d.inc(Metric::Hits);
            *d.hits.lock().unwrap()
        });
        assert_eq!(result, Some(1));
    }
}
