use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A monotonically increasing counter.
///
/// Increments are relaxed atomics; counters are shared via `Arc` handles so
/// the hot path never touches the registry lock.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

type GaugeFn = Box<dyn Fn() -> f64 + Send + Sync>;

/// Thread-safe registry of named counters and callback gauges.
///
/// Metric names are the full exposition keys, including any label set:
/// `http_status{code="2xx"}`. Gauges are sampled at render time, so a gauge
/// callback must be cheap and non-blocking.
#[derive(Default)]
pub struct Registry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, GaugeFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter registered under `name`, creating it if needed.
    ///
    /// Calling this twice with the same name yields handles to the same
    /// underlying counter.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(c) = self.counters.read().unwrap().get(name) {
            return c.clone();
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    /// Registers a callback gauge. A later registration under the same name
    /// replaces the callback.
    pub fn gauge<F>(&self, name: &str, f: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.gauges
            .write()
            .unwrap()
            .insert(name.to_string(), Box::new(f));
    }

    /// Removes the metric registered under `name`.
    ///
    /// Returns `true` if a counter or gauge was removed. Outstanding `Arc`
    /// handles to a removed counter stay usable but no longer appear in the
    /// exposition.
    pub fn unregister(&self, name: &str) -> bool {
        let counter = self.counters.write().unwrap().remove(name).is_some();
        let gauge = self.gauges.write().unwrap().remove(name).is_some();
        counter || gauge
    }

    /// Renders all metrics in the Prometheus text format, one
    /// `name value` line per metric, sorted by name.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        {
            let counters = self.counters.read().unwrap();
            for (name, counter) in counters.iter() {
                lines.push(format!("{} {}", name, counter.get()));
            }
        }
        {
            let gauges = self.gauges.read().unwrap();
            for (name, sample) in gauges.iter() {
                lines.push(format!("{} {}", name, sample()));
            }
        }
        lines.sort();
        let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_identity() {
        let registry = Registry::new();
        let a = registry.counter("requests");
        let b = registry.counter("requests");
        a.inc();
        b.add(2);
        assert_eq!(a.get(), 3);
    }

    #[test]
    fn test_render_sorted() {
        let registry = Registry::new();
        registry.counter("zeta").inc();
        registry.counter("alpha").add(5);
        registry.gauge("mid", || 2.5);

        assert_eq!(registry.render(), "alpha 5\nmid 2.5\nzeta 1\n");
    }

    #[test]
    fn test_labeled_names() {
        let registry = Registry::new();
        registry.counter(r#"http_status{code="2xx"}"#).inc();
        assert!(registry.render().contains(r#"http_status{code="2xx"} 1"#));
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::new();
        let c = registry.counter("gone");
        assert!(registry.unregister("gone"));
        assert!(!registry.unregister("gone"));
        // Outstanding handle still works but is invisible.
        c.inc();
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_gauge_sampled_at_render() {
        let registry = Registry::new();
        let value = Arc::new(AtomicU64::new(7));
        let sampled = value.clone();
        registry.gauge("queue_size", move || sampled.load(Ordering::Relaxed) as f64);

        assert_eq!(registry.render(), "queue_size 7\n");
        value.store(9, Ordering::Relaxed);
        assert_eq!(registry.render(), "queue_size 9\n");
    }

    #[test]
    fn test_concurrent_increments() {
        let registry = Arc::new(Registry::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                let c = registry.counter("contended");
                for _ in 0..1000 {
                    c.inc();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.counter("contended").get(), 8000);
    }
}
