use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::registry::{Counter, Registry};

/// How long a host counter may sit idle before it is evicted.
pub const DEFAULT_HOST_TTL: Duration = Duration::from_secs(12 * 60 * 60);

struct HostEntry {
    counter: Arc<Counter>,
    last_used: Instant,
}

/// A family of counters keyed by destination host.
///
/// Each distinct host lazily registers `name{host="..."}` in the registry.
/// Hosts that receive no increments for [`DEFAULT_HOST_TTL`] are evicted by
/// [`sweep`](HostCounters::sweep) and unregistered, which bounds metric
/// cardinality when jobs target arbitrary hosts.
pub struct HostCounters {
    registry: Arc<Registry>,
    name: String,
    ttl: Duration,
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl HostCounters {
    pub fn new(registry: Arc<Registry>, name: &str) -> Arc<Self> {
        Self::with_ttl(registry, name, DEFAULT_HOST_TTL)
    }

    pub fn with_ttl(registry: Arc<Registry>, name: &str, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            name: name.to_string(),
            ttl,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    fn metric_name(&self, host: &str) -> String {
        format!(r#"{}{{host="{}"}}"#, self.name, host)
    }

    /// Increments the counter for `host`, registering it on first use.
    pub fn inc(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        let entry = hosts.entry(host.to_string()).or_insert_with(|| HostEntry {
            counter: self.registry.counter(&self.metric_name(host)),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        entry.counter.inc();
    }

    /// Evicts hosts idle for at least the TTL and unregisters their metrics.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let mut hosts = self.hosts.lock().unwrap();
        let expired: Vec<String> = hosts
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) >= self.ttl)
            .map(|(host, _)| host.clone())
            .collect();
        for host in expired {
            hosts.remove(&host);
            self.registry.unregister(&self.metric_name(&host));
            tracing::debug!(metric = %self.name, host = %host, "expired idle host counter");
        }
    }

    /// Spawns a background task sweeping this family every `interval`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_registers_labeled_counter() {
        let registry = Arc::new(Registry::new());
        let timeouts = HostCounters::new(registry.clone(), "http_timeouts_by_host");

        timeouts.inc("example.com");
        timeouts.inc("example.com");
        timeouts.inc("other.net");

        let rendered = registry.render();
        assert!(rendered.contains(r#"http_timeouts_by_host{host="example.com"} 2"#));
        assert!(rendered.contains(r#"http_timeouts_by_host{host="other.net"} 1"#));
    }

    #[test]
    fn test_sweep_unregisters_idle_hosts() {
        let registry = Arc::new(Registry::new());
        let errors = HostCounters::with_ttl(registry.clone(), "http_errors_by_host", Duration::ZERO);

        errors.inc("stale.example");
        assert!(registry.render().contains("stale.example"));

        errors.sweep();
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_inc_after_sweep_reregisters() {
        let registry = Arc::new(Registry::new());
        let errors = HostCounters::with_ttl(registry.clone(), "http_errors_by_host", Duration::ZERO);

        errors.inc("host.example");
        errors.sweep();
        errors.inc("host.example");

        // The counter restarts from zero after eviction.
        assert!(registry
            .render()
            .contains(r#"http_errors_by_host{host="host.example"} 1"#));
    }

    #[test]
    fn test_active_hosts_survive_sweep() {
        let registry = Arc::new(Registry::new());
        let errors =
            HostCounters::with_ttl(registry.clone(), "http_errors_by_host", Duration::from_secs(60));

        errors.inc("fresh.example");
        errors.sweep();
        assert!(registry.render().contains("fresh.example"));
    }
}
