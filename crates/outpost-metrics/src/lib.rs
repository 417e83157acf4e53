//! Outpost metrics collection
//!
//! This crate provides the metrics infrastructure for the outpost proxy:
//! a thread-safe registry of named counters and callback gauges with a
//! Prometheus-compatible text exposition, plus TTL-bounded per-host counter
//! families for tracking failures by destination host without unbounded
//! metric cardinality.
//!
//! # Architecture
//!
//! - [`Registry`]: thread-safe storage for all metrics. Counter increments
//!   are lock-free atomics; the name table is behind an `RwLock` that is
//!   only written on first registration.
//! - [`Counter`]: monotonically increasing `u64`.
//! - [`HostCounters`]: a family of counters keyed by destination host.
//!   Hosts idle for longer than a TTL are evicted and unregistered, so an
//!   adversarial set of destination hosts cannot grow the exposition
//!   without bound.
//!
//! # Exposition
//!
//! [`Registry::render`] produces one `name value` line per metric, sorted
//! by name. Label sets are part of the metric name, e.g.
//! `http_status{code="2xx"}`.
//!
//! # Usage
//!
//! ```
//! use outpost_metrics::Registry;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(Registry::new());
//! let requests = registry.counter("requests_total");
//! requests.inc();
//! assert!(registry.render().contains("requests_total 1"));
//! ```

mod by_host;
mod registry;

pub use by_host::{HostCounters, DEFAULT_HOST_TTL};
pub use registry::{Counter, Registry};
