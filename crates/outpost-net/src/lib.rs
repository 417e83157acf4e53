//! Outbound networking for outpost
//!
//! Everything between a job's destination URL and a connected socket lives
//! here:
//!
//! - [`IpRouter`]: ordered first-match CIDR table selecting the local bind
//!   address for a destination IP, so egress traffic can be steered onto a
//!   specific source interface per network.
//! - [`DnsCache`]: a self-refreshing `host:port` resolution cache with
//!   round-robin index state. Entries are immutable once published; a
//!   single in-flight refresh per key replaces the entry while concurrent
//!   callers keep using the stale copy.
//! - [`Dialer`]: connects to a destination under a whole-dial deadline,
//!   walking the cached addresses round-robin and binding the router's
//!   source address per attempt.
//!
//! The dialer deliberately budgets the deadline across *all* address
//! attempts rather than per attempt: one slow address must not be able to
//! consume more worker time than a single dial is worth.

mod dialer;
mod error;
mod router;
mod resolver;

pub use dialer::Dialer;
pub use error::NetError;
pub use resolver::{DnsCache, DnsEntry};
pub use router::IpRouter;
