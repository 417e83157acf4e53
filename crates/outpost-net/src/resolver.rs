use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::NetError;

/// How long a published resolution stays fresh.
const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

/// A published resolution for one `host:port` key.
///
/// `addrs` is never mutated after publication; a refresh publishes a whole
/// new entry. Only the round-robin `index` and the `pending` refresh flag
/// are atomic.
#[derive(Debug)]
pub struct DnsEntry {
    addrs: Vec<SocketAddr>,
    index: AtomicU32,
    resolved_at: Instant,
    pending: AtomicBool,
}

impl DnsEntry {
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    fn next_index(&self) -> u32 {
        self.index.fetch_add(1, Ordering::Relaxed)
    }
}

/// Self-refreshing DNS cache with per-entry round-robin state.
///
/// The refresh policy is single-flight per key: the first caller to observe
/// an expired entry marks it `pending` and performs the resolution; callers
/// arriving during the refresh keep using the stale entry until the new one
/// is published. A failed refresh clears `pending` so the next caller
/// retries.
pub struct DnsCache {
    entries: Mutex<HashMap<String, Arc<DnsEntry>>>,
    ttl: Duration,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_ttl(DNS_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolves `host:port` to IPv4 socket addresses, served from cache
    /// when fresh. Returns the entry together with the next round-robin
    /// index.
    pub async fn resolve(&self, host_port: &str) -> Result<(Arc<DnsEntry>, u32), NetError> {
        let cached = {
            let entries = self.entries.lock().unwrap();
            match entries.get(host_port) {
                Some(e)
                    if !e.pending.load(Ordering::Acquire)
                        && e.resolved_at.elapsed() > self.ttl =>
                {
                    // Expired and nobody refreshing yet: claim the refresh
                    // and fall through to the miss path. The stale entry
                    // stays published for concurrent callers.
                    e.pending.store(true, Ordering::Release);
                    None
                }
                Some(e) => Some(e.clone()),
                None => None,
            }
        };

        if let Some(entry) = cached {
            let idx = entry.next_index();
            return Ok((entry, idx));
        }

        match lookup_ipv4(host_port).await {
            Ok(addrs) => {
                tracing::debug!("resolved {} to {} address(es)", host_port, addrs.len());
                let entry = Arc::new(DnsEntry {
                    addrs,
                    index: AtomicU32::new(0),
                    resolved_at: Instant::now(),
                    pending: AtomicBool::new(false),
                });
                self.entries
                    .lock()
                    .unwrap()
                    .insert(host_port.to_string(), entry.clone());
                let idx = entry.next_index();
                Ok((entry, idx))
            }
            Err(err) => {
                // Let the next caller retry the refresh; the stale entry
                // (if any) keeps serving in the meantime.
                let entries = self.entries.lock().unwrap();
                if let Some(prior) = entries.get(host_port) {
                    prior.pending.store(false, Ordering::Release);
                }
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn publish(&self, host_port: &str, addrs: Vec<SocketAddr>, age: Duration, pending: bool) {
        let entry = Arc::new(DnsEntry {
            addrs,
            index: AtomicU32::new(0),
            resolved_at: Instant::now().checked_sub(age).unwrap(),
            pending: AtomicBool::new(pending),
        });
        self.entries
            .lock()
            .unwrap()
            .insert(host_port.to_string(), entry);
    }
}

async fn lookup_ipv4(host_port: &str) -> Result<Vec<SocketAddr>, NetError> {
    let (host, port) = split_host_port(host_port)?;
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetError::Resolve {
            host: host.to_string(),
            source: e,
        })?;
    // IPv4-only egress policy: drop records without a 4-byte form.
    let addrs: Vec<SocketAddr> = resolved.filter(|a| a.is_ipv4()).collect();
    if addrs.is_empty() {
        return Err(NetError::NoRecords(host_port.to_string()));
    }
    Ok(addrs)
}

fn split_host_port(addr: &str) -> Result<(&str, u16), NetError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| NetError::InvalidAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NetError::InvalidAddress(addr.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(NetError::InvalidAddress(addr.to_string()));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> Vec<SocketAddr> {
        vec!["9.9.9.9:99".parse().unwrap()]
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let cache = DnsCache::new();
        let (entry, idx) = cache.resolve("127.0.0.1:8080").await.unwrap();
        assert_eq!(entry.addrs(), ["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);
        assert_eq!(idx, 0);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_shared_and_index_advances() {
        let cache = DnsCache::new();
        let (first, i0) = cache.resolve("127.0.0.1:80").await.unwrap();
        let (second, i1) = cache.resolve("127.0.0.1:80").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((i0, i1), (0, 1));
    }

    #[tokio::test]
    async fn test_pending_entry_serves_stale() {
        let cache = DnsCache::new();
        cache.publish("127.0.0.1:80", sentinel(), Duration::from_secs(600), true);
        // A refresh is already in flight elsewhere: we must not resolve,
        // just use the stale addresses.
        let (entry, _) = cache.resolve("127.0.0.1:80").await.unwrap();
        assert_eq!(entry.addrs(), &sentinel()[..]);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let cache = DnsCache::new();
        cache.publish("127.0.0.1:80", sentinel(), Duration::from_secs(600), false);
        let (entry, _) = cache.resolve("127.0.0.1:80").await.unwrap();
        assert_eq!(entry.addrs(), ["127.0.0.1:80".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_pending_and_keeps_stale() {
        let cache = DnsCache::new();
        let key = "host.invalid:80";
        cache.publish(key, sentinel(), Duration::from_secs(600), false);

        assert!(cache.resolve(key).await.is_err());

        // The stale entry survived with pending cleared, so it serves again
        // (and the next expiry check may retry the refresh).
        let entries = cache.entries.lock().unwrap();
        let prior = entries.get(key).unwrap();
        assert!(!prior.pending.load(Ordering::Acquire));
        assert_eq!(prior.addrs(), &sentinel()[..]);
    }

    #[tokio::test]
    async fn test_ipv6_only_is_an_error() {
        let cache = DnsCache::new();
        let err = cache.resolve("[::1]:80").await.unwrap_err();
        assert!(matches!(err, NetError::NoRecords(_)));
    }

    #[tokio::test]
    async fn test_malformed_addresses() {
        let cache = DnsCache::new();
        assert!(matches!(
            cache.resolve("no-port").await.unwrap_err(),
            NetError::InvalidAddress(_)
        ));
        assert!(matches!(
            cache.resolve("host:not-a-port").await.unwrap_err(),
            NetError::InvalidAddress(_)
        ));
    }
}
