use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpSocket, TcpStream};

use crate::error::NetError;
use crate::resolver::DnsCache;
use crate::router::IpRouter;

/// Whole-dial budget, shared across every address attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Connects to `host:port` destinations through the DNS cache and the
/// source-IP router.
///
/// Addresses are tried round-robin starting from the cache entry's counter,
/// so repeated dials to a multi-record host spread across its records. The
/// deadline covers the whole dial: when it expires mid-walk the dial fails
/// with [`NetError::DialTimeout`] immediately instead of moving on to the
/// next address.
pub struct Dialer {
    cache: DnsCache,
    router: Arc<IpRouter>,
    budget: Duration,
}

impl Dialer {
    pub fn new(router: Arc<IpRouter>) -> Self {
        Self::with_budget(router, DIAL_TIMEOUT)
    }

    pub fn with_budget(router: Arc<IpRouter>, budget: Duration) -> Self {
        Self {
            cache: DnsCache::new(),
            router,
            budget,
        }
    }

    pub async fn dial(&self, host_port: &str) -> Result<TcpStream, NetError> {
        let (entry, idx) = self.cache.resolve(host_port).await?;
        let addrs = entry.addrs();
        let n = addrs.len() as u32;
        let deadline = Instant::now() + self.budget;
        let mut last_err: Option<NetError> = None;

        for attempt in 0..n {
            let addr = addrs[(idx.wrapping_add(attempt) % n) as usize];
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetError::DialTimeout);
            }
            match self.try_dial(addr, remaining).await {
                Ok(stream) => return Ok(stream),
                Err(NetError::DialTimeout) => return Err(NetError::DialTimeout),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(NetError::DialTimeout))
    }

    async fn try_dial(&self, addr: SocketAddr, remaining: Duration) -> Result<TcpStream, NetError> {
        let socket = TcpSocket::new_v4()?;
        if let Some(local) = self.router.route(addr.ip()) {
            socket.bind(SocketAddr::new(IpAddr::V4(local), 0))?;
        }
        match tokio::time::timeout(remaining, socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(NetError::Io(err)),
            Err(_) => Err(NetError::DialTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_listener(bind: &str) -> (TcpListener, String) {
        let listener = TcpListener::bind(format!("{bind}:0")).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, format!("{}:{}", bind, addr.port()))
    }

    #[tokio::test]
    async fn test_dial_local_listener() {
        let (listener, target) = local_listener("127.0.0.1").await;
        let dialer = Dialer::new(Arc::new(IpRouter::default()));

        let dialed = dialer.dial(&target).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(dialed.local_addr().unwrap(), peer);
        drop(accepted);
    }

    #[tokio::test]
    async fn test_dial_binds_routed_source_address() {
        // Loopback aliases let us observe the bind: connect to 127.0.0.2
        // with a route steering loopback traffic out of 127.0.0.1.
        let (listener, target) = local_listener("127.0.0.2").await;
        let router = Arc::new(IpRouter::new("127.0.0.0/8 -> 127.0.0.1").unwrap());
        let dialer = Dialer::new(router);

        let dialed = dialer.dial(&target).await.unwrap();
        assert_eq!(
            dialed.local_addr().unwrap().ip(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_a_dial_timeout() {
        let dialer = Dialer::with_budget(Arc::new(IpRouter::default()), Duration::ZERO);
        let err = dialer.dial("127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, NetError::DialTimeout));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_a_timeout() {
        // Bind-then-drop guarantees the port is closed, so the connect is
        // refused rather than blackholed.
        let (listener, target) = local_listener("127.0.0.1").await;
        drop(listener);

        let dialer = Dialer::new(Arc::new(IpRouter::default()));
        let err = dialer.dial(&target).await.unwrap_err();
        assert!(matches!(err, NetError::Io(_)));
        assert!(!err.is_timeout());
    }
}
