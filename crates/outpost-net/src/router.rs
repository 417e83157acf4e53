use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::NetError;

/// An IPv4 prefix, stored with host bits masked off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    fn parse(s: &str) -> Result<Self, NetError> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| NetError::InvalidRoute(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetError::InvalidRoute(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| NetError::InvalidRoute(s.to_string()))?;
        if prefix > 32 {
            return Err(NetError::InvalidRoute(s.to_string()));
        }
        let mask = prefix_mask(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix) == u32::from(self.network)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[derive(Debug, Clone, Copy)]
struct Route {
    net: Ipv4Cidr,
    /// `None` means `auto`: let the kernel pick the source address.
    target: Option<Ipv4Addr>,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(ip) => write!(f, "{} -> {}", self.net, ip),
            None => write!(f, "{} -> auto", self.net),
        }
    }
}

/// Ordered first-match table mapping destination IPs to local bind
/// addresses.
///
/// Built from a config string of the form
/// `CIDR -> TARGET[, CIDR -> TARGET]*` where `TARGET` is a dotted-quad
/// IPv4 address or the literal `auto`. Declaration order is the user
/// contract: specific prefixes go before general ones, e.g.
/// `172.16.0.0/12 -> 172.16.1.1, 0.0.0.0/0 -> auto`.
///
/// The table is immutable after construction and read without
/// synchronization.
#[derive(Debug, Default)]
pub struct IpRouter {
    routes: Vec<Route>,
}

impl IpRouter {
    /// Parses a route table. The empty (or all-whitespace) config yields
    /// the default router, which routes nothing.
    pub fn new(config: &str) -> Result<Self, NetError> {
        let config = config.trim();
        if config.is_empty() {
            return Ok(Self::default());
        }
        let mut routes = Vec::new();
        for part in config.split(',') {
            let (net, target) = part
                .split_once("->")
                .ok_or_else(|| NetError::InvalidRoute(part.trim().to_string()))?;
            let net = Ipv4Cidr::parse(net.trim())?;
            let target = match target.trim() {
                "auto" => None,
                other => Some(
                    other
                        .parse::<Ipv4Addr>()
                        .map_err(|_| NetError::InvalidTarget(other.to_string()))?,
                ),
            };
            routes.push(Route { net, target });
        }
        Ok(Self { routes })
    }

    /// Returns the local bind address for `dest`, or `None` when no route
    /// matches or the first matching route is `auto`. Linear scan: route
    /// counts are tiny and order is semantically significant.
    pub fn route(&self, dest: IpAddr) -> Option<Ipv4Addr> {
        let IpAddr::V4(dest) = dest else {
            return None;
        };
        self.routes
            .iter()
            .find(|r| r.net.contains(dest))
            .and_then(|r| r.target)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Display for IpRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, route) in self.routes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", route)?;
        }
        Ok(())
    }
}
