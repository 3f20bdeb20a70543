//! Static + CIDR allow-list (component F).

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// Supplies the current allow-list on demand. Implementations typically
/// wrap a `Config` behind an `Arc<RwLock<...>>` so that a config reload
/// takes effect on the very next request.
pub trait AllowListProvider: Send + Sync {
    fn current(&self) -> Vec<String>;
}

impl<F> AllowListProvider for F
where
    F: Fn() -> Vec<String> + Send + Sync,
{
    fn current(&self) -> Vec<String> {
        self()
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Exact(IpAddr),
    Network(IpNetwork),
}

/// Parses and caches the allow-list, re-parsing only when the provider's
/// raw output changes.
pub struct IpFilter {
    provider: Arc<dyn AllowListProvider>,
    cache: RwLock<(Vec<String>, Vec<Entry>)>,
}

impl IpFilter {
    pub fn new(provider: Arc<dyn AllowListProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new((Vec::new(), Vec::new())),
        }
    }

    /// `true` if `ip` is allowed through. An empty allow-list always
    /// allows everything.
    pub fn allows(&self, ip: IpAddr) -> bool {
        let raw = self.provider.current();

        let needs_reparse = {
            let cached = self.cache.read().expect("allow-list cache poisoned");
            cached.0 != raw
        };

        if needs_reparse {
            let parsed = parse_entries(&raw);
            let mut cached = self.cache.write().expect("allow-list cache poisoned");
            *cached = (raw, parsed);
        }

        let cached = self.cache.read().expect("allow-list cache poisoned");
        if cached.1.is_empty() {
            return true;
        }

        cached.1.iter().any(|entry| match entry {
            Entry::Exact(allowed) => *allowed == ip,
            Entry::Network(net) => net.contains(ip),
        })
    }
}

fn parse_entries(raw: &[String]) -> Vec<Entry> {
    raw.iter().filter_map(|s| parse_entry(s)).collect()
}

fn parse_entry(raw: &str) -> Option<Entry> {
    let stripped = strip_port(raw.trim());

    if let Ok(net) = stripped.parse::<IpNetwork>() {
        return Some(Entry::Network(net));
    }
    if let Ok(ip) = stripped.parse::<IpAddr>() {
        return Some(Entry::Exact(ip));
    }
    None
}

/// Strips a trailing `:port` from an IPv4 literal (`1.2.3.4:8080`) or a
/// bracketed IPv6 literal (`[::1]:8080`). CIDR entries and bare IPv6
/// literals are returned unchanged.
fn strip_port(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    if raw.matches(':').count() == 1 {
        if let Some((host, _port)) = raw.rsplit_once(':') {
            return host;
        }
    }
    raw
}

/// `true` for loopback addresses, which bypass the filter and
/// authentication entirely (§4.I).
pub fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback()
}
