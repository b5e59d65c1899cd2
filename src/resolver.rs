//! faultgate/src/resolver.rs
//! Caching hostname resolution.

use dashmap::DashMap;
use std::net::IpAddr;
use thiserror::Error;
use tokio::net::lookup_host;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no addresses found for {0}")]
    NoAddress(String),
}

/// Host -> IP resolver with a process-lifetime cache. The cached IP string is
/// the canonical key for every policy map.
pub struct Resolver {
    cache: DashMap<String, IpAddr>,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Resolves a hostname to its first address, preferring IPv4 so that
    /// hostnames and their dotted-quad form land on the same policy key.
    /// Literal IP strings parse directly and bypass the cache. Failures are
    /// never cached.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(hit) = self.cache.get(host) {
            return Ok(*hit);
        }
        let addrs: Vec<_> = lookup_host((host, 0))
            .await
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                source: e,
            })?
            .collect();
        let ip = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| ResolveError::NoAddress(host.to_string()))?;
        self.cache.insert(host.to_string(), ip);
        Ok(ip)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
