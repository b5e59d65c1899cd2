//! faultgate/src/policy.rs
//! Destructive-behavior store: per-host latency rules and access-control lists.

use crate::resolver::{ResolveError, Resolver};
use crate::types::{LatencyRule, Phase, TargetAddr};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("blacklist is not enabled")]
    BlacklistDisabled,
    #[error("whitelist is not enabled")]
    WhitelistDisabled,
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Outcome of an access-control check for one forwarded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Neither list is enabled; no decision was made.
    Open,
    Allow,
    Deny,
}

/// All mutable fault policy, keyed by canonical resolved-IP strings. Each map
/// and set carries its own lock; no lock is ever held across a resolver call,
/// a sleep, or socket I/O.
pub struct PolicyStore {
    resolver: Arc<Resolver>,
    connect_rules: RwLock<HashMap<String, LatencyRule>>,
    read_rules: RwLock<HashMap<String, LatencyRule>>,
    write_rules: RwLock<HashMap<String, LatencyRule>>,
    blacklist: RwLock<HashSet<String>>,
    whitelist: RwLock<HashSet<String>>,
    blacklist_enabled: AtomicBool,
    whitelist_enabled: AtomicBool,
}

impl PolicyStore {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            resolver,
            connect_rules: RwLock::new(HashMap::new()),
            read_rules: RwLock::new(HashMap::new()),
            write_rules: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            whitelist: RwLock::new(HashSet::new()),
            blacklist_enabled: AtomicBool::new(false),
            whitelist_enabled: AtomicBool::new(false),
        }
    }

    fn rules(&self, phase: Phase) -> &RwLock<HashMap<String, LatencyRule>> {
        match phase {
            Phase::Connect => &self.connect_rules,
            Phase::Read => &self.read_rules,
            Phase::Write => &self.write_rules,
        }
    }

    pub fn enable_blacklist(&self, on: bool) {
        self.blacklist_enabled.store(on, Ordering::SeqCst);
    }

    pub fn enable_whitelist(&self, on: bool) {
        self.whitelist_enabled.store(on, Ordering::SeqCst);
    }

    pub fn blacklist_enabled(&self) -> bool {
        self.blacklist_enabled.load(Ordering::SeqCst)
    }

    pub fn whitelist_enabled(&self) -> bool {
        self.whitelist_enabled.load(Ordering::SeqCst)
    }

    /// Upserts a latency rule under the resolved IP of `host`; a non-positive
    /// latency removes any existing rule instead. Returns the resolved IP.
    pub async fn set_latency(
        &self,
        host: &str,
        phase: Phase,
        latency: Duration,
        count: i32,
    ) -> Result<IpAddr, PolicyError> {
        let ip = self.resolver.resolve(host).await?;
        let key = ip.to_string();
        let mut rules = self.rules(phase).write().unwrap();
        if latency > Duration::ZERO {
            rules.insert(key, LatencyRule { latency, remaining: count });
        } else {
            rules.remove(&key);
        }
        Ok(ip)
    }

    /// Resolves `host` and returns the rule stored under it, if any. Never
    /// mutates the store.
    pub async fn get_latency(
        &self,
        host: &str,
        phase: Phase,
    ) -> Result<(IpAddr, Option<LatencyRule>), PolicyError> {
        let ip = self.resolver.resolve(host).await?;
        let rule = self.rules(phase).read().unwrap().get(&ip.to_string()).copied();
        Ok((ip, rule))
    }

    /// Bulk dump of one phase's rules for the admin plane.
    pub fn latency_rules(&self, phase: Phase) -> HashMap<String, LatencyRule> {
        self.rules(phase).read().unwrap().clone()
    }

    pub async fn set_blacklist(&self, host: &str, add: bool) -> Result<IpAddr, PolicyError> {
        if !self.blacklist_enabled() {
            return Err(PolicyError::BlacklistDisabled);
        }
        let ip = self.resolver.resolve(host).await?;
        let mut blocked = self.blacklist.write().unwrap();
        if add {
            blocked.insert(ip.to_string());
        } else {
            blocked.remove(&ip.to_string());
        }
        Ok(ip)
    }

    pub async fn set_whitelist(&self, host: &str, add: bool) -> Result<IpAddr, PolicyError> {
        if !self.whitelist_enabled() {
            return Err(PolicyError::WhitelistDisabled);
        }
        let ip = self.resolver.resolve(host).await?;
        let mut allowed = self.whitelist.write().unwrap();
        if add {
            allowed.insert(ip.to_string());
        } else {
            allowed.remove(&ip.to_string());
        }
        Ok(ip)
    }

    pub fn blacklisted(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.blacklist.read().unwrap().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn whitelisted(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.whitelist.read().unwrap().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Looks up a latency rule for `target` and consumes one application of
    /// it. Keys are tried in order: the literal destination IP, the resolved
    /// FQDN, and (for read/write phases) the resolved `proxy_host`; the first
    /// match wins and later keys are not consulted. Returns the duration the
    /// caller must sleep, which may be zero. The sleep must happen with no
    /// lock held; the decrement happens inside the lock.
    pub async fn lookup_and_consume(&self, phase: Phase, target: &TargetAddr) -> Duration {
        if let Some(sleep) = self.consume(phase, &target.ip.to_string()) {
            return sleep;
        }
        if !target.fqdn.is_empty() {
            if let Ok(ip) = self.resolver.resolve(&target.fqdn).await {
                if let Some(sleep) = self.consume(phase, &ip.to_string()) {
                    return sleep;
                }
            }
        }
        if phase != Phase::Connect && !target.proxy_host.is_empty() {
            if let Ok(ip) = self.resolver.resolve(&target.proxy_host).await {
                if let Some(sleep) = self.consume(phase, &ip.to_string()) {
                    return sleep;
                }
            }
        }
        Duration::ZERO
    }

    /// One observation of the rule under `key`. A spent rule (`remaining == 0`)
    /// is evicted and sleeps nothing; a sticky rule (`remaining < 0`) is left
    /// untouched; otherwise the count drops by one.
    fn consume(&self, phase: Phase, key: &str) -> Option<Duration> {
        let mut rules = self.rules(phase).write().unwrap();
        let rule = *rules.get(key)?;
        if rule.remaining == 0 {
            rules.remove(key);
            return Some(Duration::ZERO);
        }
        if rule.remaining >= 1 {
            rules.insert(
                key.to_string(),
                LatencyRule {
                    latency: rule.latency,
                    remaining: rule.remaining - 1,
                },
            );
        }
        Some(rule.latency)
    }

    /// Evaluates the enabled access-control list against the destination IP
    /// and the sniffed `proxy_host`. At most one list is consulted.
    pub fn check_access(&self, target: &TargetAddr) -> Verdict {
        if self.blacklist_enabled() {
            let blocked = self.blacklist.read().unwrap();
            if blocked.contains(&target.ip.to_string()) || blocked.contains(&target.proxy_host) {
                return Verdict::Deny;
            }
            return Verdict::Allow;
        }
        if self.whitelist_enabled() {
            let allowed = self.whitelist.read().unwrap();
            if !allowed.contains(&target.ip.to_string())
                || (!target.proxy_host.is_empty() && !allowed.contains(&target.proxy_host))
            {
                return Verdict::Deny;
            }
            return Verdict::Allow;
        }
        Verdict::Open
    }
}
