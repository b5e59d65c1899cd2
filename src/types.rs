//! faultgate/src/types.rs
//! Core data structures, type aliases, and constants.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Which latency map a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Read,
    Write,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Connect, Phase::Read, Phase::Write];

    /// The wire name used in admin URLs and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "per_remote_connect",
            Phase::Read => "per_remote_read",
            Phase::Write => "per_remote_write",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown latency phase: {0}")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_remote_connect" => Ok(Phase::Connect),
            "per_remote_read" => Ok(Phase::Read),
            "per_remote_write" => Ok(Phase::Write),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

/// A per-host latency rule.
///
/// `remaining > 0` means the rule is consumed once per application;
/// `remaining < 0` means it applies indefinitely; `remaining == 0` means the
/// rule is spent and is evicted on its next observation without sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyRule {
    #[serde(serialize_with = "humantime_latency")]
    pub latency: Duration,
    pub remaining: i32,
}

fn humantime_latency<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*latency))
}

/// The destination a SOCKS5 client asked for, refined over the life of the
/// connection: `proxy_host` is filled in when an HTTP CONNECT line is seen in
/// the client stream.
#[derive(Debug, Clone)]
pub struct TargetAddr {
    /// Destination hostname from the SOCKS5 request; empty when the client
    /// sent a raw address.
    pub fqdn: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Host extracted from an intercepted `CONNECT host:port` request line.
    pub proxy_host: String,
}

impl TargetAddr {
    /// `host:port` as used in metric keys; prefers the FQDN when known.
    pub fn host_and_port(&self) -> String {
        if self.fqdn.is_empty() {
            format!("{}:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.fqdn, self.port)
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.proxy_host.is_empty() {
            write!(f, "{} ({})", self.host_and_port(), self.ip)
        } else {
            write!(f, "{} ({}) via {}", self.host_and_port(), self.ip, self.proxy_host)
        }
    }
}
