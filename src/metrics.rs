//! faultgate/src/metrics.rs
//! Counter registry keyed by semicolon-delimited metric names.

use std::collections::HashMap;
use std::sync::RwLock;

pub const TOTAL_CONNS: &str = "conns;Total;All";
pub const ACTIVE_CONNS: &str = "conns;Active:All";
pub const TOTAL_BYTES_IN: &str = "bytes;Total;In";
pub const TOTAL_BYTES_OUT: &str = "bytes;Total;Out";

/// Additive float counters shared by every pipeline and the admin plane.
/// Keys follow the `category;subject;qualifier` convention, e.g.
/// `bytes;example.com:443;Out`.
#[derive(Default)]
pub struct Metrics {
    counters: RwLock<HashMap<String, f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: &str) {
        self.add(key, 1.0);
    }

    pub fn dec(&self, key: &str) {
        self.add(key, -1.0);
    }

    pub fn add(&self, key: &str, v: f64) {
        let mut counters = self.counters.write().unwrap();
        *counters.entry(key.to_string()).or_insert(0.0) += v;
    }

    pub fn get(&self, key: &str) -> f64 {
        self.counters.read().unwrap().get(key).copied().unwrap_or(0.0)
    }

    /// Copies all pairs for read-only export.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.counters.read().unwrap().clone()
    }

    pub fn reset(&self) {
        *self.counters.write().unwrap() = HashMap::new();
    }
}
