//! faultgate/src/state.rs
//! The shared store bundle injected into the acceptor and the admin plane.

use crate::metrics::Metrics;
use crate::policy::PolicyStore;
use crate::resolver::Resolver;
use std::sync::Arc;

/// Everything mutable that pipelines and the admin plane share. Constructed
/// once per proxy instance; tests build a fresh one per case.
pub struct ProxyState {
    pub resolver: Arc<Resolver>,
    pub policy: PolicyStore,
    pub metrics: Metrics,
}

impl ProxyState {
    pub fn new() -> Arc<Self> {
        let resolver = Arc::new(Resolver::new());
        Arc::new(Self {
            policy: PolicyStore::new(resolver.clone()),
            metrics: Metrics::new(),
            resolver,
        })
    }
}
