//! Endpoint selection policies.
//!
//! The dispatcher depends only on [`Strategy::next`], so new policies can
//! be added without touching dispatch. Every policy returns `None` when no
//! endpoint is active.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::internal::endpoint::Endpoint;

pub const ROUND_ROBIN: &str = "round-robin";
pub const RANDOM: &str = "random";
pub const LEAST_CONNECTIONS: &str = "least-connections";

pub trait Strategy: Send + Sync {
    /// The next endpoint to dispatch to, or `None` when all are down.
    fn next(&self) -> Option<Arc<Endpoint>>;

    /// Whether the dispatcher should maintain per-endpoint connection
    /// counts for this policy.
    fn track_connections(&self) -> bool {
        false
    }
}

/// Builds the policy named in the configuration.
pub fn for_name(name: &str, endpoints: Vec<Arc<Endpoint>>) -> Option<Box<dyn Strategy>> {
    match name {
        ROUND_ROBIN => Some(Box::new(RoundRobin::new(endpoints))),
        RANDOM => Some(Box::new(Random::new(endpoints))),
        LEAST_CONNECTIONS => Some(Box::new(LeastConnections::new(endpoints))),
        _ => None,
    }
}

/// Cycles through the endpoint list, skipping inactive entries.
pub struct RoundRobin {
    endpoints: Vec<Arc<Endpoint>>,
    current: AtomicUsize,
}

impl RoundRobin {
    pub fn new(endpoints: Vec<Arc<Endpoint>>) -> Self {
        Self {
            endpoints,
            current: AtomicUsize::new(0),
        }
    }
}

impl Strategy for RoundRobin {
    fn next(&self) -> Option<Arc<Endpoint>> {
        let total = self.endpoints.len();
        if total == 0 {
            return None;
        }

        let start = self.current.load(Ordering::Relaxed) % total;
        for i in 0..total {
            let index = (start + i) % total;
            let endpoint = &self.endpoints[index];

            if endpoint.is_active() {
                self.current.store((index + 1) % total, Ordering::Relaxed);
                return Some(Arc::clone(endpoint));
            }
        }

        None
    }
}

/// Uniform pick with resampling, bounded so a fully-inactive list cannot
/// livelock: after `2n` misses it falls through to a linear scan.
pub struct Random {
    endpoints: Vec<Arc<Endpoint>>,
}

impl Random {
    pub fn new(endpoints: Vec<Arc<Endpoint>>) -> Self {
        Self { endpoints }
    }
}

impl Strategy for Random {
    fn next(&self) -> Option<Arc<Endpoint>> {
        let total = self.endpoints.len();
        if total == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        for _ in 0..2 * total {
            let endpoint = &self.endpoints[rng.gen_range(0..total)];
            if endpoint.is_active() {
                return Some(Arc::clone(endpoint));
            }
        }

        self.endpoints.iter().find(|e| e.is_active()).map(Arc::clone)
    }
}

/// Picks the active endpoint with the fewest in-flight connections, ties
/// broken by list order.
pub struct LeastConnections {
    endpoints: Vec<Arc<Endpoint>>,
}

impl LeastConnections {
    pub fn new(endpoints: Vec<Arc<Endpoint>>) -> Self {
        Self { endpoints }
    }
}

impl Strategy for LeastConnections {
    fn next(&self) -> Option<Arc<Endpoint>> {
        let mut selected: Option<&Arc<Endpoint>> = None;
        let mut minimal = i64::MAX;

        for endpoint in &self.endpoints {
            if !endpoint.is_active() {
                continue;
            }

            let connections = endpoint.connections();
            if connections < minimal {
                minimal = connections;
                selected = Some(endpoint);
            }
        }

        selected.map(Arc::clone)
    }

    fn track_connections(&self) -> bool {
        true
    }
}
