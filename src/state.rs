use std::sync::Arc;

use parking_lot::Mutex;

use crate::internal::limiter::Limiter;
use crate::internal::registry::Registry;
use crate::internal::strategy::Strategy;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub limiter: Arc<Limiter>,
    /// Selection policy; `next()` calls are serialized behind this mutex.
    pub strategy: Arc<Mutex<Box<dyn Strategy>>>,
    /// True when the policy wants per-endpoint connection accounting.
    pub track_connections: bool,
    /// Shared outbound client used to forward requests upstream.
    pub forward_client: reqwest::Client,
}
