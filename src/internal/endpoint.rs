//! Upstream endpoints and their health monitoring.
//!
//! Each endpoint carries an atomic `active` flag read lock-free by the
//! selection policies and written only by its probe loop, plus an atomic
//! in-flight connection counter maintained through RAII guards.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Total tries within one probe; each try is bounded by
/// `health_interval / PROBE_ATTEMPTS`.
pub const PROBE_ATTEMPTS: u32 = 5;

/// One upstream server behind the balancer.
pub struct Endpoint {
    id: Uuid,
    url: Url,
    active: AtomicBool,
    connections: AtomicI64,
    health_interval: Duration,
    probe_client: reqwest::Client,
}

impl Endpoint {
    /// Parses the target URL and prepares the probe client. Endpoints
    /// start active; the first failing probe flips them off.
    pub fn new(url: &str, health_interval: Duration) -> anyhow::Result<Arc<Self>> {
        let url = Url::parse(url)?;
        let probe_client = reqwest::Client::builder()
            .timeout(health_interval / PROBE_ATTEMPTS)
            .build()?;

        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            url,
            active: AtomicBool::new(true),
            connections: AtomicI64::new(0),
            health_interval,
            probe_client,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Registers an in-flight request. The counter drops again when the
    /// returned guard does, so every exit path of the request future
    /// balances the increment exactly once.
    pub fn new_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            endpoint: Arc::clone(self),
        }
    }

    /// One probe: GET the endpoint root, retrying transport errors up to
    /// [`PROBE_ATTEMPTS`] tries. Healthy iff some try answered 2xx.
    async fn ping(&self) -> bool {
        for attempt in 1..=PROBE_ATTEMPTS {
            match self.probe_client.get(self.url.clone()).send().await {
                Ok(response) => {
                    let healthy = response.status().is_success();
                    tracing::debug!(
                        id = %self.id,
                        status = response.status().as_u16(),
                        attempt,
                        "ping answered"
                    );
                    return healthy;
                }
                Err(err) => {
                    tracing::debug!(id = %self.id, error = %err, attempt, "ping failed");
                }
            }
        }

        false
    }

    /// Spawns the health loop: one probe per `health_interval`, flipping
    /// the active flag on edges. Runs until `shutdown` fires.
    pub fn spawn_health_check(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.health_interval);
            // The immediate first tick would probe before the upstream had
            // `health_interval` to come up; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let healthy = self.ping().await;
                        let active = self.is_active();

                        if healthy && !active {
                            tracing::info!(id = %self.id, url = %self.url, "endpoint is now active");
                            self.enable();
                        } else if !healthy && active {
                            tracing::info!(id = %self.id, url = %self.url, "endpoint is not active now");
                            self.disable();
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!(id = %self.id, "stopping endpoint health check");
                        return;
                    }
                }
            }
        });
    }
}

/// Decrements the endpoint's connection counter when dropped.
pub struct ConnectionGuard {
    endpoint: Arc<Endpoint>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.endpoint.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::Router;
    use std::sync::atomic::AtomicU16;

    async fn spawn_upstream(status: Arc<AtomicU16>) -> String {
        let app = Router::new().fallback(move || {
            let status = status.clone();
            async move {
                StatusCode::from_u16(status.load(Ordering::Relaxed))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    #[test]
    fn connection_guard_balances_the_counter() {
        let endpoint = Endpoint::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();

        let first = endpoint.new_connection();
        let second = endpoint.new_connection();
        assert_eq!(endpoint.connections(), 2);

        drop(first);
        assert_eq!(endpoint.connections(), 1);
        drop(second);
        assert_eq!(endpoint.connections(), 0);
    }

    #[test]
    fn endpoints_start_active() {
        let endpoint = Endpoint::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
        assert!(endpoint.is_active());
        endpoint.disable();
        assert!(!endpoint.is_active());
        endpoint.enable();
        assert!(endpoint.is_active());
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(Endpoint::new("not a url", Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn probe_treats_299_as_healthy_and_300_as_not() {
        let status = Arc::new(AtomicU16::new(299));
        let url = spawn_upstream(status.clone()).await;
        let endpoint = Endpoint::new(&url, Duration::from_secs(5)).unwrap();

        assert!(endpoint.ping().await);

        status.store(300, Ordering::Relaxed);
        assert!(!endpoint.ping().await);
    }

    #[tokio::test]
    async fn probe_fails_when_nothing_listens() {
        // Bind and drop to get a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint =
            Endpoint::new(&format!("http://{addr}"), Duration::from_millis(500)).unwrap();
        assert!(!endpoint.ping().await);
    }

    #[tokio::test]
    async fn health_loop_flips_the_flag_on_both_edges() {
        let status = Arc::new(AtomicU16::new(200));
        let url = spawn_upstream(status.clone()).await;
        let endpoint = Endpoint::new(&url, Duration::from_millis(50)).unwrap();

        let shutdown = CancellationToken::new();
        endpoint.clone().spawn_health_check(shutdown.clone());

        status.store(500, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), async {
            while endpoint.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint never went inactive");

        status.store(200, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !endpoint.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint never recovered");

        shutdown.cancel();
    }
}
