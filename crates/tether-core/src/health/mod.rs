//! Network health monitor
//!
//! Tracks host connectivity and periodically probes a fixed set of service
//! endpoints. Other components gate risky operations on
//! [`HealthMonitor::wait_for_stability`].
//!
//! ## Usage
//!
//! ```ignore
//! let monitor = HealthMonitor::with_http(config.health.clone());
//! monitor.start();
//!
//! if monitor.wait_for_stability(Duration::from_secs(10)).await {
//!     // safe to open streams
//! }
//! ```

mod probe;

pub use probe::{HttpProber, ProbeError, ProbeMethod, Prober};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

/// Host connectivity snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_online: bool,
    /// e.g. "wifi", "ethernet", "cellular", "unknown"
    pub connection_type: String,
    /// e.g. "4g", "3g", "unknown"
    pub effective_type: String,
    pub round_trip_time_ms: Option<u64>,
    pub downlink_mbps: Option<f64>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            is_online: true,
            connection_type: "unknown".to_string(),
            effective_type: "unknown".to_string(),
            round_trip_time_ms: None,
            downlink_mbps: None,
        }
    }
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self {
            is_online: false,
            ..Self::default()
        }
    }
}

/// Result of the latest probe of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub last_checked_at: DateTime<Utc>,
    pub error: Option<ProbeError>,
}

/// Coarse network condition label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkCondition {
    Offline,
    /// Online but no healthy endpoint or high round-trip time
    Degraded,
    Stable,
}

impl fmt::Display for NetworkCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkCondition::Offline => "offline",
            NetworkCondition::Degraded => "degraded",
            NetworkCondition::Stable => "stable",
        })
    }
}

struct MonitorInner {
    config: HealthConfig,
    prober: Arc<dyn Prober>,
    status_tx: watch::Sender<NetworkStatus>,
    endpoints_tx: watch::Sender<HashMap<String, EndpointHealth>>,
    started: AtomicBool,
    destroyed: AtomicBool,
    token: CancellationToken,
}

/// Network health monitor
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    /// Create a monitor with a custom prober
    pub fn new(config: HealthConfig, prober: Arc<dyn Prober>) -> Self {
        let (status_tx, _) = watch::channel(NetworkStatus::default());
        let (endpoints_tx, _) = watch::channel(HashMap::new());

        Self {
            inner: Arc::new(MonitorInner {
                config,
                prober,
                status_tx,
                endpoints_tx,
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Create a monitor that probes over HTTP
    pub fn with_http(config: HealthConfig) -> Self {
        Self::new(config, Arc::new(HttpProber::new()))
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Start the periodic probe cycle
    ///
    /// The first cycle runs immediately. Calling this more than once, or
    /// after [`destroy`](Self::destroy), does nothing.
    pub fn start(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) || self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.inner.config.endpoints.is_empty() {
            debug!("No endpoints configured, probe cycle disabled");
            return;
        }

        let monitor = self.clone();
        let token = self.inner.token.clone();
        let period = self.inner.config.probe_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.probe_all().await;
                    }
                }
            }
            debug!("Probe cycle stopped");
        });

        info!(
            endpoints = self.inner.config.endpoints.len(),
            interval_ms = self.inner.config.probe_interval_ms,
            "Network health monitor started"
        );
    }

    /// Probe every configured endpoint once, concurrently
    pub async fn probe_all(&self) -> Vec<EndpointHealth> {
        let probes = self
            .inner
            .config
            .endpoints
            .iter()
            .map(|endpoint| self.probe(endpoint));
        futures_util::future::join_all(probes).await
    }

    /// Probe one endpoint and record the outcome
    ///
    /// Tries HEAD first and falls back to GET when HEAD fails. Healthy iff
    /// the response status is below 500 and it arrived within the latency limit.
    pub async fn probe(&self, endpoint: &str) -> EndpointHealth {
        let (outcome, latency) = match self.timed_request(endpoint, ProbeMethod::Head).await {
            (Ok(status), latency) if status < 500 => (Ok(status), latency),
            (head, _) => {
                debug!(endpoint, ?head, "HEAD probe failed, retrying with GET");
                self.timed_request(endpoint, ProbeMethod::Get).await
            }
        };

        let latency_ms = latency.as_millis() as u64;
        let error = match outcome {
            Ok(status) if status >= 500 => Some(ProbeError::Status(status)),
            Ok(_) if latency >= self.inner.config.max_healthy_latency() => {
                Some(ProbeError::Slow(latency_ms))
            }
            Ok(_) => None,
            Err(e) => Some(e),
        };

        let health = EndpointHealth {
            endpoint: endpoint.to_string(),
            healthy: error.is_none(),
            latency_ms,
            last_checked_at: Utc::now(),
            error,
        };

        match &health.error {
            None => debug!(endpoint, latency_ms, "Endpoint healthy"),
            Some(e) => warn!(endpoint, latency_ms, error = %e, "Endpoint unhealthy"),
        }

        if !self.inner.destroyed.load(Ordering::SeqCst) {
            self.inner.endpoints_tx.send_modify(|map| {
                map.insert(endpoint.to_string(), health.clone());
            });
        }

        health
    }

    async fn timed_request(
        &self,
        endpoint: &str,
        method: ProbeMethod,
    ) -> (Result<u16, ProbeError>, Duration) {
        let timeout = self.inner.config.probe_timeout();
        let started = Instant::now();
        let result =
            match tokio::time::timeout(timeout, self.inner.prober.request(endpoint, method, timeout))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout),
            };
        (result, started.elapsed())
    }

    /// Current connectivity snapshot
    pub fn current_status(&self) -> NetworkStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to connectivity changes
    ///
    /// The current status is replayed: the first `changed()` resolves
    /// immediately. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        let mut rx = self.inner.status_tx.subscribe();
        rx.mark_changed();
        rx
    }

    /// Report host connectivity
    ///
    /// Subscribers are notified only when the status actually changes.
    pub fn set_connectivity(&self, status: NetworkStatus) {
        let was_online = self.inner.status_tx.borrow().is_online;
        let changed = self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });

        if changed && was_online != status.is_online {
            if status.is_online {
                info!("Network connectivity restored");
            } else {
                warn!("Network connectivity lost");
            }
        }
    }

    /// Report an online/offline transition
    pub fn set_online(&self, online: bool) {
        let mut status = self.current_status();
        status.is_online = online;
        self.set_connectivity(status);
    }

    /// Snapshot of every endpoint's latest probe, sorted by endpoint
    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        let mut endpoints: Vec<_> = self.inner.endpoints_tx.borrow().values().cloned().collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        endpoints
    }

    pub fn healthy_endpoint_count(&self) -> usize {
        self.inner
            .endpoints_tx
            .borrow()
            .values()
            .filter(|e| e.healthy)
            .count()
    }

    /// Whether risky operations should proceed now
    ///
    /// Online, at least one healthy endpoint (vacuous when none are
    /// configured), and round-trip time unknown or below the limit.
    pub fn is_stable(&self) -> bool {
        self.network_condition() == NetworkCondition::Stable
    }

    pub fn network_condition(&self) -> NetworkCondition {
        let status = self.current_status();
        if !status.is_online {
            return NetworkCondition::Offline;
        }

        let endpoints_ok =
            self.inner.config.endpoints.is_empty() || self.healthy_endpoint_count() > 0;
        let rtt_ok = status
            .round_trip_time_ms
            .map_or(true, |rtt| rtt < self.inner.config.max_stable_rtt_ms);

        if endpoints_ok && rtt_ok {
            NetworkCondition::Stable
        } else {
            NetworkCondition::Degraded
        }
    }

    /// Wait until the network is stable, polling at a fixed interval
    ///
    /// Returns true as soon as the network is stable, false once `timeout`
    /// elapses (or the monitor is destroyed) without that happening.
    pub async fn wait_for_stability(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let poll = self.inner.config.stability_poll();

        loop {
            if self.is_stable() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline || self.inner.destroyed.load(Ordering::SeqCst) {
                debug!(timeout_ms = timeout.as_millis() as u64, "Network did not stabilize");
                return false;
            }

            tokio::select! {
                _ = self.inner.token.cancelled() => return false,
                _ = tokio::time::sleep(poll.min(deadline - now)) => {}
            }
        }
    }

    /// Stop probing and clear state
    ///
    /// Safe to call multiple times.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.cancel();
        self.inner.endpoints_tx.send_modify(|map| map.clear());
        info!("Network health monitor destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    #[derive(Clone)]
    enum Behaviour {
        Status(u16),
        HeadFailsThenGet(u16),
        Refused,
        Hang,
    }

    struct FakeProber {
        behaviours: Map<String, Behaviour>,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn request(
            &self,
            endpoint: &str,
            method: ProbeMethod,
            _timeout: Duration,
        ) -> Result<u16, ProbeError> {
            match self.behaviours.get(endpoint).cloned() {
                Some(Behaviour::Status(code)) => Ok(code),
                Some(Behaviour::HeadFailsThenGet(code)) => match method {
                    ProbeMethod::Head => Err(ProbeError::Other("method not allowed".into())),
                    ProbeMethod::Get => Ok(code),
                },
                Some(Behaviour::Refused) | None => Err(ProbeError::ConnectionRefused),
                Some(Behaviour::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(200)
                }
            }
        }
    }

    fn monitor_with(behaviours: &[(&str, Behaviour)]) -> HealthMonitor {
        let config = HealthConfig {
            endpoints: behaviours.iter().map(|(e, _)| e.to_string()).collect(),
            ..HealthConfig::default()
        };
        let prober = FakeProber {
            behaviours: behaviours
                .iter()
                .map(|(e, b)| (e.to_string(), b.clone()))
                .collect(),
        };
        HealthMonitor::new(config, Arc::new(prober))
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_classification() {
        let monitor = monitor_with(&[
            ("https://ok", Behaviour::Status(204)),
            ("https://fallback", Behaviour::HeadFailsThenGet(200)),
            ("https://broken", Behaviour::Status(503)),
            ("https://refused", Behaviour::Refused),
        ]);

        let results = monitor.probe_all().await;
        assert_eq!(results.len(), 4);

        let by_name: Map<_, _> = monitor
            .endpoint_health()
            .into_iter()
            .map(|e| (e.endpoint.clone(), e))
            .collect();
        assert!(by_name["https://ok"].healthy);
        assert!(by_name["https://fallback"].healthy);
        assert_eq!(by_name["https://broken"].error, Some(ProbeError::Status(503)));
        assert_eq!(
            by_name["https://refused"].error,
            Some(ProbeError::ConnectionRefused)
        );
        assert_eq!(monitor.healthy_endpoint_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout() {
        let monitor = monitor_with(&[("https://hang", Behaviour::Hang)]);
        let started = Instant::now();

        let health = monitor.probe("https://hang").await;

        assert!(!health.healthy);
        assert_eq!(health.error, Some(ProbeError::Timeout));
        // HEAD and GET each hit the 8s timeout
        assert_eq!(started.elapsed(), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_immediately_without_endpoints() {
        let monitor = HealthMonitor::new(
            HealthConfig::without_endpoints(),
            Arc::new(FakeProber { behaviours: Map::new() }),
        );
        let started = Instant::now();

        assert!(monitor.wait_for_stability(Duration::from_secs(5)).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_times_out_exactly() {
        let monitor = monitor_with(&[("https://refused", Behaviour::Refused)]);
        monitor.probe_all().await;
        let started = Instant::now();

        assert!(!monitor.wait_for_stability(Duration::from_millis(2_500)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_after_reconnect() {
        let monitor = monitor_with(&[("https://ok", Behaviour::Status(200))]);
        monitor.probe_all().await;
        monitor.set_online(false);
        assert_eq!(monitor.network_condition(), NetworkCondition::Offline);

        let remote = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            remote.set_online(true);
        });

        let started = Instant::now();
        assert!(monitor.wait_for_stability(Duration::from_secs(10)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_rtt_is_degraded() {
        let monitor = monitor_with(&[("https://ok", Behaviour::Status(200))]);
        monitor.probe_all().await;

        monitor.set_connectivity(NetworkStatus {
            round_trip_time_ms: Some(3_000),
            ..NetworkStatus::default()
        });
        assert_eq!(monitor.network_condition(), NetworkCondition::Degraded);

        monitor.set_connectivity(NetworkStatus {
            round_trip_time_ms: Some(150),
            ..NetworkStatus::default()
        });
        assert!(monitor.is_stable());
    }

    #[tokio::test]
    async fn test_subscribe_replays_current_status() {
        let monitor = monitor_with(&[]);
        monitor.set_online(false);

        let mut rx = monitor.subscribe();
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_online);

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_online);

        // No-op updates are not broadcast
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_probe_cycle() {
        let monitor = monitor_with(&[("https://ok", Behaviour::Status(200))]);
        monitor.start();
        monitor.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.healthy_endpoint_count(), 1);
        let first = monitor.endpoint_health()[0].last_checked_at;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(monitor.endpoint_health()[0].last_checked_at >= first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let monitor = monitor_with(&[("https://ok", Behaviour::Status(200))]);
        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.healthy_endpoint_count(), 1);

        monitor.destroy();
        monitor.destroy();

        assert!(monitor.is_destroyed());
        assert!(monitor.endpoint_health().is_empty());
        assert!(!monitor.wait_for_stability(Duration::from_secs(1)).await);
    }
}
