//! Sync engine
//!
//! Wires the health monitor, stream manager and discovery engine around one
//! peer client. This is the surface the hosting application talks to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{DiscoveryEngine, DiscoveryReport, DiscoveryResult};
use crate::error::{ClassifiedError, EngineError, EngineResult};
use crate::health::{HealthMonitor, NetworkStatus};
use crate::peer::{Conversation, PeerClient};
use crate::stream::{MessageEvent, StreamManager, StreamState};

struct EngineInner {
    id: String,
    peer: Arc<dyn PeerClient>,
    health: HealthMonitor,
    stream: StreamManager,
    discovery: DiscoveryEngine,
    discovery_interval: Option<Duration>,
    root: CancellationToken,
    started: AtomicBool,
    destroyed: AtomicBool,
}

/// Resilient sync engine
///
/// Cheap to clone; clones drive the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build and start an engine that probes endpoints over HTTP
    pub async fn initialize(peer: Arc<dyn PeerClient>, config: Config) -> EngineResult<Self> {
        let health = HealthMonitor::with_http(config.health.clone());
        Self::initialize_with_monitor(peer, config, health).await
    }

    /// Build and start an engine around an existing health monitor
    pub async fn initialize_with_monitor(
        peer: Arc<dyn PeerClient>,
        config: Config,
        health: HealthMonitor,
    ) -> EngineResult<Self> {
        let engine = Self::new(peer, config, health)?;
        engine.start().await?;
        Ok(engine)
    }

    /// Build an engine without starting it
    ///
    /// Lets callers subscribe before the first stream is opened. The engine
    /// takes ownership of the monitor's lifecycle: it is started by
    /// [`start`](Self::start) and destroyed with the engine.
    pub fn new(peer: Arc<dyn PeerClient>, config: Config, health: HealthMonitor) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(format!("{:#}", e)))?;

        let id = format!("tether-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let stream = StreamManager::new(Arc::clone(&peer), health.clone(), config.stream.clone());
        let discovery =
            DiscoveryEngine::new(Arc::clone(&peer), health.clone(), config.discovery.clone());

        Ok(Self {
            inner: Arc::new(EngineInner {
                id,
                peer,
                health,
                stream,
                discovery,
                discovery_interval: config.discovery.interval(),
                root: CancellationToken::new(),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Start the health monitor, the stream and periodic discovery
    ///
    /// Calling this more than once does nothing.
    pub async fn start(&self) -> EngineResult<()> {
        self.ensure_alive()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.health.start();

        // A failed first start is already in the recovery policy's hands
        if let Err(e) = self.inner.stream.start().await {
            warn!(engine = %self.inner.id, error = %e, "Initial stream start failed");
        }

        if let Some(period) = self.inner.discovery_interval {
            self.spawn_periodic_discovery(period);
        }

        info!(engine = %self.inner.id, "Sync engine started");
        Ok(())
    }

    fn spawn_periodic_discovery(&self, period: Duration) {
        let discovery = self.inner.discovery.clone();
        let token = self.inner.root.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match discovery.discover(false).await {
                            Ok(result) => debug!(total = result.total, source = %result.strategy_used, "Periodic discovery finished"),
                            Err(e) => warn!(error = %e, "Periodic discovery failed"),
                        }
                    }
                }
            }
            debug!("Periodic discovery stopped");
        });
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.is_destroyed() {
            Err(EngineError::Destroyed)
        } else {
            Ok(())
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub fn stream(&self) -> &StreamManager {
        &self.inner.stream
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.inner.discovery
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.inner.stream.subscribe_messages()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ClassifiedError> {
        self.inner.stream.subscribe_errors()
    }

    /// Receive a snapshot on every stream phase transition
    pub fn subscribe_stream_state(&self) -> broadcast::Receiver<StreamState> {
        self.inner.stream.subscribe_state_changes()
    }

    /// Receive network status changes, starting with the current status
    pub fn subscribe_network_status(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.health.subscribe()
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.stream.state()
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.inner.health.current_status()
    }

    pub async fn recent_messages(&self, n: usize) -> Vec<MessageEvent> {
        self.inner.stream.recent_messages(n).await
    }

    pub async fn discover(&self, force_refresh: bool) -> EngineResult<DiscoveryResult> {
        self.ensure_alive()?;
        self.inner.discovery.discover(force_refresh).await
    }

    pub fn discovery_report(&self) -> DiscoveryReport {
        self.inner.discovery.report()
    }

    pub fn cached_conversations(&self) -> Vec<Conversation> {
        self.inner.discovery.cached_conversations()
    }

    pub fn cached_conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.discovery.cached_conversation(id)
    }

    /// Send a message; returns the peer client's message id
    pub async fn send(&self, conversation_id: &str, content: &str) -> EngineResult<String> {
        self.ensure_alive()?;
        let id = self.inner.peer.send(conversation_id, content).await?;
        debug!(conversation_id, message_id = %id, "Message sent");
        Ok(id)
    }

    /// Whether an identity is registered on the peer network
    pub async fn can_reach(&self, identifier: &str) -> EngineResult<bool> {
        self.ensure_alive()?;
        Ok(self.inner.peer.can_reach(identifier).await?)
    }

    /// Tear everything down
    ///
    /// Safe to call multiple times.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.root.cancel();
        self.inner.stream.destroy().await;
        self.inner.discovery.destroy();
        self.inner.health.destroy();
        info!(engine = %self.inner.id, "Sync engine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::health::{ProbeError, ProbeMethod, Prober};
    use crate::peer::memory::MemoryPeer;
    use crate::peer::RawMessage;
    use crate::stream::StreamPhase;
    use async_trait::async_trait;

    struct NoProbe;

    #[async_trait]
    impl Prober for NoProbe {
        async fn request(&self, _: &str, _: ProbeMethod, _: Duration) -> Result<u16, ProbeError> {
            Ok(200)
        }
    }

    fn test_config() -> Config {
        Config {
            health: HealthConfig::without_endpoints(),
            ..Config::default()
        }
    }

    async fn engine_with(peer: Arc<MemoryPeer>, config: Config) -> EngineResult<SyncEngine> {
        let health = HealthMonitor::new(config.health.clone(), Arc::new(NoProbe));
        SyncEngine::initialize_with_monitor(peer, config, health).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_streams_and_discovers() {
        let peer = Arc::new(MemoryPeer::new());
        peer.set_conversations(vec![Conversation::direct("dm-1", "alice")]);
        peer.add_reachable("alice");

        let engine = engine_with(peer.clone(), test_config()).await.unwrap();
        assert!(engine.id().starts_with("tether-"));
        assert_eq!(engine.stream_state().phase, StreamPhase::Active);

        let mut messages = engine.subscribe_messages();
        peer.deliver(RawMessage::text("m1", "dm-1", "alice", "hey"));
        let event = tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.content, "hey");
        assert_eq!(engine.recent_messages(5).await.len(), 1);

        let result = engine.discover(false).await.unwrap();
        assert_eq!(result.total, 1);
        assert!(engine.cached_conversation("dm-1").is_some());
        assert_eq!(engine.discovery_report().total_runs, 1);

        let id = engine.send("dm-1", "hello back").await.unwrap();
        assert!(!id.is_empty());
        assert!(engine.can_reach("alice").await.unwrap());
        assert!(!engine.can_reach("bob").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_status_subscription() {
        let engine = engine_with(Arc::new(MemoryPeer::new()), test_config())
            .await
            .unwrap();

        let mut status = engine.subscribe_network_status();
        status.changed().await.unwrap();
        assert!(status.borrow_and_update().is_online);

        engine.health().set_online(false);
        status.changed().await.unwrap();
        assert!(!status.borrow_and_update().is_online);
        assert!(!engine.network_status().is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_discovery() {
        let peer = Arc::new(MemoryPeer::new());
        peer.set_conversations(vec![Conversation::group("grp-1", "team")]);
        let mut config = test_config();
        config.discovery.interval_ms = 60_000;

        let engine = engine_with(peer, config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.discovery_report().total_runs, 1);
        assert_eq!(engine.cached_conversations().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.discovery_report().total_runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_before_start() {
        let peer = Arc::new(MemoryPeer::new());
        peer.push_open_failure(crate::error::PeerError::new("already borrowed"));
        let config = test_config();
        let health = HealthMonitor::new(config.health.clone(), Arc::new(NoProbe));

        let engine = SyncEngine::new(peer, config, health).unwrap();
        let mut errors = engine.subscribe_errors();
        assert_eq!(engine.stream_state().phase, StreamPhase::Idle);

        engine.start().await.unwrap();
        engine.start().await.unwrap();

        let error = errors.recv().await.unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::RaceCondition);
        assert!(!error.terminal);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.discovery.max_attempts = 0;

        let result = engine_with(Arc::new(MemoryPeer::new()), config).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let engine = engine_with(Arc::new(MemoryPeer::new()), test_config())
            .await
            .unwrap();

        engine.destroy().await;
        engine.destroy().await;

        assert!(engine.is_destroyed());
        assert!(engine.health().is_destroyed());
        assert_eq!(engine.stream_state().phase, StreamPhase::Destroyed);
        assert!(matches!(engine.send("dm-1", "hi").await, Err(EngineError::Destroyed)));
        assert!(matches!(engine.discover(true).await, Err(EngineError::Destroyed)));
    }
}
