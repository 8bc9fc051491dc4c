//! Discovery engine implementation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::{Census, Strategy};
use super::{DiscoveryReport, DiscoveryResult, DiscoverySource, StrategyAttempt};
use crate::backoff::Backoff;
use crate::config::DiscoveryConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::flight::SingleFlight;
use crate::health::{HealthMonitor, NetworkCondition};
use crate::peer::{Conversation, ConversationKind, PeerClient};

#[derive(Default)]
struct DiscoveryState {
    last_result: Option<DiscoveryResult>,
    last_successful: Option<DiscoveryResult>,
    last_success_at: Option<Instant>,
    /// Every conversation ever discovered, by id
    cache: HashMap<String, Conversation>,
    attempts: Vec<StrategyAttempt>,
    rounds_attempted: u32,
    max_attempts_reached: bool,
    network_unsuitable: bool,
    last_error: Option<String>,
    total_runs: u64,
}

enum Outcome {
    Found(Census, DiscoverySource),
    Previous(DiscoveryResult),
    Empty,
}

struct Inner {
    peer: Arc<dyn PeerClient>,
    health: HealthMonitor,
    config: DiscoveryConfig,
    backoff: Backoff,
    in_flight: AtomicBool,
    state: Mutex<DiscoveryState>,
    root: CancellationToken,
}

/// Cascading conversation discovery
///
/// Cheap to clone; clones share the cache and the single-flight guard.
#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<Inner>,
}

impl DiscoveryEngine {
    pub fn new(peer: Arc<dyn PeerClient>, health: HealthMonitor, config: DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer,
                health,
                backoff: Backoff::from_millis(config.base_delay_ms, config.max_delay_ms),
                config,
                in_flight: AtomicBool::new(false),
                state: Mutex::new(DiscoveryState::default()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Discover conversations
    ///
    /// A call made while another is running returns the last result instead
    /// of starting a second run. Without `force_refresh`, a successful result
    /// younger than the result TTL is returned as is.
    pub async fn discover(&self, force_refresh: bool) -> EngineResult<DiscoveryResult> {
        let inner = &self.inner;
        if inner.root.is_cancelled() {
            return Err(EngineError::Destroyed);
        }

        let Some(_flight) = SingleFlight::acquire(&inner.in_flight) else {
            debug!("Discovery already running, returning last result");
            let last = inner.state().last_result.clone();
            return Ok(last.unwrap_or_else(|| DiscoveryResult::empty(inner.health.network_condition())));
        };

        if !force_refresh {
            if let Some(fresh) = inner.fresh_result() {
                debug!(total = fresh.total, "Returning recent discovery result");
                return Ok(fresh);
            }
        }

        {
            let mut state = inner.state();
            state.total_runs += 1;
            state.attempts.clear();
            state.rounds_attempted = 0;
            state.max_attempts_reached = false;
            state.last_error = None;
        }

        inner.await_network().await?;

        let outcome = match inner.run_cascade().await? {
            Some((census, strategy)) => Outcome::Found(census, DiscoverySource::Strategy(strategy)),
            None => inner.fallback().await?,
        };

        Ok(inner.finish(outcome))
    }

    /// The last result returned by [`discover`](Self::discover)
    pub fn last_result(&self) -> Option<DiscoveryResult> {
        self.inner.state().last_result.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Every cached conversation, sorted by id
    pub fn cached_conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<_> = self.inner.state().cache.values().cloned().collect();
        conversations.sort_by(|a, b| a.id.cmp(&b.id));
        conversations
    }

    pub fn cached_conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.state().cache.get(id).cloned()
    }

    pub fn clear_cache(&self) {
        let mut state = self.inner.state();
        let cleared = state.cache.len();
        state.cache.clear();
        debug!(cleared, "Conversation cache cleared");
    }

    /// Current discovery state plus recommendations
    ///
    /// For observability only; nothing here should drive control flow.
    pub fn report(&self) -> DiscoveryReport {
        let condition = self.inner.health.network_condition();
        let in_progress = self.is_running();
        let state = self.inner.state();

        DiscoveryReport {
            in_progress,
            network_condition: condition,
            last_result: state.last_result.clone(),
            last_successful: state.last_successful.clone(),
            cached_conversations: state.cache.len(),
            total_runs: state.total_runs,
            rounds_attempted: state.rounds_attempted,
            attempts: state.attempts.clone(),
            last_error: state.last_error.clone(),
            recommendations: recommendations(&state, condition, in_progress, self.inner.config.max_attempts),
        }
    }

    /// Cancel any running discovery and clear the cache
    ///
    /// Safe to call multiple times.
    pub fn destroy(&self) {
        if self.inner.root.is_cancelled() {
            return;
        }
        self.inner.root.cancel();
        *self.inner.state() = DiscoveryState::default();
        info!("Discovery engine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.root.is_cancelled()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_result(&self) -> Option<DiscoveryResult> {
        let state = self.state();
        let at = state.last_success_at?;
        if at.elapsed() >= self.config.result_ttl() {
            return None;
        }
        state.last_successful.clone().filter(|r| !r.is_empty())
    }

    /// Bounded wait for a usable network; discovery proceeds either way
    async fn await_network(&self) -> EngineResult<()> {
        if self.health.is_stable() {
            self.state().network_unsuitable = false;
            return Ok(());
        }

        info!(
            condition = %self.health.network_condition(),
            "Network not suitable, waiting before discovery"
        );
        let stable = tokio::select! {
            _ = self.root.cancelled() => return Err(EngineError::Cancelled),
            stable = self.health.wait_for_stability(self.config.stability_timeout()) => stable,
        };
        if !stable {
            warn!("Network still unstable, attempting discovery anyway");
        }
        self.state().network_unsuitable = !stable;
        Ok(())
    }

    /// Up to `max_attempts` rounds over the cascade
    ///
    /// Returns at the first strategy that finds anything.
    async fn run_cascade(&self) -> EngineResult<Option<(Census, Strategy)>> {
        let max_attempts = self.config.max_attempts.max(1);

        for round in 0..max_attempts {
            self.state().rounds_attempted = round + 1;

            for strategy in Strategy::CASCADE {
                if let Some(census) = self.try_strategy(strategy, round).await? {
                    if census.total() > 0 {
                        info!(%strategy, round, total = census.total(), "Discovery found conversations");
                        return Ok(Some((census, strategy)));
                    }
                }
            }

            if round + 1 < max_attempts {
                let delay = self.backoff.delay(round);
                debug!(round, delay_ms = delay.as_millis() as u64, "Discovery round empty, backing off");
                tokio::select! {
                    _ = self.root.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(rounds = max_attempts, "Discovery cascade exhausted without finding conversations");
        self.state().max_attempts_reached = true;
        Ok(None)
    }

    /// Run one strategy under its timeout and record the attempt
    ///
    /// Strategy failures are recorded, not returned; only cancellation is.
    async fn try_strategy(&self, strategy: Strategy, round: u32) -> EngineResult<Option<Census>> {
        let timeout = strategy.timeout(&self.config);
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = self.root.cancelled() => return Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(timeout, strategy.run(self.peer.as_ref(), &self.config)) => outcome,
        };

        let mut settle = false;
        let (census, error) = match outcome {
            Ok(Ok(census)) => (Some(census), None),
            Ok(Err(e)) => {
                let kind = e.kind();
                warn!(%strategy, round, %kind, error = %e, "Discovery strategy failed");
                settle = matches!(kind, ErrorKind::RaceCondition | ErrorKind::FatalCrash);
                (None, Some(format!("{}: {}", kind, e)))
            }
            Err(_) => {
                warn!(%strategy, round, timeout_ms = timeout.as_millis() as u64, "Discovery strategy timed out");
                (None, Some(format!("timed out after {}ms", timeout.as_millis())))
            }
        };

        let total = census.as_ref().map_or(0, Census::total);
        debug!(%strategy, round, total, "Discovery strategy finished");

        {
            let mut state = self.state();
            if error.is_some() {
                state.last_error = error.clone();
            }
            state.attempts.push(StrategyAttempt {
                strategy,
                round,
                total,
                duration_ms: started.elapsed().as_millis() as u64,
                error,
                at: Utc::now(),
            });
        }

        // Give a busy or crashed peer client time before the next strategy
        if settle {
            tokio::select! {
                _ = self.root.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.config.vm_stabilization_delay()) => {}
            }
        }

        Ok(census)
    }

    /// Cache, then one timed call, then the previous good result
    async fn fallback(&self) -> EngineResult<Outcome> {
        let cached: Vec<Conversation> = self.state().cache.values().cloned().collect();
        if !cached.is_empty() {
            info!(count = cached.len(), "Discovery empty, serving conversation cache");
            return Ok(Outcome::Found(Census::merge([cached]), DiscoverySource::Cache));
        }

        let timeout = self.config.fallback_timeout();
        let outcome = tokio::select! {
            _ = self.root.cancelled() => return Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(timeout, Strategy::Standard.run(self.peer.as_ref(), &self.config)) => outcome,
        };
        match outcome {
            Ok(Ok(census)) if census.total() > 0 => {
                info!(total = census.total(), "Timed fallback found conversations");
                return Ok(Outcome::Found(census, DiscoverySource::TimedFallback));
            }
            Ok(Ok(_)) => debug!("Timed fallback found nothing"),
            Ok(Err(e)) => warn!(error = %e, "Timed fallback failed"),
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Timed fallback timed out"),
        }

        match self.state().last_successful.clone() {
            Some(previous) => {
                info!(total = previous.total, "Serving last known-good discovery result");
                Ok(Outcome::Previous(previous))
            }
            None => Ok(Outcome::Empty),
        }
    }

    /// Build the result, update the cache and remember it
    fn finish(&self, outcome: Outcome) -> DiscoveryResult {
        let condition = self.health.network_condition();
        let mut state = self.state();

        let result = match outcome {
            Outcome::Found(census, source) => {
                let result = DiscoveryResult {
                    total: census.total(),
                    direct_count: census.count(ConversationKind::Direct),
                    group_count: census.count(ConversationKind::Group),
                    combined_count: census.combined_count,
                    timestamp: Utc::now(),
                    strategy_used: source,
                    network_condition: condition,
                };
                for conversation in census.conversations {
                    state.cache.insert(conversation.id.clone(), conversation);
                }
                if matches!(source, DiscoverySource::Strategy(_) | DiscoverySource::TimedFallback) {
                    state.last_successful = Some(result.clone());
                    state.last_success_at = Some(Instant::now());
                }
                result
            }
            Outcome::Previous(previous) => DiscoveryResult {
                timestamp: Utc::now(),
                strategy_used: DiscoverySource::CachedFallback,
                network_condition: condition,
                ..previous
            },
            Outcome::Empty => DiscoveryResult::empty(condition),
        };

        state.last_result = Some(result.clone());
        result
    }
}

fn recommendations(
    state: &DiscoveryState,
    condition: NetworkCondition,
    in_progress: bool,
    max_attempts: u32,
) -> Vec<String> {
    let mut out = Vec::new();

    if in_progress {
        out.push("Discovery in progress.".to_string());
    }
    if state.total_runs == 0 {
        out.push("Discovery has not run yet.".to_string());
    }
    if condition != NetworkCondition::Stable || state.network_unsuitable {
        out.push(format!(
            "Network conditions not suitable ({}); discovery waits for stability before querying the peer client.",
            condition
        ));
    }
    if state.max_attempts_reached {
        out.push(format!(
            "Max attempts reached ({} rounds) without finding conversations. Check that this identity has conversations, or retry with a forced refresh.",
            max_attempts
        ));
    }
    if let Some(result) = &state.last_result {
        if matches!(result.strategy_used, DiscoverySource::Cache | DiscoverySource::CachedFallback) {
            out.push("Showing cached conversations; a forced refresh may find newer ones.".to_string());
        }
    }
    if let Some(error) = &state.last_error {
        out.push(format!("Last strategy error: {}", error));
    }
    if out.is_empty() {
        out.push("Discovery healthy.".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::error::PeerError;
    use crate::health::{ProbeError, ProbeMethod, Prober};
    use crate::peer::memory::{CallCounts, ListMethod, MemoryPeer};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoProbe;

    #[async_trait]
    impl Prober for NoProbe {
        async fn request(&self, _: &str, _: ProbeMethod, _: Duration) -> Result<u16, ProbeError> {
            Ok(200)
        }
    }

    fn setup(config: DiscoveryConfig) -> (Arc<MemoryPeer>, HealthMonitor, DiscoveryEngine) {
        let peer = Arc::new(MemoryPeer::new());
        let health = HealthMonitor::new(HealthConfig::without_endpoints(), Arc::new(NoProbe));
        let engine = DiscoveryEngine::new(peer.clone(), health.clone(), config);
        (peer, health, engine)
    }

    fn single_round() -> DiscoveryConfig {
        DiscoveryConfig {
            max_attempts: 1,
            ..DiscoveryConfig::default()
        }
    }

    fn friends() -> Vec<Conversation> {
        vec![
            Conversation::direct("dm-1", "alice"),
            Conversation::group("grp-1", "friends"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_strategy_wins() {
        let (peer, _health, engine) = setup(DiscoveryConfig::default());
        peer.set_conversations(friends());

        let result = engine.discover(false).await.unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.direct_count, 1);
        assert_eq!(result.group_count, 1);
        assert_eq!(result.strategy_used, DiscoverySource::Strategy(Strategy::Standard));
        assert_eq!(result.network_condition, NetworkCondition::Stable);
        assert_eq!(engine.cached_conversations().len(), 2);
        assert_eq!(engine.cached_conversation("grp-1").unwrap().name.as_deref(), Some("friends"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_identity_merge_short_circuits() {
        let (peer, _health, engine) = setup(DiscoveryConfig::default());

        // Standard, delayed, forced and the merge's own bulk call see nothing
        for _ in 0..4 {
            peer.push_list_response(ListMethod::All, Ok(Vec::new()));
        }
        // Separate-API sees nothing; the merge's direct call sees three
        peer.push_list_response(ListMethod::Direct, Ok(Vec::new()));
        peer.push_list_response(
            ListMethod::Direct,
            Ok(vec![
                Conversation::direct("dm-1", "alice"),
                Conversation::direct("dm-2", "bob"),
                Conversation::direct("dm-3", "carol"),
            ]),
        );

        let result = engine.discover(true).await.unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(
            result.strategy_used,
            DiscoverySource::Strategy(Strategy::CrossIdentityMerge)
        );

        let report = engine.report();
        let tried: Vec<_> = report.attempts.iter().map(|a| a.strategy).collect();
        assert_eq!(tried, Strategy::CASCADE[..5].to_vec());
        assert_eq!(report.rounds_attempted, 1);
        // Strategies 6 to 8 never touched the peer client
        assert_eq!(CallCounts::get(&peer.calls.list_all), 4);
        assert_eq!(CallCounts::get(&peer.calls.sync), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_cascade_respects_max_attempts() {
        let config = DiscoveryConfig {
            max_attempts: 2,
            ..DiscoveryConfig::default()
        };
        let (peer, _health, engine) = setup(config);

        let result = engine.discover(true).await.unwrap();

        assert!(result.is_empty());
        assert_eq!(result.strategy_used, DiscoverySource::Empty);

        let report = engine.report();
        assert_eq!(report.attempts.len(), 16);
        assert_eq!(report.rounds_attempted, 2);
        assert!(report.recommendations.iter().any(|r| r.contains("Max attempts reached")));
        // Seven bulk listings per round plus the timed fallback
        assert_eq!(CallCounts::get(&peer.calls.list_all), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_cache() {
        let (peer, _health, engine) = setup(single_round());
        peer.set_conversations(friends());
        engine.discover(true).await.unwrap();

        peer.set_conversations(Vec::new());
        let result = engine.discover(true).await.unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.strategy_used, DiscoverySource::Cache);
        assert!(engine
            .report()
            .recommendations
            .iter()
            .any(|r| r.contains("cached conversations")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_last_good_result() {
        let (peer, _health, engine) = setup(single_round());
        peer.set_conversations(friends());
        engine.discover(true).await.unwrap();

        engine.clear_cache();
        peer.set_conversations(Vec::new());
        let result = engine.discover(true).await.unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.strategy_used, DiscoverySource::CachedFallback);
        assert!(engine.cached_conversations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_result_is_last_successful_not_fallback() {
        let (peer, _health, engine) = setup(single_round());
        peer.set_conversations(friends());
        engine.discover(true).await.unwrap();

        engine.clear_cache();
        peer.set_conversations(Vec::new());
        let fallback = engine.discover(true).await.unwrap();
        assert_eq!(fallback.strategy_used, DiscoverySource::CachedFallback);

        let calls = CallCounts::get(&peer.calls.list_all);
        let reused = engine.discover(false).await.unwrap();

        assert_eq!(reused.strategy_used, DiscoverySource::Strategy(Strategy::Standard));
        assert_eq!(reused.total, 2);
        assert_eq!(CallCounts::get(&peer.calls.list_all), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_fallback_call() {
        let (peer, _health, engine) = setup(single_round());
        peer.set_conversations(vec![Conversation::direct("dm-1", "alice")]);
        for _ in 0..7 {
            peer.push_list_response(ListMethod::All, Ok(Vec::new()));
        }
        for _ in 0..3 {
            peer.push_list_response(ListMethod::Direct, Ok(Vec::new()));
            peer.push_list_response(ListMethod::Group, Ok(Vec::new()));
        }

        let result = engine.discover(true).await.unwrap();

        assert_eq!(result.total, 1);
        assert_eq!(result.strategy_used, DiscoverySource::TimedFallback);
        assert_eq!(engine.report().last_successful.unwrap().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_result_reused_until_ttl() {
        let (peer, _health, engine) = setup(DiscoveryConfig::default());
        peer.set_conversations(friends());

        engine.discover(false).await.unwrap();
        engine.discover(false).await.unwrap();
        assert_eq!(CallCounts::get(&peer.calls.list_all), 1);

        engine.discover(true).await.unwrap();
        assert_eq!(CallCounts::get(&peer.calls.list_all), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        engine.discover(false).await.unwrap();
        assert_eq!(CallCounts::get(&peer.calls.list_all), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_discover_runs_once() {
        let (peer, _health, engine) = setup(DiscoveryConfig::default());
        peer.set_conversations(friends());
        // Standard and separate-API come back empty, delayed sync suspends
        peer.push_list_response(ListMethod::All, Ok(Vec::new()));
        peer.push_list_response(ListMethod::Direct, Ok(Vec::new()));
        peer.push_list_response(ListMethod::Group, Ok(Vec::new()));

        let (first, second) = tokio::join!(engine.discover(true), engine.discover(true));
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(first.strategy_used, DiscoverySource::Strategy(Strategy::DelayedSync));
        assert_eq!(second.strategy_used, DiscoverySource::Empty);
        assert_eq!(CallCounts::get(&peer.calls.sync), 3);
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategy_error_recorded() {
        let (peer, _health, engine) = setup(DiscoveryConfig::default());
        peer.set_conversations(friends());
        peer.push_sync_failure(PeerError::new("already mutably borrowed"));

        let result = engine.discover(true).await.unwrap();
        assert_eq!(result.strategy_used, DiscoverySource::Strategy(Strategy::SeparateApi));

        let report = engine.report();
        let error = report.attempts[0].error.as_deref().unwrap();
        assert!(error.starts_with("race_condition"));
        assert!(report.last_error.is_some());
        // Race errors pause for the VM settle delay
        assert!(report.attempts[1].at >= report.attempts[0].at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_network() {
        let (peer, health, engine) = setup(DiscoveryConfig::default());
        peer.set_conversations(friends());
        health.set_online(false);

        let remote = health.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            remote.set_online(true);
        });

        let started = Instant::now();
        let result = engine.discover(true).await.unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy() {
        let (peer, _health, engine) = setup(DiscoveryConfig::default());
        peer.set_conversations(friends());
        engine.discover(true).await.unwrap();

        engine.destroy();
        engine.destroy();

        assert!(engine.is_destroyed());
        assert!(engine.cached_conversations().is_empty());
        assert!(matches!(engine.discover(true).await, Err(EngineError::Destroyed)));
    }

    #[test]
    fn test_recommendations_before_first_run() {
        let state = DiscoveryState::default();
        let recs = recommendations(&state, NetworkCondition::Offline, false, 5);
        assert!(recs.iter().any(|r| r.contains("not run yet")));
        assert!(recs.iter().any(|r| r.contains("not suitable")));

        let state = DiscoveryState {
            total_runs: 1,
            ..DiscoveryState::default()
        };
        assert_eq!(
            recommendations(&state, NetworkCondition::Stable, false, 5),
            vec!["Discovery healthy.".to_string()]
        );
    }
}
