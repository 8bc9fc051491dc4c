//! Stream manager implementation
//!
//! One task owns the open stream and its read position (`run_stream`).
//! Recovery runs in separately spawned tasks so that a failing stream never
//! waits on its own restart. Every session is tied to a child of the
//! manager's root cancellation token.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::processing::{inspect, Inspection, MessageEvent, MessageProcessingState, RecentMessages};
use super::state::{StreamPhase, StreamState};
use crate::backoff::Backoff;
use crate::config::StreamConfig;
use crate::error::{ClassifiedError, EngineError, EngineResult, ErrorKind, SemanticError};
use crate::flight::SingleFlight;
use crate::health::{HealthMonitor, NetworkStatus};
use crate::peer::{MessageStream, PeerClient, RawMessage};

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// Scheduled recovery action
#[derive(Debug)]
enum Recovery {
    /// Plain restart after a backoff delay
    Restart { delay: Duration },
    /// Full teardown, counter reset, stability wait, then start
    Recreate,
    /// Start once the network is stable
    Deferred,
}

enum StartOutcome {
    AlreadyActive,
    Deferred,
    Opened {
        stream: MessageStream,
        token: CancellationToken,
        generation: u64,
    },
    Cancelled,
    Failed {
        error: EngineError,
        generation: u64,
    },
}

/// Mutable state that is not part of the public snapshot
struct Control {
    /// Token of the current stream session
    session: Option<CancellationToken>,
    /// Token of the pending recovery task
    recovery: Option<CancellationToken>,
    /// No stream creation before this instant
    cooldown_until: Option<Instant>,
    processing: MessageProcessingState,
    recent: RecentMessages,
    last_activity: Instant,
    /// Paused because the network went offline; resume when it returns
    network_paused: bool,
}

struct Inner {
    peer: Arc<dyn PeerClient>,
    health: HealthMonitor,
    config: StreamConfig,
    backoff: Backoff,
    state_tx: watch::Sender<StreamState>,
    transitions_tx: broadcast::Sender<StreamState>,
    message_tx: broadcast::Sender<MessageEvent>,
    error_tx: broadcast::Sender<ClassifiedError>,
    /// Single-flight guard for stream creation
    starting: AtomicBool,
    background_started: AtomicBool,
    /// Bumped by every pause so a start waiting out a cooldown can notice
    pauses: AtomicU64,
    control: Mutex<Control>,
    root: CancellationToken,
}

/// Owns the live inbound message stream
///
/// Cheap to clone; clones share the same stream.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    pub fn new(peer: Arc<dyn PeerClient>, health: HealthMonitor, config: StreamConfig) -> Self {
        let (state_tx, _) = watch::channel(StreamState::default());
        let (transitions_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (message_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (error_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let control = Control {
            session: None,
            recovery: None,
            cooldown_until: None,
            processing: MessageProcessingState::new(config.max_processed_ids),
            recent: RecentMessages::new(config.buffer_size),
            last_activity: Instant::now(),
            network_paused: false,
        };

        Self {
            inner: Arc::new(Inner {
                peer,
                health,
                backoff: Backoff::from_millis(
                    config.restart_base_delay_ms,
                    config.restart_max_delay_ms,
                ),
                config,
                state_tx,
                transitions_tx,
                message_tx,
                error_tx,
                starting: AtomicBool::new(false),
                background_started: AtomicBool::new(false),
                pauses: AtomicU64::new(0),
                control: Mutex::new(control),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Open the stream
    ///
    /// No-op if the stream is already active or a start is in flight. If the
    /// network is not stable the start is deferred until it is. A creation
    /// failure is returned here and also handed to the recovery policy.
    pub async fn start(&self) -> EngineResult<()> {
        self.inner.start().await
    }

    /// Close the stream without resetting counters
    pub async fn pause(&self) {
        self.inner.pause(false).await;
    }

    /// Close the stream and reset error counters
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Shut down for good
    ///
    /// Cancels everything and clears buffers. Safe to call multiple times.
    pub async fn destroy(&self) {
        self.inner.destroy().await;
    }

    /// Current state snapshot
    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    /// Watch the latest state (includes message counters)
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state_tx.subscribe()
    }

    /// Receive a snapshot on every phase transition
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StreamState> {
        self.inner.transitions_tx.subscribe()
    }

    /// Receive forwarded messages
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.inner.message_tx.subscribe()
    }

    /// Receive classified errors
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ClassifiedError> {
        self.inner.error_tx.subscribe()
    }

    /// The last `n` forwarded messages, oldest first
    pub async fn recent_messages(&self, n: usize) -> Vec<MessageEvent> {
        self.inner.control.lock().await.recent.last(n)
    }
}

impl Inner {
    fn state(&self) -> StreamState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, next: StreamPhase) -> bool {
        self.transition_with(next, |_| {})
    }

    /// The only place the phase changes
    ///
    /// Applies `update` together with the phase change and broadcasts the
    /// new snapshot. Returns false if the state machine rejects the move.
    fn transition_with(&self, next: StreamPhase, update: impl FnOnce(&mut StreamState)) -> bool {
        let mut previous = None;
        let mut applied = false;

        self.state_tx.send_if_modified(|state| {
            if state.phase.is_terminal()
                || (state.phase != next && !state.phase.can_transition_to(next))
            {
                return false;
            }
            if state.phase != next {
                previous = Some(state.phase);
            }
            state.phase = next;
            update(state);
            applied = true;
            true
        });

        match previous {
            Some(previous) => {
                let snapshot = self.state();
                debug!(
                    from = %previous,
                    to = %next,
                    generation = snapshot.stream_generation,
                    consecutive_errors = snapshot.consecutive_errors,
                    "Stream phase changed"
                );
                let _ = self.transitions_tx.send(snapshot);
            }
            None if !applied => {
                debug!(current = %self.state().phase, rejected = %next, "Stream transition rejected");
            }
            None => {}
        }

        applied
    }

    async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.root.is_cancelled() {
            return Err(EngineError::Destroyed);
        }
        self.ensure_background();

        let outcome = {
            let Some(_flight) = SingleFlight::acquire(&self.starting) else {
                debug!("Stream start already in flight");
                return Ok(());
            };
            self.start_in_flight().await
        };

        // The flight guard is released before anything is spawned, so
        // recovery triggered by the new session can always start again.
        match outcome {
            StartOutcome::AlreadyActive => Ok(()),
            StartOutcome::Deferred => {
                self.schedule(Recovery::Deferred).await;
                Ok(())
            }
            StartOutcome::Opened {
                stream,
                token,
                generation,
            } => {
                tokio::spawn(Arc::clone(self).run_stream(stream, token, generation));
                Ok(())
            }
            StartOutcome::Cancelled => Err(EngineError::Cancelled),
            StartOutcome::Failed { error, generation } => {
                let classified = ClassifiedError::from_engine(&error);
                match self.handle_failure(classified, generation).await {
                    Some(restarts) => Err(EngineError::Terminal { restarts }),
                    None => Err(error),
                }
            }
        }
    }

    fn start_boxed(self: Arc<Self>) -> BoxFuture<'static, EngineResult<()>> {
        Box::pin(async move { self.start().await })
    }

    async fn start_in_flight(self: &Arc<Self>) -> StartOutcome {
        if self.state().phase == StreamPhase::Active {
            return StartOutcome::AlreadyActive;
        }
        let pauses = self.pauses.load(Ordering::SeqCst);

        if !self.health.is_stable() {
            info!(
                condition = %self.health.network_condition(),
                "Network not suitable, deferring stream start"
            );
            self.transition(StreamPhase::Idle);
            return StartOutcome::Deferred;
        }

        let cooldown_until = self.control.lock().await.cooldown_until;
        if let Some(until) = cooldown_until {
            let now = Instant::now();
            if until > now {
                debug!(
                    remaining_ms = (until - now).as_millis() as u64,
                    "Cooldown lock engaged, waiting before opening stream"
                );
                tokio::select! {
                    _ = self.root.cancelled() => return StartOutcome::Cancelled,
                    _ = tokio::time::sleep_until(until) => {}
                }
            }
        }

        if self.pauses.load(Ordering::SeqCst) != pauses || !self.transition(StreamPhase::Starting) {
            return StartOutcome::Cancelled;
        }

        let token = self.begin_session().await;
        let generation = self.state().stream_generation;

        match self.open_with_retries(&token).await {
            Ok(stream) => {
                self.control.lock().await.last_activity = Instant::now();

                let mut generation = generation;
                let activated = self.transition_with(StreamPhase::Active, |state| {
                    state.consecutive_errors = 0;
                    state.stream_generation += 1;
                    state.last_activity_at = Some(Utc::now());
                    generation = state.stream_generation;
                });

                if !activated || token.is_cancelled() {
                    return StartOutcome::Cancelled;
                }

                info!(generation, "Message stream active");
                StartOutcome::Opened {
                    stream,
                    token,
                    generation,
                }
            }
            Err(EngineError::Cancelled) => StartOutcome::Cancelled,
            Err(error) => StartOutcome::Failed { error, generation },
        }
    }

    /// Cancel any previous session and open a fresh token
    async fn begin_session(&self) -> CancellationToken {
        let token = self.root.child_token();
        let mut control = self.control.lock().await;
        if let Some(previous) = control.session.replace(token.clone()) {
            debug!("Tearing down previous stream session");
            previous.cancel();
        }
        token
    }

    /// Open a stream, retrying generic failures with linear backoff
    ///
    /// Race and crash errors return immediately; they need the cooldown
    /// handled by the recovery policy rather than a quick retry.
    async fn open_with_retries(&self, token: &CancellationToken) -> EngineResult<MessageStream> {
        let attempts = self.config.creation_attempts.max(1);
        let mut last_error = EngineError::Cancelled;

        for attempt in 1..=attempts {
            let consecutive_errors = self.state().consecutive_errors;
            let timeout = self.config.creation_timeout(consecutive_errors);

            let result = tokio::select! {
                _ = token.cancelled() => return Err(EngineError::Cancelled),
                result = tokio::time::timeout(timeout, self.peer.open_message_stream()) => result,
            };

            match result {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(peer_error)) => {
                    let kind = peer_error.kind();
                    warn!(attempt, attempts, %kind, error = %peer_error, "Stream creation failed");
                    last_error = peer_error.into();
                    if matches!(kind, ErrorKind::RaceCondition | ErrorKind::FatalCrash) {
                        return Err(last_error);
                    }
                }
                Err(_) => {
                    warn!(attempt, attempts, timeout_ms = timeout.as_millis() as u64, "Stream creation timed out");
                    last_error = EngineError::Timeout {
                        operation: "open_message_stream",
                        timeout,
                    };
                }
            }

            if attempt < attempts {
                let delay = self.config.creation_retry_delay() * attempt;
                tokio::select! {
                    _ = token.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(last_error)
    }

    /// Message-processing loop for one stream session
    async fn run_stream(
        self: Arc<Self>,
        mut stream: MessageStream,
        token: CancellationToken,
        generation: u64,
    ) {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    debug!(generation, "Stream session cancelled");
                    return;
                }
                next = stream.next() => next,
            };

            let failure = match next {
                Some(Ok(raw)) => self.process_message(raw, generation).await.err(),
                Some(Err(peer_error)) => {
                    let classified = ClassifiedError::from_peer(&peer_error);
                    match classified.kind {
                        ErrorKind::Semantic(kind) => {
                            self.handle_semantic(kind, None, generation).await.err()
                        }
                        _ => Some(classified),
                    }
                }
                None => Some(ClassifiedError::new(
                    ErrorKind::Transient,
                    "message stream ended unexpectedly",
                )),
            };

            if let Some(failure) = failure {
                if !token.is_cancelled() {
                    self.handle_failure(failure, generation).await;
                }
                return;
            }

            // Keep the runtime responsive under heavy message volume
            tokio::task::yield_now().await;
        }
    }

    async fn process_message(
        self: &Arc<Self>,
        raw: RawMessage,
        generation: u64,
    ) -> Result<(), ClassifiedError> {
        let mut control = self.control.lock().await;

        if control.processing.is_processed(&raw.id) {
            debug!(message_id = %raw.id, "Duplicate message suppressed");
            return Ok(());
        }

        match inspect(&raw) {
            Inspection::Welcome => {
                let count = control.processing.record_special(&raw.id, Instant::now());
                drop(control);

                if count > self.config.max_special_retries {
                    debug!(message_id = %raw.id, count, "Dropping repeated system message");
                } else {
                    debug!(
                        message_id = %raw.id,
                        conversation_id = %raw.conversation_id,
                        count,
                        "System message, resyncing conversation"
                    );
                    self.spawn_resync(Some(raw.conversation_id));
                }
                return Ok(());
            }
            Inspection::Semantic(kind) => {
                drop(control);
                return self
                    .handle_semantic(kind, Some(raw.conversation_id), generation)
                    .await;
            }
            Inspection::Clean => {}
        }

        let now = Instant::now();
        control.processing.reset_decode_failures();
        control.processing.mark_processed(&raw.id, now);
        control.last_activity = now;

        let event = MessageEvent::from_raw(raw, generation);
        control.recent.push(event.clone());
        drop(control);

        self.state_tx.send_modify(|state| {
            state.message_count += 1;
            state.last_activity_at = Some(Utc::now());
            // A generation that delivers messages has recovered
            state.restart_count = 0;
        });

        if self.message_tx.send(event).is_err() {
            debug!("No message subscribers");
        }
        Ok(())
    }

    /// Handle an unreadable message locally
    ///
    /// Triggers a rate-limited resync and escalates to a stream error after
    /// too many consecutive failures.
    async fn handle_semantic(
        self: &Arc<Self>,
        kind: SemanticError,
        conversation_id: Option<String>,
        generation: u64,
    ) -> Result<(), ClassifiedError> {
        let (failures, resync) = {
            let mut control = self.control.lock().await;
            let failures = control.processing.record_decode_failure();
            let resync = control
                .processing
                .should_resync(Instant::now(), self.config.special_error_cooldown());
            (failures, resync)
        };

        let error_kind = ErrorKind::Semantic(kind);
        warn!(
            kind = %error_kind,
            failures,
            generation,
            conversation_id = conversation_id.as_deref().unwrap_or("*"),
            resync,
            "Unreadable message"
        );

        if resync {
            self.spawn_resync(conversation_id);
        }

        if failures >= self.config.max_decode_failures {
            self.control.lock().await.processing.reset_decode_failures();
            return Err(ClassifiedError::new(
                error_kind,
                format!("{} consecutive {} failures", failures, error_kind),
            ));
        }
        Ok(())
    }

    fn spawn_resync(&self, conversation_id: Option<String>) {
        let peer = Arc::clone(&self.peer);
        let token = self.root.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = async {
                    match conversation_id.as_deref() {
                        Some(id) => peer.sync_conversation(id).await,
                        None => peer.sync().await,
                    }
                } => result,
            };
            if let Err(e) = result {
                warn!(error = %e, "Resync failed");
            }
        });
    }

    /// Recovery policy
    ///
    /// Records the error, engages cooldown locks, and schedules a restart
    /// (below the recreation threshold), a recreation (at it), or gives up
    /// (restart budget exhausted). Returns the restart count when it gives up.
    async fn handle_failure(self: &Arc<Self>, error: ClassifiedError, generation: u64) -> Option<u32> {
        if self.root.is_cancelled() {
            return None;
        }

        let current = self.state();
        if current.stream_generation != generation
            || !matches!(current.phase, StreamPhase::Starting | StreamPhase::Active)
        {
            debug!(
                generation,
                current_generation = current.stream_generation,
                phase = %current.phase,
                "Ignoring failure from inactive session"
            );
            return None;
        }

        {
            let mut control = self.control.lock().await;
            if let Some(session) = control.session.take() {
                session.cancel();
            }

            let hold = match error.kind {
                ErrorKind::RaceCondition => Some(self.config.race_cooldown()),
                ErrorKind::FatalCrash => Some(self.config.fatal_recovery_delay()),
                _ => None,
            };
            if let Some(hold) = hold {
                let until = Instant::now() + hold;
                control.cooldown_until = Some(control.cooldown_until.map_or(until, |c| c.max(until)));
                debug!(hold_ms = hold.as_millis() as u64, kind = %error.kind, "Cooldown lock engaged");
            }
        }

        let mut snapshot = None;
        self.transition_with(StreamPhase::Error, |state| {
            state.consecutive_errors += 1;
            match error.kind {
                ErrorKind::RaceCondition => state.race_error_detected = true,
                ErrorKind::FatalCrash => state.wasm_panic_detected = true,
                _ => {}
            }
            snapshot = Some(state.clone());
        });
        let Some(snapshot) = snapshot else {
            return None;
        };

        let classified = error.with_context(snapshot.consecutive_errors, generation);

        if snapshot.restart_count > self.config.max_restarts {
            let terminal = classified.into_terminal();
            error!(
                restarts = snapshot.restart_count,
                error = %terminal,
                "Restart budget exhausted, giving up on stream"
            );
            let _ = self.error_tx.send(terminal);
            self.transition(StreamPhase::Stopped);
            return Some(snapshot.restart_count);
        }

        warn!(
            kind = %classified.kind,
            consecutive_errors = snapshot.consecutive_errors,
            restart_count = snapshot.restart_count,
            generation,
            error = %classified.message,
            "Stream error"
        );
        let _ = self.error_tx.send(classified);

        let recovery = if snapshot.consecutive_errors >= self.config.recreate_threshold {
            Recovery::Recreate
        } else {
            Recovery::Restart {
                delay: self.backoff.delay(snapshot.restart_count),
            }
        };

        self.state_tx.send_modify(|state| state.restart_count += 1);
        self.schedule(recovery).await;
        None
    }

    /// Replace any pending recovery with a new one
    async fn schedule(self: &Arc<Self>, recovery: Recovery) {
        let token = self.root.child_token();
        {
            let mut control = self.control.lock().await;
            if let Some(previous) = control.recovery.replace(token.clone()) {
                previous.cancel();
            }
        }
        debug!(?recovery, "Recovery scheduled");
        tokio::spawn(Arc::clone(self).run_recovery(recovery, token));
    }

    async fn run_recovery(self: Arc<Self>, recovery: Recovery, token: CancellationToken) {
        match recovery {
            Recovery::Restart { delay } => {
                if !self.transition(StreamPhase::Restarting) {
                    return;
                }
                info!(delay_ms = delay.as_millis() as u64, "Restarting stream after backoff");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Recovery::Recreate => {
                if !self.transition_with(StreamPhase::Recreating, |state| {
                    state.consecutive_errors = 0;
                }) {
                    return;
                }
                info!("Recreating stream after repeated errors");
                {
                    let mut control = self.control.lock().await;
                    if let Some(session) = control.session.take() {
                        session.cancel();
                    }
                    control.processing.reset_counters();
                }

                let stable = tokio::select! {
                    _ = token.cancelled() => return,
                    stable = self.health.wait_for_stability(self.config.stability_timeout()) => stable,
                };
                if !stable {
                    warn!("Network still unstable, recreating stream anyway");
                }
            }
            Recovery::Deferred => loop {
                if self.health.is_destroyed() {
                    return;
                }
                let stable = tokio::select! {
                    _ = token.cancelled() => return,
                    stable = self.health.wait_for_stability(self.config.stability_timeout()) => stable,
                };
                if stable {
                    break;
                }
                debug!("Still waiting for a stable network");
            },
        }

        if token.is_cancelled() {
            return;
        }
        if let Err(e) = self.start_boxed().await {
            debug!(error = %e, "Recovery start did not complete");
        }
    }

    async fn pause(&self, network: bool) {
        {
            let mut control = self.control.lock().await;
            if let Some(session) = control.session.take() {
                session.cancel();
            }
            if let Some(recovery) = control.recovery.take() {
                recovery.cancel();
            }
            control.network_paused = network;
        }
        self.pauses.fetch_add(1, Ordering::SeqCst);

        if self.transition(StreamPhase::Stopped) {
            info!(network, "Stream paused");
        }
    }

    async fn stop(&self) {
        self.pause(false).await;
        self.control.lock().await.processing.reset_counters();
        self.state_tx.send_modify(StreamState::reset_counters);
        info!("Stream stopped");
    }

    async fn destroy(&self) {
        if self.root.is_cancelled() {
            return;
        }
        self.root.cancel();

        {
            let mut control = self.control.lock().await;
            control.session = None;
            control.recovery = None;
            control.processing.clear();
            control.recent.clear();
        }

        self.transition(StreamPhase::Destroyed);
        info!("Stream manager destroyed");
    }

    /// Spawn the health self-check and network watcher once
    fn ensure_background(self: &Arc<Self>) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(health_check_loop(
            Arc::downgrade(self),
            self.root.clone(),
            self.config.health_check_interval(),
        ));
        tokio::spawn(network_watch_loop(
            Arc::downgrade(self),
            self.root.clone(),
            self.health.subscribe(),
        ));
    }

    /// Periodic self-check: prune old message ids and detect silent streams
    async fn check_health(self: &Arc<Self>) {
        let now = Instant::now();
        let (idle, pruned) = {
            let mut control = self.control.lock().await;
            let pruned = control
                .processing
                .prune(now, self.config.processed_id_ttl());
            debug!(
                remembered = control.processing.processed_len(),
                decode_failures = control.processing.consecutive_decode_failures(),
                "Stream health check"
            );
            (now.saturating_duration_since(control.last_activity), pruned)
        };

        if pruned > 0 {
            debug!(pruned, "Pruned processed message ids");
        }

        let state = self.state();
        if state.phase == StreamPhase::Active && idle > self.config.stale_timeout() {
            warn!(
                idle_secs = idle.as_secs(),
                generation = state.stream_generation,
                "No stream activity, treating stream as dead"
            );
            // The stream opened and held for the whole stale window, so a
            // quiet conversation does not count against the restart budget.
            self.state_tx.send_modify(|state| state.restart_count = 0);
            let error = ClassifiedError::new(
                ErrorKind::Transient,
                format!("no stream activity for {}s", idle.as_secs()),
            );
            self.handle_failure(error, state.stream_generation).await;
        }
    }

    async fn on_connectivity(self: &Arc<Self>, online: bool) {
        let phase = self.state().phase;

        if !online {
            if matches!(phase, StreamPhase::Active | StreamPhase::Starting) {
                info!("Network offline, pausing stream");
                self.pause(true).await;
            }
            return;
        }

        let resume = std::mem::take(&mut self.control.lock().await.network_paused);
        if resume && phase == StreamPhase::Stopped {
            info!("Network back online, resuming stream once stable");
            self.schedule(Recovery::Deferred).await;
        }
    }
}

async fn health_check_loop(inner: Weak<Inner>, root: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.check_health().await;
    }
}

async fn network_watch_loop(
    inner: Weak<Inner>,
    root: CancellationToken,
    mut status: watch::Receiver<NetworkStatus>,
) {
    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let online = status.borrow_and_update().is_online;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_connectivity(online).await;
    }
}
