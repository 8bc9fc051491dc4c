//! Simulate command handler
//!
//! Drives a full engine against the in-memory peer: scripted stream
//! failures, a batch of inbound messages and one discovery run. Timings are
//! compressed so a run finishes in a few seconds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use tether_core::peer::memory::{ListMethod, MemoryPeer};
use tether_core::{
    ClassifiedError, Config, ConsentState, Conversation, ErrorKind, HealthMonitor, MessageEvent, PeerError,
    RawMessage, StreamPhase, StreamState, SyncEngine,
};

use crate::output::{Output, OutputFormat};

const ACTIVE_WAIT: Duration = Duration::from_secs(30);
const SETTLE: Duration = Duration::from_millis(300);

/// What to script into the in-memory peer
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub messages: usize,
    pub race_errors: usize,
    pub crashes: usize,
    pub decode_errors: usize,
    pub conversations: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    State(StreamState),
    Message(MessageEvent),
    Error(ClassifiedError),
}

/// Run one simulated session and print what the engine did
pub async fn run(config: &Config, options: SimulateOptions, output: &Output) -> Result<()> {
    let config = compressed(config, &options);
    let peer = Arc::new(scripted_peer(&options));

    let health = HealthMonitor::with_http(config.health.clone());
    let engine = SyncEngine::new(peer.clone(), config, health)
        .context("Failed to create sync engine")?;

    let (stop_tx, stop_rx) = oneshot::channel();
    let collector = tokio::spawn(collect_events(
        engine.subscribe_stream_state(),
        engine.subscribe_messages(),
        engine.subscribe_errors(),
        stop_rx,
        output.format,
    ));

    engine.start().await.context("Failed to start sync engine")?;

    let mut state = engine.stream().watch_state();
    // Map the borrowed snapshot away so the watch lock is released here
    let active = tokio::time::timeout(
        ACTIVE_WAIT,
        state.wait_for(|s| s.phase == StreamPhase::Active),
    )
    .await
    .map(|ready| ready.is_ok())
    .unwrap_or(false);
    if !active {
        let phase = engine.stream_state().phase;
        engine.destroy().await;
        bail!("Stream did not become active (last phase: {})", phase);
    }

    let undelivered = deliver_messages(&peer, &options);
    if undelivered > 0 {
        tracing::warn!(undelivered, "Some simulated messages found no open stream");
    }
    tokio::time::sleep(SETTLE).await;

    let result = engine.discover(true).await.context("Discovery failed")?;
    let report = engine.discovery_report();

    tokio::time::sleep(SETTLE).await;
    let _ = stop_tx.send(());
    let events = collector.await.context("Event collector panicked")?;

    let final_state = engine.stream_state();
    let forwarded = events
        .iter()
        .filter(|e| matches!(e, Event::Message(_)))
        .count();

    match output.format {
        OutputFormat::Json => {
            output.print_json(&serde_json::json!({
                "engine": engine.id(),
                "events": events,
                "final_state": final_state,
                "discovery": { "result": result, "report": report },
            }))?;
        }
        OutputFormat::Human => {
            println!();
            output.print_discovery(&result, &report)?;
            println!();
            println!(
                "Forwarded {} message(s); stream {} at generation {} after {} restart(s)",
                forwarded,
                final_state.phase,
                final_state.stream_generation,
                final_state.restart_count
            );
        }
        OutputFormat::Quiet => {
            println!("{} {}", forwarded, result.total);
        }
    }

    engine.destroy().await;
    Ok(())
}

/// Shrink every delay so the simulation runs in seconds
fn compressed(config: &Config, options: &SimulateOptions) -> Config {
    let mut config = config.clone();

    // The in-memory peer needs no network
    config.health.endpoints.clear();

    let stream = &mut config.stream;
    stream.creation_timeout_ms = 2_000;
    stream.creation_timeout_step_ms = 500;
    stream.max_creation_timeout_ms = 4_000;
    stream.creation_retry_delay_ms = 100;
    stream.race_cooldown_ms = 500;
    stream.fatal_recovery_delay_ms = 1_000;
    stream.restart_base_delay_ms = 200;
    stream.restart_max_delay_ms = 2_000;
    stream.stability_timeout_ms = 2_000;
    let scripted = (options.race_errors + options.crashes) as u32;
    stream.max_restarts = stream.max_restarts.max(scripted + 2);

    let discovery = &mut config.discovery;
    discovery.base_delay_ms = 100;
    discovery.max_delay_ms = 1_000;
    discovery.propagation_delay_ms = 200;
    discovery.vm_stabilization_delay_ms = 100;
    discovery.inter_call_delay_ms = 50;
    discovery.stability_timeout_ms = 1_000;
    discovery.interval_ms = 0;

    config
}

fn scripted_peer(options: &SimulateOptions) -> MemoryPeer {
    let peer = MemoryPeer::new();

    let conversations: Vec<Conversation> = (0..options.conversations)
        .map(|i| {
            if i % 3 == 2 {
                // Groups the simulated user joined themselves
                Conversation::group(format!("grp-{}", i), format!("Group {}", i))
                    .with_consent(ConsentState::Allowed)
            } else {
                Conversation::direct(format!("dm-{}", i), format!("peer-{}", i))
            }
        })
        .collect();
    peer.set_conversations(conversations);

    // The bulk listing lags behind, so the cascade has to move past it
    peer.push_list_response(ListMethod::All, Ok(Vec::new()));

    for i in 0..options.race_errors {
        peer.push_open_failure(PeerError::with_kind(
            ErrorKind::RaceCondition,
            format!("recursive use of an object detected ({})", i + 1),
        ));
    }
    for i in 0..options.crashes {
        peer.push_open_failure(PeerError::with_kind(
            ErrorKind::FatalCrash,
            format!("RuntimeError: unreachable ({})", i + 1),
        ));
    }

    peer
}

/// Push clean messages, one duplicate, then broken ones; returns how many
/// found no open stream
fn deliver_messages(peer: &MemoryPeer, options: &SimulateOptions) -> usize {
    let conversation = |i: usize| {
        if options.conversations == 0 {
            "dm-0".to_string()
        } else {
            let n = i % options.conversations;
            if n % 3 == 2 {
                format!("grp-{}", n)
            } else {
                format!("dm-{}", n)
            }
        }
    };

    let mut batch: Vec<RawMessage> = (0..options.messages)
        .map(|i| {
            RawMessage::text(
                format!("msg-{}", i),
                conversation(i),
                format!("peer-{}", i % 4),
                format!("hello #{}", i),
            )
        })
        .collect();
    if let Some(first) = batch.first().cloned() {
        batch.push(first);
    }
    batch.extend((0..options.decode_errors).map(|i| {
        RawMessage::text(
            format!("broken-{}", i),
            conversation(i),
            "peer-0",
            "failed to decode message payload",
        )
        .with_content_type("decode_error")
    }));

    batch
        .into_iter()
        .filter(|message| !peer.deliver(message.clone()))
        .count()
}

async fn collect_events(
    mut states: broadcast::Receiver<StreamState>,
    mut messages: broadcast::Receiver<MessageEvent>,
    mut errors: broadcast::Receiver<ClassifiedError>,
    mut stop: oneshot::Receiver<()>,
    format: OutputFormat,
) -> Vec<Event> {
    let output = Output::new(format);
    let mut events = Vec::new();

    loop {
        let event = tokio::select! {
            _ = &mut stop => break,
            Some(state) = next(&mut states) => {
                output.stream_state(&state);
                Event::State(state)
            }
            Some(message) = next(&mut messages) => {
                output.stream_message(&message);
                Event::Message(message)
            }
            Some(error) = next(&mut errors) => {
                output.stream_error(&error);
                Event::Error(error)
            }
        };
        events.push(event);
    }

    events
}

/// Next value from a broadcast receiver, skipping over lag
async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(value) => return Some(value),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Simulation event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimulateOptions {
        SimulateOptions {
            messages: 4,
            race_errors: 1,
            crashes: 1,
            decode_errors: 2,
            conversations: 6,
        }
    }

    #[test]
    fn test_compressed_config_is_valid() {
        let config = compressed(&Config::default(), &options());
        config.validate().unwrap();
        assert!(config.health.endpoints.is_empty());
        assert_eq!(config.discovery.interval_ms, 0);
        assert!(config.stream.max_restarts >= 4);
    }

    #[tokio::test]
    async fn test_scripted_peer_lists_conversations() {
        use tether_core::PeerClient;

        let peer = scripted_peer(&options());
        // First bulk listing is scripted empty
        assert!(peer.list().await.unwrap().is_empty());
        assert_eq!(peer.list().await.unwrap().len(), 6);
        let groups = peer.list_group().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|c| c.consent == ConsentState::Allowed));
        let direct = peer.list_direct().await.unwrap();
        assert!(direct.iter().all(|c| c.consent == ConsentState::Unknown));
    }

    #[test]
    fn test_deliver_without_stream() {
        let peer = MemoryPeer::new();
        // 4 messages, 1 duplicate, 2 broken
        assert_eq!(deliver_messages(&peer, &options()), 7);
    }
}
