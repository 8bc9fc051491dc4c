//! Stream lifecycle state

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of the message stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Not started, or waiting for the network before starting
    #[default]
    Idle,
    /// Opening a stream
    Starting,
    /// Stream open and messages flowing
    Active,
    /// Last stream failed; recovery about to be scheduled
    Error,
    /// Waiting out a backoff delay before a plain restart
    Restarting,
    /// Tearing down and rebuilding after repeated errors
    Recreating,
    /// Stopped by the caller, the network, or an exhausted restart budget
    Stopped,
    /// Irreversibly shut down
    Destroyed,
}

impl StreamPhase {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: StreamPhase) -> bool {
        use StreamPhase::*;

        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) | (_, Stopped) => true,
            (Starting, Active) => true,
            (_, Active) => false,
            (Idle | Stopped | Restarting | Recreating | Error, Starting) => true,
            (Starting | Active, Error) => true,
            (Error, Restarting | Recreating) => true,
            (Starting | Restarting | Recreating | Stopped, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == StreamPhase::Destroyed
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamPhase::Idle => "idle",
            StreamPhase::Starting => "starting",
            StreamPhase::Active => "active",
            StreamPhase::Error => "error",
            StreamPhase::Restarting => "restarting",
            StreamPhase::Recreating => "recreating",
            StreamPhase::Stopped => "stopped",
            StreamPhase::Destroyed => "destroyed",
        };
        f.pad(label)
    }
}

/// Snapshot of the stream manager's state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub phase: StreamPhase,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub restart_count: u32,
    pub consecutive_errors: u32,
    /// Incremented each time a stream opens successfully
    pub stream_generation: u64,
    pub wasm_panic_detected: bool,
    pub race_error_detected: bool,
}

impl StreamState {
    /// Clear error bookkeeping (phase and generation are kept)
    pub fn reset_counters(&mut self) {
        self.restart_count = 0;
        self.consecutive_errors = 0;
        self.wasm_panic_detected = false;
        self.race_error_detected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use StreamPhase::*;
        let path = [Idle, Starting, Active, Error, Restarting, Starting, Active];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(Error.can_transition_to(Recreating));
        assert!(Recreating.can_transition_to(Starting));
    }

    #[test]
    fn test_active_only_from_starting() {
        use StreamPhase::*;
        for phase in [Idle, Active, Error, Restarting, Recreating, Stopped] {
            assert!(!phase.can_transition_to(Active), "{} -> active", phase);
        }
    }

    #[test]
    fn test_destroyed_is_terminal() {
        use StreamPhase::*;
        for next in [Idle, Starting, Active, Error, Stopped, Destroyed] {
            assert!(!Destroyed.can_transition_to(next));
        }
        assert!(Destroyed.is_terminal());
        assert!(Active.can_transition_to(Destroyed));
    }

    #[test]
    fn test_reset_counters_keeps_generation() {
        let mut state = StreamState {
            phase: StreamPhase::Active,
            restart_count: 3,
            consecutive_errors: 2,
            stream_generation: 4,
            wasm_panic_detected: true,
            race_error_detected: true,
            ..StreamState::default()
        };
        state.reset_counters();

        assert_eq!(state.restart_count, 0);
        assert_eq!(state.consecutive_errors, 0);
        assert!(!state.wasm_panic_detected && !state.race_error_detected);
        assert_eq!(state.stream_generation, 4);
        assert_eq!(state.phase, StreamPhase::Active);
    }
}
