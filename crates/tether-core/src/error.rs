//! Error taxonomy
//!
//! Every failure that comes out of the peer client is classified exactly once,
//! at the boundary where it is received, into a closed [`ErrorKind`]. Subscribers
//! only ever see [`ClassifiedError`] values, never raw peer-client errors.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure raised by the peer client
///
/// The message is whatever the runtime produced. `hint` is set when the
/// peer-client binding can classify the failure itself; otherwise
/// [`classify`] falls back to message heuristics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PeerError {
    pub message: String,
    pub hint: Option<ErrorKind>,
}

impl PeerError {
    /// Create an unclassified peer error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    /// Create a peer error whose kind is already known
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(kind),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        self.hint.unwrap_or_else(|| classify(&self.message))
    }
}

/// Semantic (per-message) failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticError {
    /// Group membership / key epoch disagreement
    EpochMismatch,
    /// Message could not be decoded or decrypted
    DecodeFailure,
}

/// Closed classification of peer-client failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blip or generic stream error
    Transient,
    /// Re-entrant access violation inside the peer client
    RaceCondition,
    /// The peer client's internal VM aborted
    FatalCrash,
    /// Recoverable per-message failure
    Semantic(SemanticError),
}

impl ErrorKind {
    /// Short label for logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RaceCondition => "race_condition",
            ErrorKind::FatalCrash => "fatal_crash",
            ErrorKind::Semantic(SemanticError::EpochMismatch) => "epoch_mismatch",
            ErrorKind::Semantic(SemanticError::DecodeFailure) => "decode_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify a raw peer-client failure message
///
/// These are heuristics over runtime error text. They are not complete; a
/// binding that knows better should construct [`PeerError::with_kind`].
pub fn classify(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();

    if is_race_condition(&msg) {
        ErrorKind::RaceCondition
    } else if is_fatal_crash(&msg) {
        ErrorKind::FatalCrash
    } else if is_epoch_mismatch(&msg) {
        ErrorKind::Semantic(SemanticError::EpochMismatch)
    } else if is_decode_failure(&msg) {
        ErrorKind::Semantic(SemanticError::DecodeFailure)
    } else {
        ErrorKind::Transient
    }
}

fn is_race_condition(msg: &str) -> bool {
    msg.contains("recursive use of an object")
        || msg.contains("already mutably borrowed")
        || msg.contains("already borrowed")
        || msg.contains("unsafe aliasing")
        || msg.contains("borrowmuterror")
        || msg.contains("lock poisoned")
}

fn is_fatal_crash(msg: &str) -> bool {
    msg.contains("unreachable")
        || msg.contains("panicked at")
        || msg.contains("wasm panic")
        || msg.contains("memory access out of bounds")
        || msg.contains("runtimeerror")
        || msg.contains("runtime error")
}

fn is_epoch_mismatch(msg: &str) -> bool {
    msg.contains("epoch")
        && (msg.contains("mismatch")
            || msg.contains("wrong epoch")
            || msg.contains("too old")
            || msg.contains("unknown")
            || msg.contains("invalid"))
}

fn is_decode_failure(msg: &str) -> bool {
    msg.contains("failed to decode")
        || msg.contains("decode error")
        || msg.contains("could not decode")
        || msg.contains("decryption failed")
        || msg.contains("failed to decrypt")
        || msg.contains("decryption error")
}

/// Error delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    /// Consecutive errors at the time this error was recorded
    pub consecutive_errors: u32,
    /// Stream generation the error belongs to
    pub stream_generation: u64,
    /// No further automatic recovery will be attempted
    pub terminal: bool,
    pub occurred_at: DateTime<Utc>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            consecutive_errors: 0,
            stream_generation: 0,
            terminal: false,
            occurred_at: Utc::now(),
        }
    }

    /// Classify a peer error
    pub fn from_peer(error: &PeerError) -> Self {
        Self::new(error.kind(), error.message.clone())
    }

    /// Classify an engine error (timeouts are transient)
    pub fn from_engine(error: &EngineError) -> Self {
        match error {
            EngineError::Peer { kind, source } => Self::new(*kind, source.message.clone()),
            other => Self::new(
                other.kind().unwrap_or(ErrorKind::Transient),
                other.to_string(),
            ),
        }
    }

    /// Attach stream diagnostics
    pub fn with_context(mut self, consecutive_errors: u32, stream_generation: u64) -> Self {
        self.consecutive_errors = consecutive_errors;
        self.stream_generation = stream_generation;
        self
    }

    /// Mark as terminal
    pub fn into_terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Whether callers should back off before touching the peer client again
    pub fn requires_cooldown(&self) -> bool {
        matches!(self.kind, ErrorKind::RaceCondition | ErrorKind::FatalCrash)
    }

    /// Get a recovery hint for this error
    pub fn recovery_hint(&self) -> &'static str {
        if self.terminal {
            return "Restart budget exhausted. Reinitialize the engine or ask the user to reconnect.";
        }
        match self.kind {
            ErrorKind::Transient => "Retrying with backoff.",
            ErrorKind::RaceCondition => {
                "Peer client is busy. Avoid issuing calls until the cooldown elapses."
            }
            ErrorKind::FatalCrash => {
                "Peer client runtime crashed. Waiting for it to recover before reopening the stream."
            }
            ErrorKind::Semantic(SemanticError::EpochMismatch) => {
                "Conversation membership is out of date. A resync has been requested."
            }
            ErrorKind::Semantic(SemanticError::DecodeFailure) => {
                "A message could not be decoded. A resync has been requested."
            }
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}] {} (consecutive={}, generation={})",
            self.kind,
            if self.terminal { ", terminal" } else { "" },
            self.message,
            self.consecutive_errors,
            self.stream_generation
        )
    }
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// The component has been destroyed
    #[error("engine has been destroyed")]
    Destroyed,

    /// Operation was cancelled by stop/destroy
    #[error("operation cancelled")]
    Cancelled,

    /// Operation did not complete in time
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Peer client failure
    #[error("peer client error ({kind}): {source}")]
    Peer {
        kind: ErrorKind,
        #[source]
        source: PeerError,
    },

    /// Restart budget exhausted
    #[error("stream restart budget exhausted after {restarts} restarts")]
    Terminal { restarts: u32 },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<PeerError> for EngineError {
    fn from(source: PeerError) -> Self {
        EngineError::Peer {
            kind: source.kind(),
            source,
        }
    }
}

impl EngineError {
    /// Classification, when this error came from the peer client or a timeout
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::Peer { kind, .. } => Some(*kind),
            EngineError::Timeout { .. } => Some(ErrorKind::Transient),
            _ => None,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_race_condition_classification() {
        assert_eq!(
            classify("recursive use of an object detected which would lead to unsafe aliasing in rust"),
            ErrorKind::RaceCondition
        );
        assert_eq!(classify("BorrowMutError"), ErrorKind::RaceCondition);
    }

    #[test]
    fn test_fatal_crash_classification() {
        assert_eq!(classify("RuntimeError: unreachable"), ErrorKind::FatalCrash);
        assert_eq!(
            classify("panicked at 'index out of bounds'"),
            ErrorKind::FatalCrash
        );
    }

    #[test]
    fn test_semantic_classification() {
        assert_eq!(
            classify("Group epoch mismatch: local 4, remote 6"),
            ErrorKind::Semantic(SemanticError::EpochMismatch)
        );
        assert_eq!(
            classify("Failed to decode message payload"),
            ErrorKind::Semantic(SemanticError::DecodeFailure)
        );
        assert_eq!(
            classify("decryption failed for ciphertext"),
            ErrorKind::Semantic(SemanticError::DecodeFailure)
        );
    }

    #[test]
    fn test_unknown_is_transient() {
        assert_eq!(classify("connection reset by peer"), ErrorKind::Transient);
        assert_eq!(classify(""), ErrorKind::Transient);
    }

    #[test]
    fn test_hint_overrides_heuristics() {
        let err = PeerError::with_kind(ErrorKind::FatalCrash, "connection reset");
        assert_eq!(err.kind(), ErrorKind::FatalCrash);

        let err = PeerError::new("connection reset");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_classified_error_context() {
        let err = ClassifiedError::from_peer(&PeerError::new("already borrowed"))
            .with_context(2, 7)
            .into_terminal();

        assert_eq!(err.kind, ErrorKind::RaceCondition);
        assert_eq!(err.consecutive_errors, 2);
        assert_eq!(err.stream_generation, 7);
        assert!(err.terminal);
        assert!(err.requires_cooldown());
        assert!(err.recovery_hint().contains("Reinitialize"));

        let display = err.to_string();
        assert!(display.contains("race_condition, terminal"));
        assert!(display.contains("generation=7"));
    }

    #[test]
    fn test_engine_error_from_peer() {
        let err: EngineError = PeerError::new("unreachable executed").into();
        assert_eq!(err.kind(), Some(ErrorKind::FatalCrash));
        assert!(err.to_string().contains("fatal_crash"));
        assert_eq!(EngineError::Destroyed.kind(), None);
    }
}
