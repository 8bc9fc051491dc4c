//! Stream lifecycle manager
//!
//! Keeps one live inbound message stream open against the peer client,
//! classifies and recovers from its failures, and forwards deduplicated
//! messages to subscribers.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Starting -> Active -> Error -> Restarting | Recreating -> Starting -> Active ...
//!                                    \-> Stopped (restart budget exhausted)
//! any -> Stopped (stop/pause/offline), any -> Destroyed (terminal)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let manager = StreamManager::new(peer, health, config.stream.clone());
//! let mut messages = manager.subscribe_messages();
//! manager.start().await?;
//!
//! while let Ok(event) = messages.recv().await {
//!     println!("{}: {}", event.sender_id, event.content);
//! }
//! ```

mod manager;
mod processing;
mod state;

pub use manager::StreamManager;
pub use processing::{inspect, Inspection, MessageEvent, MessageProcessingState, RecentMessages};
pub use state::{StreamPhase, StreamState};
