//! Tether Core Library
//!
//! A resilient synchronization layer around an unreliable peer messaging
//! client. The peer client owns the protocol, cryptography and storage;
//! this crate keeps its live message stream open, reconciles its
//! eventually-consistent conversation listings, and gates both on real
//! network connectivity.
//!
//! # Architecture
//!
//! - **HealthMonitor**: connectivity plus periodic endpoint probes
//! - **StreamManager**: one live inbound stream with classified recovery
//! - **DiscoveryEngine**: cascading conversation discovery with fallbacks
//!
//! Events fan out over tokio channels; dropping a receiver unsubscribes.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let engine = SyncEngine::initialize(peer, config).await?;
//!
//! let mut messages = engine.subscribe_messages();
//! let census = engine.discover(false).await?;
//!
//! while let Ok(event) = messages.recv().await {
//!     println!("{}: {}", event.sender_id, event.content);
//! }
//! ```
//!
//! # Modules
//!
//! - `engine`: Facade tying the components together (main entry point)
//! - `health`: Network health monitor
//! - `stream`: Stream lifecycle manager
//! - `discovery`: Conversation discovery engine
//! - `peer`: Peer client trait and an in-memory implementation
//! - `error`: Error classification
//! - `config`: Engine configuration

pub mod backoff;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
mod flight;
pub mod health;
pub mod peer;
pub mod stream;

pub use config::Config;
pub use discovery::{DiscoveryEngine, DiscoveryReport, DiscoveryResult, DiscoverySource, Strategy};
pub use engine::SyncEngine;
pub use error::{classify, ClassifiedError, EngineError, EngineResult, ErrorKind, PeerError, SemanticError};
pub use health::{EndpointHealth, HealthMonitor, NetworkCondition, NetworkStatus};
pub use peer::{ConsentState, Conversation, ConversationKind, PeerClient, RawMessage};
pub use stream::{MessageEvent, StreamManager, StreamPhase, StreamState};
