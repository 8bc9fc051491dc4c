//! Conversation discovery engine
//!
//! Produces a best-effort conversation census from a peer client whose
//! listing calls are eventually consistent. A cascade of strategies is tried
//! over several rounds; the first non-empty result wins. When everything
//! comes back empty the engine falls back to its cache, one last timed call,
//! and finally the previous good result.
//!
//! ## Usage
//!
//! ```ignore
//! let discovery = DiscoveryEngine::new(peer, health, config.discovery.clone());
//! let result = discovery.discover(false).await?;
//! println!("{} conversations via {}", result.total, result.strategy_used);
//! ```

mod engine;
mod strategy;

pub use engine::DiscoveryEngine;
pub use strategy::Strategy;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::NetworkCondition;

/// Where a discovery result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// A cascade strategy found it
    Strategy(Strategy),
    /// The in-memory conversation cache
    Cache,
    /// The single timed call after the cascade came back empty
    TimedFallback,
    /// The previous successful result
    CachedFallback,
    /// Nothing found anywhere
    Empty,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoverySource::Strategy(strategy) => write!(f, "{}", strategy),
            DiscoverySource::Cache => f.write_str("cache"),
            DiscoverySource::TimedFallback => f.write_str("timed_fallback"),
            DiscoverySource::CachedFallback => f.write_str("cached_fallback"),
            DiscoverySource::Empty => f.write_str("empty"),
        }
    }
}

/// Outcome of one discovery call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Unique conversations
    pub total: usize,
    pub direct_count: usize,
    pub group_count: usize,
    /// Entries across all listings before deduplication
    pub combined_count: usize,
    pub timestamp: DateTime<Utc>,
    pub strategy_used: DiscoverySource,
    pub network_condition: NetworkCondition,
}

impl DiscoveryResult {
    pub fn empty(network_condition: NetworkCondition) -> Self {
        Self {
            total: 0,
            direct_count: 0,
            group_count: 0,
            combined_count: 0,
            timestamp: Utc::now(),
            strategy_used: DiscoverySource::Empty,
            network_condition,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// One strategy run, kept for the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    /// 0-based cascade round
    pub round: u32,
    pub total: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Discovery state for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub in_progress: bool,
    pub network_condition: NetworkCondition,
    pub last_result: Option<DiscoveryResult>,
    pub last_successful: Option<DiscoveryResult>,
    pub cached_conversations: usize,
    pub total_runs: u64,
    /// Rounds used by the most recent run
    pub rounds_attempted: u32,
    /// Strategy runs of the most recent run, in order
    pub attempts: Vec<StrategyAttempt>,
    pub last_error: Option<String>,
    pub recommendations: Vec<String>,
}
