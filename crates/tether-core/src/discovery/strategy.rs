//! Discovery strategies
//!
//! Each strategy varies which listing primitive is called and with what
//! ordering and delay. Retrying one call is not enough because the peer
//! client's failure modes are often method specific.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::PeerError;
use crate::peer::{Conversation, ConversationKind, PeerClient};

/// Discovery strategy, in cascade order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// sync then list
    Standard,
    /// sync, then direct and group listings merged
    SeparateApi,
    /// sync, wait for propagation, then list
    DelayedSync,
    /// several syncs before listing
    ForcedMultiSync,
    /// union of every listing method
    CrossIdentityMerge,
    /// several sync rounds with VM settle time between them
    DeepMultiRound,
    /// each listing method on its own with delays between calls
    IdentityScoped,
    /// settle delay, conservative timeouts, bulk then per-type fallback
    VmStabilized,
}

impl Strategy {
    pub const CASCADE: [Strategy; 8] = [
        Strategy::Standard,
        Strategy::SeparateApi,
        Strategy::DelayedSync,
        Strategy::ForcedMultiSync,
        Strategy::CrossIdentityMerge,
        Strategy::DeepMultiRound,
        Strategy::IdentityScoped,
        Strategy::VmStabilized,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Standard => "standard",
            Strategy::SeparateApi => "separate_api",
            Strategy::DelayedSync => "delayed_sync",
            Strategy::ForcedMultiSync => "forced_multi_sync",
            Strategy::CrossIdentityMerge => "cross_identity_merge",
            Strategy::DeepMultiRound => "deep_multi_round",
            Strategy::IdentityScoped => "identity_scoped",
            Strategy::VmStabilized => "vm_stabilized",
        }
    }

    /// Timeout for one run of this strategy
    pub fn timeout(&self, config: &DiscoveryConfig) -> Duration {
        match self {
            Strategy::VmStabilized => config.conservative_timeout(),
            _ => config.strategy_timeout(),
        }
    }

    pub(crate) async fn run(
        self,
        peer: &dyn PeerClient,
        config: &DiscoveryConfig,
    ) -> Result<Census, PeerError> {
        match self {
            Strategy::Standard => {
                peer.sync().await?;
                Ok(Census::merge([peer.list().await?]))
            }
            Strategy::SeparateApi => {
                peer.sync().await?;
                let direct = peer.list_direct().await?;
                let group = peer.list_group().await?;
                Ok(Census::merge([direct, group]))
            }
            Strategy::DelayedSync => {
                peer.sync().await?;
                tokio::time::sleep(config.propagation_delay()).await;
                Ok(Census::merge([peer.list().await?]))
            }
            Strategy::ForcedMultiSync => {
                for i in 0..config.forced_sync_count.max(1) {
                    if i > 0 {
                        tokio::time::sleep(config.inter_call_delay()).await;
                    }
                    peer.sync().await?;
                }
                Ok(Census::merge([peer.list().await?]))
            }
            Strategy::CrossIdentityMerge => {
                peer.sync().await?;
                let listings = vec![
                    peer.list().await,
                    peer.list_direct().await,
                    peer.list_group().await,
                ];
                Census::merge_partial(listings)
            }
            Strategy::DeepMultiRound => {
                for _ in 0..config.deep_sync_rounds.max(1) {
                    peer.sync().await?;
                    tokio::time::sleep(config.vm_stabilization_delay()).await;
                }
                Ok(Census::merge([peer.list().await?]))
            }
            Strategy::IdentityScoped => {
                let direct = peer.list_direct().await;
                tokio::time::sleep(config.inter_call_delay()).await;
                let group = peer.list_group().await;
                tokio::time::sleep(config.inter_call_delay()).await;
                let all = peer.list().await;
                Census::merge_partial(vec![direct, group, all])
            }
            Strategy::VmStabilized => {
                tokio::time::sleep(config.vm_stabilization_delay()).await;
                peer.sync().await?;
                match peer.list().await {
                    Ok(all) => Ok(Census::merge([all])),
                    Err(e) => {
                        debug!(error = %e, "Bulk listing failed, falling back to per-type listings");
                        tokio::time::sleep(config.vm_stabilization_delay()).await;
                        let direct = peer.list_direct().await?;
                        let group = peer.list_group().await?;
                        Ok(Census::merge([direct, group]))
                    }
                }
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Conversations found by one strategy run, deduplicated by id
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Census {
    pub conversations: Vec<Conversation>,
    /// Entries returned across all listings before deduplication
    pub combined_count: usize,
}

impl Census {
    /// Union of listings, first occurrence of each id wins
    pub fn merge<I>(listings: I) -> Self
    where
        I: IntoIterator<Item = Vec<Conversation>>,
    {
        let mut seen = HashSet::new();
        let mut census = Census::default();

        for listing in listings {
            census.combined_count += listing.len();
            for conversation in listing {
                if seen.insert(conversation.id.clone()) {
                    census.conversations.push(conversation);
                }
            }
        }
        census
    }

    /// Merge whichever listings succeeded; fails only if all of them failed
    pub fn merge_partial(listings: Vec<Result<Vec<Conversation>, PeerError>>) -> Result<Self, PeerError> {
        let mut last_error = None;
        let mut ok = Vec::new();

        for listing in listings {
            match listing {
                Ok(conversations) => ok.push(conversations),
                Err(e) => {
                    debug!(error = %e, "Listing failed, merging the others");
                    last_error = Some(e);
                }
            }
        }

        match (ok.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(Self::merge(ok)),
        }
    }

    pub fn total(&self) -> usize {
        self.conversations.len()
    }

    pub fn count(&self, kind: ConversationKind) -> usize {
        self.conversations.iter().filter(|c| c.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::memory::{CallCounts, ListMethod, MemoryPeer};

    #[test]
    fn test_merge_dedups_by_id() {
        let census = Census::merge([
            vec![Conversation::direct("dm-1", "alice"), Conversation::group("grp-1", "team")],
            vec![Conversation::direct("dm-1", "alice")],
            vec![Conversation::direct("dm-2", "bob")],
        ]);

        assert_eq!(census.total(), 3);
        assert_eq!(census.combined_count, 4);
        assert_eq!(census.count(ConversationKind::Direct), 2);
        assert_eq!(census.count(ConversationKind::Group), 1);
    }

    #[test]
    fn test_merge_partial() {
        let census = Census::merge_partial(vec![
            Err(PeerError::new("boom")),
            Ok(vec![Conversation::direct("dm-1", "alice")]),
        ])
        .unwrap();
        assert_eq!(census.total(), 1);

        let err = Census::merge_partial(vec![Err(PeerError::new("a")), Err(PeerError::new("b"))]);
        assert_eq!(err.unwrap_err().message, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_multi_sync_repeats_sync() {
        let peer = MemoryPeer::new();
        peer.set_conversations(vec![Conversation::direct("dm-1", "alice")]);
        let config = DiscoveryConfig::default();

        let census = Strategy::ForcedMultiSync.run(&peer, &config).await.unwrap();

        assert_eq!(census.total(), 1);
        assert_eq!(CallCounts::get(&peer.calls.sync), 3);
        assert_eq!(CallCounts::get(&peer.calls.list_all), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vm_stabilized_falls_back_to_per_type() {
        let peer = MemoryPeer::new();
        peer.set_conversations(vec![
            Conversation::direct("dm-1", "alice"),
            Conversation::group("grp-1", "team"),
        ]);
        peer.push_list_response(ListMethod::All, Err(PeerError::new("list failed")));
        let config = DiscoveryConfig::default();

        let started = tokio::time::Instant::now();
        let census = Strategy::VmStabilized.run(&peer, &config).await.unwrap();

        assert_eq!(census.total(), 2);
        assert_eq!(CallCounts::get(&peer.calls.list_direct), 1);
        assert_eq!(CallCounts::get(&peer.calls.list_group), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_sync_failure_fails_strategy() {
        let peer = MemoryPeer::new();
        peer.push_sync_failure(PeerError::new("already borrowed"));

        let err = Strategy::Standard
            .run(&peer, &DiscoveryConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.message, "already borrowed");
        assert_eq!(CallCounts::get(&peer.calls.list_all), 0);
    }

    #[test]
    fn test_cascade_order() {
        assert_eq!(Strategy::CASCADE[0], Strategy::Standard);
        assert_eq!(Strategy::CASCADE[4], Strategy::CrossIdentityMerge);
        assert_eq!(Strategy::CASCADE[7].to_string(), "vm_stabilized");
        assert_eq!(
            Strategy::VmStabilized.timeout(&DiscoveryConfig::default()),
            Duration::from_secs(30)
        );
    }
}
