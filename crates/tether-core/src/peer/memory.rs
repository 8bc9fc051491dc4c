//! In-memory peer client
//!
//! A scriptable [`PeerClient`] used by tests and the `simulate` command.
//! Failures, listing responses and inbound messages are queued up front or
//! pushed while the engine is running.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{Conversation, ConversationKind, MessageStream, PeerClient, RawMessage};
use crate::error::PeerError;

type ListScript = VecDeque<Result<Vec<Conversation>, PeerError>>;
type FeedSender = mpsc::UnboundedSender<Result<RawMessage, PeerError>>;

/// Listing primitive, used to target scripted responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    All,
    Direct,
    Group,
}

#[derive(Default)]
struct Scripts {
    open_failures: VecDeque<PeerError>,
    sync_failures: VecDeque<PeerError>,
    list_all: ListScript,
    list_direct: ListScript,
    list_group: ListScript,
    conversations: Vec<Conversation>,
    reachable: HashSet<String>,
    resynced: Vec<String>,
    sent: Vec<(String, String)>,
    feed: Option<FeedSender>,
    open_delay: Option<Duration>,
}

/// Call counters, readable while the peer is in use
#[derive(Debug, Default)]
pub struct CallCounts {
    pub sync: AtomicUsize,
    pub list_all: AtomicUsize,
    pub list_direct: AtomicUsize,
    pub list_group: AtomicUsize,
    pub open: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Scriptable in-memory peer client
#[derive(Default)]
pub struct MemoryPeer {
    scripts: Mutex<Scripts>,
    pub calls: CallCounts,
}

impl MemoryPeer {
    pub fn new() -> Self {
        Self::default()
    }

    fn scripts(&self) -> MutexGuard<'_, Scripts> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next stream-open call fail
    pub fn push_open_failure(&self, error: PeerError) {
        self.scripts().open_failures.push_back(error);
    }

    /// Make the next sync call fail
    pub fn push_sync_failure(&self, error: PeerError) {
        self.scripts().sync_failures.push_back(error);
    }

    /// Delay every stream-open call
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.scripts().open_delay = delay;
    }

    /// Queue a response for one listing method
    ///
    /// Once a method's queue is empty it answers from the conversation set.
    pub fn push_list_response(
        &self,
        method: ListMethod,
        response: Result<Vec<Conversation>, PeerError>,
    ) {
        let mut scripts = self.scripts();
        match method {
            ListMethod::All => scripts.list_all.push_back(response),
            ListMethod::Direct => scripts.list_direct.push_back(response),
            ListMethod::Group => scripts.list_group.push_back(response),
        }
    }

    /// Replace the conversation set answered by unscripted listing calls
    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.scripts().conversations = conversations;
    }

    /// Mark an identity as registered on the network
    pub fn add_reachable(&self, identifier: impl Into<String>) {
        self.scripts().reachable.insert(identifier.into());
    }

    /// Push a message into the open stream; false if no stream is open
    pub fn deliver(&self, message: RawMessage) -> bool {
        self.feed_send(Ok(message))
    }

    /// Make the open stream yield an error
    pub fn fail_stream(&self, error: PeerError) -> bool {
        self.feed_send(Err(error))
    }

    /// End the open stream
    pub fn close_stream(&self) {
        self.scripts().feed = None;
    }

    /// Whether a stream is open and its consumer still attached
    pub fn has_open_stream(&self) -> bool {
        self.scripts()
            .feed
            .as_ref()
            .is_some_and(|feed| !feed.is_closed())
    }

    /// Conversations for which a targeted resync was requested
    pub fn resynced_conversations(&self) -> Vec<String> {
        self.scripts().resynced.clone()
    }

    /// Messages sent through this peer, as (conversation id, content)
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.scripts().sent.clone()
    }

    fn feed_send(&self, item: Result<RawMessage, PeerError>) -> bool {
        match self.scripts().feed.as_ref() {
            Some(feed) => feed.send(item).is_ok(),
            None => false,
        }
    }

    fn answer(&self, method: ListMethod) -> Result<Vec<Conversation>, PeerError> {
        let mut scripts = self.scripts();
        let scripted = match method {
            ListMethod::All => scripts.list_all.pop_front(),
            ListMethod::Direct => scripts.list_direct.pop_front(),
            ListMethod::Group => scripts.list_group.pop_front(),
        };
        if let Some(response) = scripted {
            return response;
        }

        let wanted = match method {
            ListMethod::All => None,
            ListMethod::Direct => Some(ConversationKind::Direct),
            ListMethod::Group => Some(ConversationKind::Group),
        };
        Ok(scripts
            .conversations
            .iter()
            .filter(|c| wanted.map_or(true, |kind| c.kind == kind))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PeerClient for MemoryPeer {
    async fn sync(&self) -> Result<(), PeerError> {
        self.calls.sync.fetch_add(1, Ordering::SeqCst);
        match self.scripts().sync_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn sync_conversation(&self, conversation_id: &str) -> Result<(), PeerError> {
        self.scripts().resynced.push(conversation_id.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Conversation>, PeerError> {
        self.calls.list_all.fetch_add(1, Ordering::SeqCst);
        self.answer(ListMethod::All)
    }

    async fn list_direct(&self) -> Result<Vec<Conversation>, PeerError> {
        self.calls.list_direct.fetch_add(1, Ordering::SeqCst);
        self.answer(ListMethod::Direct)
    }

    async fn list_group(&self) -> Result<Vec<Conversation>, PeerError> {
        self.calls.list_group.fetch_add(1, Ordering::SeqCst);
        self.answer(ListMethod::Group)
    }

    async fn open_message_stream(&self) -> Result<MessageStream, PeerError> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);

        let delay = self.scripts().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.scripts().open_failures.pop_front() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts().feed = Some(tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn send(&self, conversation_id: &str, content: &str) -> Result<String, PeerError> {
        self.scripts()
            .sent
            .push((conversation_id.to_string(), content.to_string()));
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn can_reach(&self, identifier: &str) -> Result<bool, PeerError> {
        Ok(self.scripts().reachable.contains(identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_list_then_fallback() {
        let peer = MemoryPeer::new();
        peer.set_conversations(vec![
            Conversation::direct("dm-1", "alice"),
            Conversation::group("grp-1", "friends"),
        ]);
        peer.push_list_response(ListMethod::All, Ok(Vec::new()));

        assert!(peer.list().await.unwrap().is_empty());
        assert_eq!(peer.list().await.unwrap().len(), 2);
        assert_eq!(peer.list_direct().await.unwrap()[0].id, "dm-1");
        assert_eq!(peer.list_group().await.unwrap()[0].id, "grp-1");
        assert_eq!(CallCounts::get(&peer.calls.list_all), 2);
    }

    #[tokio::test]
    async fn test_stream_delivery_and_failure() {
        let peer = MemoryPeer::new();
        peer.push_open_failure(PeerError::new("already borrowed"));

        assert!(peer.open_message_stream().await.is_err());
        let mut stream = peer.open_message_stream().await.unwrap();

        assert!(peer.deliver(RawMessage::text("m1", "c1", "bob", "hi")));
        assert!(peer.fail_stream(PeerError::new("boom")));

        assert_eq!(stream.next().await.unwrap().unwrap().id, "m1");
        assert!(stream.next().await.unwrap().is_err());

        peer.close_stream();
        assert!(stream.next().await.is_none());
        assert!(!peer.deliver(RawMessage::text("m2", "c1", "bob", "late")));
    }

    #[tokio::test]
    async fn test_send_and_reach() {
        let peer = MemoryPeer::new();
        peer.add_reachable("alice");

        let id = peer.send("dm-1", "hello").await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(peer.sent_messages(), vec![("dm-1".to_string(), "hello".to_string())]);
        assert!(peer.can_reach("alice").await.unwrap());
        assert!(!peer.can_reach("mallory").await.unwrap());
    }
}
