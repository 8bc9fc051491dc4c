//! Peer client abstraction
//!
//! The peer client is the messaging runtime this engine wraps. It owns the
//! protocol, cryptography and persistence; the engine only drives the
//! primitive operations below and treats every failure as untrusted input
//! to be classified.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::PeerError;

/// Inbound message feed returned by [`PeerClient::open_message_stream`]
pub type MessageStream = BoxStream<'static, Result<RawMessage, PeerError>>;

/// Conversation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Peer-network consent classification of a contact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Allowed,
    Denied,
    #[default]
    Unknown,
}

/// A conversation as listed by the peer client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// Other party for direct conversations
    pub peer_identity: Option<String>,
    /// Display name for group conversations
    pub name: Option<String>,
    pub consent: ConsentState,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a direct conversation with another identity
    pub fn direct(id: impl Into<String>, peer_identity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Direct,
            peer_identity: Some(peer_identity.into()),
            name: None,
            consent: ConsentState::Unknown,
            created_at: Utc::now(),
        }
    }

    /// Create a named group conversation
    pub fn group(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Group,
            peer_identity: None,
            name: Some(name.into()),
            consent: ConsentState::Unknown,
            created_at: Utc::now(),
        }
    }

    pub fn with_consent(mut self, consent: ConsentState) -> Self {
        self.consent = consent;
        self
    }
}

/// A message exactly as the peer client delivered it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sent_at: DateTime<Utc>,
    /// Content type identifier (e.g. "text", "group_updated")
    pub content_type: String,
    pub content: String,
}

impl RawMessage {
    /// Create a plain text message
    pub fn text(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            sent_at: Utc::now(),
            content_type: "text".to_string(),
            content: content.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Operations the engine needs from the peer client
///
/// Implementations must be thread-safe (Send + Sync). None of these calls
/// are assumed to be re-entrant safe; the engine serializes the risky ones.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Eventually-consistent refresh of local state from the network
    async fn sync(&self) -> Result<(), PeerError>;

    /// Resync a single conversation
    ///
    /// Defaults to a full sync for clients without a targeted primitive.
    async fn sync_conversation(&self, conversation_id: &str) -> Result<(), PeerError> {
        let _ = conversation_id;
        self.sync().await
    }

    /// List all conversations
    async fn list(&self) -> Result<Vec<Conversation>, PeerError>;

    /// List direct conversations only
    async fn list_direct(&self) -> Result<Vec<Conversation>, PeerError>;

    /// List group conversations only
    async fn list_group(&self) -> Result<Vec<Conversation>, PeerError>;

    /// Open a live feed of inbound messages across all conversations
    async fn open_message_stream(&self) -> Result<MessageStream, PeerError>;

    /// Send a text message, returning the new message id
    async fn send(&self, conversation_id: &str, content: &str) -> Result<String, PeerError>;

    /// Whether an identity is registered on the network
    async fn can_reach(&self, identifier: &str) -> Result<bool, PeerError>;
}
