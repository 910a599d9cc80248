//! Message, account and profile records exchanged between the engine and
//! the persistence layer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Stable numeric device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Message identifier assigned by the local record store
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Placeholder carried by a message that was never stored
    pub const UNASSIGNED: Self = Self(0);

    /// Whether the store has assigned this id
    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery progress of a message. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Handed to the transport by the author
    Sent,
    /// Stored by the recipient
    Received,
    /// Displayed to the recipient
    Read,
}

impl DeliveryState {
    /// The state after applying `next`, never going backwards
    #[must_use]
    pub fn advance(self, next: Self) -> Self {
        self.max(next)
    }
}

/// Body of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    /// Plain text
    Text {
        /// Message text
        text: String,
    },
    /// File stored in the media store
    File {
        /// Media store reference
        file_ref: String,
    },
    /// Voice note stored in the media store
    Audio {
        /// Media store reference
        file_ref: String,
    },
}

impl MessageContent {
    /// Short name used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::File { .. } => "file",
            Self::Audio { .. } => "audio",
        }
    }
}

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned id; `UNASSIGNED` before the first insert
    pub id: MessageId,
    /// Author
    pub sender_id: PeerId,
    /// Recipient
    pub receiver_id: PeerId,
    /// Author's creation time in milliseconds
    pub timestamp: u64,
    /// Delivery progress
    pub state: DeliveryState,
    /// Body
    pub content: MessageContent,
}

impl Message {
    /// A message not yet stored
    pub fn new(
        sender_id: PeerId,
        receiver_id: PeerId,
        timestamp: u64,
        state: DeliveryState,
        content: MessageContent,
    ) -> Self {
        Self {
            id: MessageId::UNASSIGNED,
            sender_id,
            receiver_id,
            timestamp,
            state,
            content,
        }
    }

    /// The other participant from `own_id`'s point of view
    pub fn counterpart(&self, own_id: PeerId) -> PeerId {
        if self.sender_id == own_id {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// Durable record of a known account, used to detect stale profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account owner
    pub peer_id: PeerId,
    /// Version of the owner's profile, as a timestamp
    pub profile_updated_at: u64,
}

/// Public profile of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile owner
    pub peer_id: PeerId,
    /// Profile version
    pub updated_at: u64,
    /// Display name
    pub username: String,
    /// Media store reference of the avatar
    pub image_ref: Option<String>,
}

impl Profile {
    /// The account record advertising this profile version
    pub fn account(&self) -> AccountRecord {
        AccountRecord {
            peer_id: self.peer_id,
            profile_updated_at: self.updated_at,
        }
    }
}

/// Chat list entry derived from stored messages and profiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPreview {
    /// Conversation partner
    pub contact: PeerId,
    /// Cached profile of the partner, if any
    pub profile: Option<Profile>,
    /// Newest message of the conversation
    pub last_message: Option<Message>,
    /// Messages from the partner still in `Received`
    pub unread_count: usize,
}

impl ChatPreview {
    fn rank_key(&self) -> (Option<u64>, PeerId, usize) {
        (
            self.last_message.as_ref().map(|m| m.timestamp),
            self.contact,
            self.unread_count,
        )
    }
}

impl PartialOrd for ChatPreview {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChatPreview {
    /// Ascending by last-message time, then contact, then unread count.
    /// `None` sorts below any timestamp.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_key().cmp(&other.rank_key())
    }
}

/// Sort previews for display: newest conversation first, silent contacts last
pub fn rank_chat_previews(previews: &mut [ChatPreview]) {
    previews.sort_by(|a, b| b.cmp(a));
}
