//! Persistence and media storage seams.
//!
//! The engine never touches a database directly. Messages, accounts and
//! profiles go through [`Persistence`]; file and voice bytes go through
//! [`MediaStore`], which hands back a reference stored in the message.

pub mod disk;
pub mod memory;

pub use disk::DiskMediaStore;
pub use memory::{MemoryMediaStore, MemoryStore, StateUpdate};

use crate::messaging::{AccountRecord, DeliveryState, Message, MessageId, PeerId, Profile};
use crate::utils::Result;
use async_trait::async_trait;

/// Durable store for messages, accounts and profiles
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a new message and return its assigned id
    async fn insert_message(&self, message: Message) -> Result<MessageId>;

    /// Move a stored message to `state`. Stores never move a message backwards.
    async fn update_message_state(&self, id: MessageId, state: DeliveryState) -> Result<()>;

    /// Remove a message that never left the device
    async fn delete_message(&self, id: MessageId) -> Result<()>;

    /// Look up a message by id
    async fn get_message_by_id(&self, id: MessageId) -> Result<Option<Message>>;

    /// Every stored message whose receiver is `receiver_id`
    async fn get_messages_addressed_to(&self, receiver_id: PeerId) -> Result<Vec<Message>>;

    /// Account record of `peer_id`, if known
    async fn get_account(&self, peer_id: PeerId) -> Result<Option<AccountRecord>>;

    /// Insert or replace an account record
    async fn upsert_account(&self, account: AccountRecord) -> Result<()>;

    /// Cached profile of `peer_id`, if any
    async fn get_profile(&self, peer_id: PeerId) -> Result<Option<Profile>>;

    /// Insert or replace a profile
    async fn upsert_profile(&self, profile: Profile) -> Result<()>;
}

/// Byte storage for attachments, voice notes and avatars
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Save `bytes` under `name` and return the reference to load them by
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<String>;

    /// Load bytes previously saved
    async fn load(&self, file_ref: &str) -> Result<Vec<u8>>;
}

/// Reduce a file name to its final path component.
///
/// Returns `None` when nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.jpg").as_deref(), Some("photo.jpg"));
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_file_name("C:\\Users\\me\\note.ogg").as_deref(),
            Some("note.ogg")
        );
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name(""), None);
    }
}
