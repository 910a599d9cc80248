//! In-memory persistence and media stores.

use crate::messaging::{
    rank_chat_previews, AccountRecord, ChatPreview, DeliveryState, Message, MessageId, PeerId,
    Profile,
};
use crate::storage::{sanitize_file_name, MediaStore, Persistence};
use crate::utils::{Result, StorageError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// One applied state change, recorded in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    /// Message that changed
    pub id: MessageId,
    /// State before the update
    pub from: DeliveryState,
    /// State after the update
    pub to: DeliveryState,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    messages: BTreeMap<MessageId, Message>,
    accounts: HashMap<PeerId, AccountRecord>,
    profiles: HashMap<PeerId, Profile>,
    updates: Vec<StateUpdate>,
}

/// Record store kept in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following message insert fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }

    /// Every message exchanged with `peer`, oldest first
    pub fn conversation(&self, peer: PeerId) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.sender_id == peer || m.receiver_id == peer)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.timestamp, m.id));
        messages
    }

    /// Every applied state change, oldest first
    pub fn state_updates(&self) -> Vec<StateUpdate> {
        self.tables.read().updates.clone()
    }

    /// Chat list for `own_id`, ranked newest conversation first. Contacts
    /// with a cached profile but no messages are listed last.
    pub fn chat_previews(&self, own_id: PeerId) -> Vec<ChatPreview> {
        let tables = self.tables.read();

        let mut contacts: BTreeSet<PeerId> = tables
            .profiles
            .keys()
            .copied()
            .filter(|peer| *peer != own_id)
            .collect();
        for message in tables.messages.values() {
            contacts.insert(message.counterpart(own_id));
        }

        let mut previews: Vec<ChatPreview> = contacts
            .into_iter()
            .map(|contact| {
                let conversation = tables
                    .messages
                    .values()
                    .filter(|m| m.counterpart(own_id) == contact);

                let mut last_message: Option<&Message> = None;
                let mut unread_count = 0;
                for message in conversation {
                    if message.sender_id == contact && message.state == DeliveryState::Received {
                        unread_count += 1;
                    }
                    if last_message.map_or(true, |last| message.timestamp >= last.timestamp) {
                        last_message = Some(message);
                    }
                }

                ChatPreview {
                    contact,
                    profile: tables.profiles.get(&contact).cloned(),
                    last_message: last_message.cloned(),
                    unread_count,
                }
            })
            .collect();

        rank_chat_previews(&mut previews);
        previews
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn insert_message(&self, mut message: Message) -> Result<MessageId> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                reason: "message store is read-only".to_string(),
            }
            .into());
        }

        let mut tables = self.tables.write();
        tables.next_id += 1;
        let id = MessageId(tables.next_id);
        message.id = id;
        tables.messages.insert(id, message);
        Ok(id)
    }

    async fn update_message_state(&self, id: MessageId, state: DeliveryState) -> Result<()> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound {
                key: format!("message {id}"),
            })?;

        let from = message.state;
        let to = from.advance(state);
        if to != from {
            message.state = to;
            tables.updates.push(StateUpdate { id, from, to });
        }
        Ok(())
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        self.tables.write().messages.remove(&id);
        Ok(())
    }

    async fn get_message_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.tables.read().messages.get(&id).cloned())
    }

    async fn get_messages_addressed_to(&self, receiver_id: PeerId) -> Result<Vec<Message>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.receiver_id == receiver_id)
            .cloned()
            .collect())
    }

    async fn get_account(&self, peer_id: PeerId) -> Result<Option<AccountRecord>> {
        Ok(self.tables.read().accounts.get(&peer_id).copied())
    }

    async fn upsert_account(&self, account: AccountRecord) -> Result<()> {
        self.tables.write().accounts.insert(account.peer_id, account);
        Ok(())
    }

    async fn get_profile(&self, peer_id: PeerId) -> Result<Option<Profile>> {
        Ok(self.tables.read().profiles.get(&peer_id).cloned())
    }

    async fn upsert_profile(&self, profile: Profile) -> Result<()> {
        self.tables.write().profiles.insert(profile.peer_id, profile);
        Ok(())
    }
}

/// Media store kept in memory
#[derive(Debug, Default)]
pub struct MemoryMediaStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryMediaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following save fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored files
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Whether no file is stored
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let file_name = sanitize_file_name(name).ok_or_else(|| StorageError::Media {
            name: name.to_string(),
            reason: "empty file name".to_string(),
        })?;

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Media {
                name: file_name,
                reason: "media store is read-only".to_string(),
            }
            .into());
        }

        self.files.write().insert(file_name.clone(), bytes.to_vec());
        Ok(file_name)
    }

    async fn load(&self, file_ref: &str) -> Result<Vec<u8>> {
        self.files.read().get(file_ref).cloned().ok_or_else(|| {
            StorageError::NotFound {
                key: file_ref.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageContent;

    const ME: PeerId = PeerId(1);
    const BOB: PeerId = PeerId(2);
    const CAROL: PeerId = PeerId(3);

    fn text(from: PeerId, to: PeerId, ts: u64, state: DeliveryState) -> Message {
        Message::new(
            from,
            to,
            ts,
            state,
            MessageContent::Text {
                text: format!("at {ts}"),
            },
        )
    }

    #[tokio::test]
    async fn test_ids_are_assigned_in_order() {
        let store = MemoryStore::new();
        let first = store.insert_message(text(ME, BOB, 1, DeliveryState::Sent)).await.unwrap();
        let second = store.insert_message(text(ME, BOB, 2, DeliveryState::Sent)).await.unwrap();
        assert!(first.is_assigned());
        assert!(second > first);
        assert_eq!(store.get_message_by_id(second).await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn test_state_never_regresses() {
        let store = MemoryStore::new();
        let id = store.insert_message(text(ME, BOB, 1, DeliveryState::Sent)).await.unwrap();

        store.update_message_state(id, DeliveryState::Read).await.unwrap();
        store.update_message_state(id, DeliveryState::Received).await.unwrap();

        let stored = store.get_message_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Read);
        assert_eq!(
            store.state_updates(),
            vec![StateUpdate {
                id,
                from: DeliveryState::Sent,
                to: DeliveryState::Read,
            }]
        );
    }

    #[tokio::test]
    async fn test_update_unknown_message_fails() {
        let store = MemoryStore::new();
        assert!(store
            .update_message_state(MessageId(99), DeliveryState::Read)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_keeps_ids_unique() {
        let store = MemoryStore::new();
        let first = store.insert_message(text(ME, BOB, 1, DeliveryState::Sent)).await.unwrap();
        store.delete_message(first).await.unwrap();
        assert!(store.get_message_by_id(first).await.unwrap().is_none());

        let second = store.insert_message(text(ME, BOB, 2, DeliveryState::Sent)).await.unwrap();
        assert!(second > first);
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.insert_message(text(ME, BOB, 1, DeliveryState::Sent)).await.is_err());
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_addressed_to_and_conversation() {
        let store = MemoryStore::new();
        store.insert_message(text(ME, BOB, 5, DeliveryState::Sent)).await.unwrap();
        store.insert_message(text(BOB, ME, 3, DeliveryState::Received)).await.unwrap();
        store.insert_message(text(ME, CAROL, 4, DeliveryState::Sent)).await.unwrap();

        let to_bob = store.get_messages_addressed_to(BOB).await.unwrap();
        assert_eq!(to_bob.len(), 1);

        let timestamps: Vec<u64> = store.conversation(BOB).iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_chat_previews() {
        let store = MemoryStore::new();
        store.insert_message(text(BOB, ME, 10, DeliveryState::Received)).await.unwrap();
        store.insert_message(text(BOB, ME, 11, DeliveryState::Received)).await.unwrap();
        store.insert_message(text(ME, CAROL, 20, DeliveryState::Sent)).await.unwrap();
        store
            .upsert_profile(Profile {
                peer_id: PeerId(4),
                updated_at: 1,
                username: "dave".to_string(),
                image_ref: None,
            })
            .await
            .unwrap();

        let previews = store.chat_previews(ME);
        let order: Vec<PeerId> = previews.iter().map(|p| p.contact).collect();
        assert_eq!(order, vec![CAROL, BOB, PeerId(4)]);
        assert_eq!(previews[1].unread_count, 2);
        assert_eq!(previews[1].last_message.as_ref().map(|m| m.timestamp), Some(11));
        assert!(previews[2].last_message.is_none());
        assert!(previews[2].profile.is_some());
    }

    #[tokio::test]
    async fn test_accounts_and_profiles_upsert() {
        let store = MemoryStore::new();
        assert!(store.get_account(BOB).await.unwrap().is_none());

        for version in [1, 2] {
            store
                .upsert_account(AccountRecord {
                    peer_id: BOB,
                    profile_updated_at: version,
                })
                .await
                .unwrap();
        }
        assert_eq!(
            store.get_account(BOB).await.unwrap().map(|a| a.profile_updated_at),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_media_store() {
        let media = MemoryMediaStore::new();
        let file_ref = media.save("../secret/photo.jpg", b"jpeg").await.unwrap();
        assert_eq!(file_ref, "photo.jpg");
        assert_eq!(media.load(&file_ref).await.unwrap(), b"jpeg");
        assert!(media.load("missing").await.is_err());

        media.set_fail_writes(true);
        assert!(media.save("other.jpg", b"x").await.is_err());
        assert_eq!(media.len(), 1);
    }
}
