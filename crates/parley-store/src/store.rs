//! The Message Store seam.
//!
//! `MessageStore` is what the channel session talks to. `SqliteStore` is the
//! production implementation; tests wrap or replace it to inject failures.

use async_trait::async_trait;

use parley_core::{Channel, ChannelId, ChannelMember, Message, UserId};

use crate::channels::ChannelRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;

/// Durable repository for channels, memberships and messages.
///
/// Implementations must be safe to call concurrently. No retries happen at
/// this layer; failures go straight back to the caller.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and its attachment atomically.
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages ascending by creation time. Empty (not an error) when the
    /// channel has none.
    async fn list_history(
        &self,
        channel_id: &ChannelId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError>;

    async fn is_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<bool, StoreError>;

    async fn get_member(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<Option<ChannelMember>, StoreError>;

    /// Create a channel with its creator as the first (owner) member.
    async fn create_channel(&self, channel: &Channel, creator_name: &str) -> Result<(), StoreError>;

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, StoreError>;

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<(), StoreError>;

    async fn set_frozen(&self, channel_id: &ChannelId, frozen: bool) -> Result<(), StoreError>;

    /// Returns `false` when the member already existed.
    async fn add_member(&self, member: &ChannelMember) -> Result<bool, StoreError>;

    /// Returns `false` when there was nothing to remove.
    async fn remove_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<bool, StoreError>;

    async fn list_members(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMember>, StoreError>;

    async fn list_channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, StoreError>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    channels: ChannelRepo,
    messages: MessageRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            channels: ChannelRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn messages(&self) -> &MessageRepo {
        &self.messages
    }

    pub fn channels(&self) -> &ChannelRepo {
        &self.channels
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages.save(message)
    }

    async fn list_history(
        &self,
        channel_id: &ChannelId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.messages.list_history(channel_id, limit, offset)
    }

    async fn is_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<bool, StoreError> {
        self.channels.is_member(channel_id, user_id)
    }

    async fn get_member(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<Option<ChannelMember>, StoreError> {
        self.channels.get_member(channel_id, user_id)
    }

    async fn create_channel(&self, channel: &Channel, creator_name: &str) -> Result<(), StoreError> {
        self.channels.create(channel, creator_name)
    }

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, StoreError> {
        self.channels.get(channel_id)
    }

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<(), StoreError> {
        self.channels.delete(channel_id)
    }

    async fn set_frozen(&self, channel_id: &ChannelId, frozen: bool) -> Result<(), StoreError> {
        self.channels.set_frozen(channel_id, frozen)
    }

    async fn add_member(&self, member: &ChannelMember) -> Result<bool, StoreError> {
        self.channels.add_member(member)
    }

    async fn remove_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<bool, StoreError> {
        self.channels.remove_member(channel_id, user_id)
    }

    async fn list_members(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMember>, StoreError> {
        self.channels.list_members(channel_id)
    }

    async fn list_channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, StoreError> {
        self.channels.list_for_user(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn usable_as_trait_object() {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let channel = Channel::new("general", UserId::from_raw("U1"));
        store.create_channel(&channel, "Ada").await.unwrap();

        assert!(store.is_member(&channel.id, &UserId::from_raw("U1")).await.unwrap());
        assert!(!store.is_member(&channel.id, &UserId::from_raw("U2")).await.unwrap());

        let msg = Message::new(channel.id.clone(), UserId::from_raw("U1"), "hello", None);
        store.save_message(&msg).await.unwrap();
        let history = store.list_history(&channel.id, 50, 0).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_saves_across_channels() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut channels = Vec::new();
        for i in 0..4 {
            let c = Channel::new(format!("c{i}"), UserId::from_raw("U1"));
            store.create_channel(&c, "Ada").await.unwrap();
            channels.push(c.id);
        }

        let mut handles = Vec::new();
        for channel_id in channels.clone() {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for n in 0..10 {
                    let msg = Message::new(channel_id.clone(), UserId::from_raw("U1"), format!("{n}"), None);
                    store.save_message(&msg).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for channel_id in channels {
            assert_eq!(store.messages().count(&channel_id).unwrap(), 10);
        }
    }
}
