//! Channel Session: authorize, persist, then publish.
//!
//! The store is the source of truth. A post only succeeds once the message
//! is durable; a failed publish degrades real-time visibility but never the
//! post itself.

use std::sync::Arc;

use parley_core::{
    Attachment, Channel, ChannelId, ChannelMember, ChatError, Message, UserId, Visibility,
};
use parley_store::MessageStore;
use tracing::{debug, error, info, warn};

use crate::bus::{BroadcastBus, Subscription};

/// Tunables for the session layer.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// History page size used when the caller passes a non-positive limit.
    pub default_page_size: u32,
    /// Upper bound on a single history page.
    pub max_page_size: u32,
    /// Maximum body length, in characters.
    pub max_body_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 200,
            max_body_chars: 4000,
        }
    }
}

/// Parameters for creating a channel.
#[derive(Clone, Debug)]
pub struct NewChannel {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    /// Display name recorded for the creator's membership.
    pub creator_name: String,
}

impl NewChannel {
    pub fn new(name: impl Into<String>, creator_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            visibility: Visibility::default(),
            creator_name: creator_name.into(),
        }
    }
}

#[derive(Clone)]
pub struct ChannelSession {
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn BroadcastBus>,
    config: SessionConfig,
}

impl ChannelSession {
    pub fn new(store: Arc<dyn MessageStore>, bus: Arc<dyn BroadcastBus>) -> Self {
        Self::with_config(store, bus, SessionConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn BroadcastBus>,
        config: SessionConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Post a message to a channel on behalf of `sender_id`.
    ///
    /// Membership is checked before anything about the post itself, so
    /// non-members always get `Unauthorized`. Frozen channels and bad bodies
    /// are `InvalidRequest`; a failed save is `Storage`. None of these
    /// publish. A publish failure is logged and the saved message is still
    /// returned.
    pub async fn post_message(
        &self,
        sender_id: &UserId,
        channel_id: &ChannelId,
        body: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message, ChatError> {
        let member = self
            .store
            .get_member(channel_id, sender_id)
            .await?
            .ok_or_else(|| {
                ChatError::Unauthorized(format!("{sender_id} is not a member of {channel_id}"))
            })?;

        if self.store.get_channel(channel_id).await?.frozen {
            return Err(ChatError::InvalidRequest(format!("{channel_id} is frozen")));
        }
        self.validate_body(body, attachment.is_some())?;

        let message = Message::new(channel_id.clone(), sender_id.clone(), body, attachment)
            .with_sender_name(member.display_name);

        if let Err(e) = self.store.save_message(&message).await {
            error!(
                channel_id = %channel_id,
                user_id = %sender_id,
                message_id = %message.id,
                error = %e,
                "failed to save message"
            );
            return Err(ChatError::Storage(e.to_string()));
        }

        if let Err(e) = self.bus.publish(channel_id, &message).await {
            warn!(
                channel_id = %channel_id,
                message_id = %message.id,
                error = %e,
                "publish failed, message is saved"
            );
        }

        debug!(channel_id = %channel_id, message_id = %message.id, "message posted");
        Ok(message)
    }

    /// A page of history, oldest first. Non-positive limits fall back to the
    /// default page size and negative offsets to zero.
    pub async fn get_history(
        &self,
        channel_id: &ChannelId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, ChatError> {
        let limit = if limit <= 0 {
            self.config.default_page_size
        } else {
            limit.min(i64::from(self.config.max_page_size)) as u32
        };
        let offset = u32::try_from(offset.max(0)).unwrap_or(u32::MAX);
        Ok(self.store.list_history(channel_id, limit, offset).await?)
    }

    /// History as seen by `reader`, who must be a member of the channel.
    pub async fn get_history_as(
        &self,
        reader: &UserId,
        channel_id: &ChannelId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, ChatError> {
        self.store.get_channel(channel_id).await?;
        if !self.store.is_member(channel_id, reader).await? {
            return Err(ChatError::Unauthorized(format!(
                "{reader} is not a member of {channel_id}"
            )));
        }
        self.get_history(channel_id, limit, offset).await
    }

    /// Raw bus subscription. The caller owns its lifetime.
    pub async fn subscribe_to_channel(&self, channel_id: &ChannelId) -> Result<Subscription, ChatError> {
        Ok(self.bus.subscribe(channel_id).await?)
    }

    /// Subscribe on behalf of a user, who must be a channel member.
    pub async fn join_channel(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Result<Subscription, ChatError> {
        if !self.store.is_member(channel_id, user_id).await? {
            return Err(ChatError::Unauthorized(format!(
                "{user_id} is not a member of {channel_id}"
            )));
        }
        self.subscribe_to_channel(channel_id).await
    }

    pub async fn create_channel(
        &self,
        creator_id: &UserId,
        params: NewChannel,
    ) -> Result<Channel, ChatError> {
        let name = params.name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidRequest("channel name is empty".into()));
        }

        let mut channel = Channel::new(name, creator_id.clone());
        channel.description = params.description;
        channel.visibility = params.visibility;

        self.store
            .create_channel(&channel, &params.creator_name)
            .await?;
        info!(channel_id = %channel.id, user_id = %creator_id, "channel created");
        Ok(channel)
    }

    pub async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, ChatError> {
        Ok(self.store.get_channel(channel_id).await?)
    }

    /// Only the creator may delete a channel. Its messages go with it.
    pub async fn delete_channel(
        &self,
        requester: &UserId,
        channel_id: &ChannelId,
    ) -> Result<(), ChatError> {
        let channel = self.store.get_channel(channel_id).await?;
        if &channel.creator_id != requester {
            return Err(ChatError::Unauthorized(format!(
                "only the creator can delete {channel_id}"
            )));
        }
        self.store.delete_channel(channel_id).await?;
        info!(channel_id = %channel_id, user_id = %requester, "channel deleted");
        Ok(())
    }

    /// Only the creator may freeze or unfreeze a channel.
    pub async fn set_frozen(
        &self,
        requester: &UserId,
        channel_id: &ChannelId,
        frozen: bool,
    ) -> Result<Channel, ChatError> {
        let mut channel = self.store.get_channel(channel_id).await?;
        if &channel.creator_id != requester {
            return Err(ChatError::Unauthorized(format!(
                "only the creator can freeze {channel_id}"
            )));
        }
        self.store.set_frozen(channel_id, frozen).await?;
        channel.frozen = frozen;
        info!(channel_id = %channel_id, user_id = %requester, frozen, "channel frozen state changed");
        Ok(channel)
    }

    /// Add `user_id` to the channel. The requester must already be a member.
    /// Adding an existing member returns the stored membership unchanged.
    pub async fn add_member(
        &self,
        requester: &UserId,
        channel_id: &ChannelId,
        user_id: &UserId,
        display_name: &str,
    ) -> Result<ChannelMember, ChatError> {
        // Surfaces NotFound before the membership check
        self.store.get_channel(channel_id).await?;
        if !self.store.is_member(channel_id, requester).await? {
            return Err(ChatError::Unauthorized(format!(
                "{requester} is not a member of {channel_id}"
            )));
        }

        let member = ChannelMember::new(channel_id.clone(), user_id.clone(), display_name);
        if self.store.add_member(&member).await? {
            info!(channel_id = %channel_id, user_id = %user_id, "member added");
            return Ok(member);
        }
        self.store
            .get_member(channel_id, user_id)
            .await?
            .ok_or_else(|| ChatError::Internal(format!("member {user_id} vanished from {channel_id}")))
    }

    /// Members may remove themselves; the creator may remove anyone but
    /// themselves. Messages the member wrote stay in history.
    pub async fn remove_member(
        &self,
        requester: &UserId,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<(), ChatError> {
        let channel = self.store.get_channel(channel_id).await?;
        if &channel.creator_id == user_id {
            return Err(ChatError::InvalidRequest(
                "the channel creator cannot be removed".into(),
            ));
        }
        if requester != user_id && requester != &channel.creator_id {
            return Err(ChatError::Unauthorized(format!(
                "{requester} cannot remove members from {channel_id}"
            )));
        }

        match self.store.remove_member(channel_id, user_id).await {
            Ok(true) => {
                info!(channel_id = %channel_id, user_id = %user_id, "member removed");
                Ok(())
            }
            Ok(false) => Err(ChatError::NotFound(format!(
                "{user_id} is not a member of {channel_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_members(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMember>, ChatError> {
        self.store.get_channel(channel_id).await?;
        Ok(self.store.list_members(channel_id).await?)
    }

    pub async fn list_channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, ChatError> {
        Ok(self.store.list_channels_for_user(user_id).await?)
    }

    fn validate_body(&self, body: &str, has_attachment: bool) -> Result<(), ChatError> {
        if body.trim().is_empty() && !has_attachment {
            return Err(ChatError::InvalidRequest(
                "message needs a body or an attachment".into(),
            ));
        }
        let chars = body.chars().count();
        if chars > self.config.max_body_chars {
            return Err(ChatError::InvalidRequest(format!(
                "message body is {chars} characters, limit is {}",
                self.config.max_body_chars
            )));
        }
        Ok(())
    }
}
