use crate::errors::ChatError;
use crate::ids::{ChannelId, MessageId, UserId};
use crate::models::{Attachment, Message};

/// Frames a client sends over its duplex stream.
///
/// `Unknown` carries frame kinds the bridge could decode but not route, so
/// the multiplexer can answer them with an error frame instead of closing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Join {
        channel_id: ChannelId,
        user_id: UserId,
    },
    Leave {
        channel_id: ChannelId,
        user_id: UserId,
    },
    Message {
        channel_id: ChannelId,
        user_id: UserId,
        body: String,
        attachment: Option<Attachment>,
    },
    Unknown {
        kind: String,
    },
}

impl InboundFrame {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::Join { channel_id, .. }
            | Self::Leave { channel_id, .. }
            | Self::Message { channel_id, .. } => Some(channel_id),
            Self::Unknown { .. } => None,
        }
    }
}

/// Frames the server writes to a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A message fanned out from a channel subscription.
    Delivered {
        channel_id: ChannelId,
        message_id: MessageId,
        sender_id: UserId,
        sender_name: Option<String>,
        body: String,
        attachment: Option<Attachment>,
        server_timestamp_millis: i64,
    },
    /// The sender's own post was durably saved.
    Posted {
        channel_id: ChannelId,
        message_id: MessageId,
        server_timestamp_millis: i64,
    },
    Joined {
        channel_id: ChannelId,
    },
    Left {
        channel_id: ChannelId,
    },
    Error {
        code: String,
        message: String,
        channel_id: Option<ChannelId>,
    },
}

impl OutboundFrame {
    pub fn delivered(message: &Message) -> Self {
        Self::Delivered {
            channel_id: message.channel_id.clone(),
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            body: message.body.clone(),
            attachment: message.attachment.clone(),
            server_timestamp_millis: message.created_at_millis(),
        }
    }

    pub fn posted(message: &Message) -> Self {
        Self::Posted {
            channel_id: message.channel_id.clone(),
            message_id: message.id.clone(),
            server_timestamp_millis: message.created_at_millis(),
        }
    }

    pub fn error(err: &ChatError, channel_id: Option<ChannelId>) -> Self {
        Self::Error {
            code: err.error_kind().to_string(),
            message: err.to_string(),
            channel_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
