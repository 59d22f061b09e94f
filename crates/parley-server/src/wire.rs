//! External JSON frame format spoken over the WebSocket.
//!
//! Client frames: `{type: "JOIN"|"LEAVE"|"MESSAGE", channelId, content?,
//! userId?, attachment?}`. A frame without `userId` inherits the identity
//! given at handshake. Server frames carry the same `type` tag with
//! camelCase fields.

use parley_core::{
    Attachment, AttachmentId, ChannelId, ChatError, InboundFrame, OutboundFrame, UserId,
};
use serde::{Deserialize, Serialize};

/// Raw client frame, before routing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub attachment: Option<ClientAttachment>,
}

/// Attachment metadata as a client sends it, already resolved by the file
/// service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAttachment {
    pub file_id: String,
    pub url: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

impl From<ClientAttachment> for Attachment {
    fn from(a: ClientAttachment) -> Self {
        Attachment {
            id: AttachmentId::new(),
            file_id: a.file_id,
            url: a.url,
            mime_type: a.mime_type,
            size: a.size,
        }
    }
}

/// Parse one text frame into the internal frame type.
///
/// Malformed JSON and missing fields are `Protocol` errors. Well-formed
/// frames of an unrecognized type become `InboundFrame::Unknown`.
pub fn decode_client_frame(text: &str, identity: &UserId) -> Result<InboundFrame, ChatError> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|e| ChatError::Protocol(format!("malformed frame: {e}")))?;

    let kind = frame.kind.to_ascii_uppercase();
    if !matches!(kind.as_str(), "JOIN" | "LEAVE" | "MESSAGE") {
        return Ok(InboundFrame::Unknown { kind: frame.kind });
    }

    let channel_id = match frame.channel_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => ChannelId::from_raw(id),
        _ => return Err(ChatError::Protocol(format!("{kind} frame needs a channelId"))),
    };
    let user_id = match frame.user_id {
        Some(id) if !id.is_empty() => UserId::from_raw(id),
        _ => identity.clone(),
    };

    Ok(match kind.as_str() {
        "JOIN" => InboundFrame::Join { channel_id, user_id },
        "LEAVE" => InboundFrame::Leave { channel_id, user_id },
        _ => InboundFrame::Message {
            channel_id,
            user_id,
            body: frame.content.unwrap_or_default(),
            attachment: frame.attachment.map(Attachment::from),
        },
    })
}

/// Server-to-client frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Delivered {
        channel_id: String,
        message_id: String,
        sender_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
        server_timestamp_millis: i64,
    },
    #[serde(rename_all = "camelCase")]
    Posted {
        channel_id: String,
        message_id: String,
        server_timestamp_millis: i64,
    },
    #[serde(rename_all = "camelCase")]
    Joined { channel_id: String },
    #[serde(rename_all = "camelCase")]
    Left { channel_id: String },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
    },
}

impl From<OutboundFrame> for ServerFrame {
    fn from(frame: OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Delivered {
                channel_id,
                message_id,
                sender_id,
                sender_name,
                body,
                attachment,
                server_timestamp_millis,
            } => Self::Delivered {
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
                sender_id: sender_id.to_string(),
                sender_name,
                content: body,
                attachment,
                server_timestamp_millis,
            },
            OutboundFrame::Posted {
                channel_id,
                message_id,
                server_timestamp_millis,
            } => Self::Posted {
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
                server_timestamp_millis,
            },
            OutboundFrame::Joined { channel_id } => Self::Joined {
                channel_id: channel_id.to_string(),
            },
            OutboundFrame::Left { channel_id } => Self::Left {
                channel_id: channel_id.to_string(),
            },
            OutboundFrame::Error {
                code,
                message,
                channel_id,
            } => Self::Error {
                code,
                message,
                channel_id: channel_id.map(|c| c.to_string()),
            },
        }
    }
}

pub fn encode_server_frame(frame: OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ServerFrame::from(frame))
}
