use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AttachmentId, ChannelId, MessageId, UserId};

/// Current time truncated to millisecond precision, which is what the store
/// persists. Keeps freshly built values equal to their read-back copies.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    #[default]
    Member,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Member => write!(f, "member"),
        }
    }
}

impl std::str::FromStr for MemberRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "member" => Ok(Self::Member),
            other => Err(format!("unknown member role: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub creator_id: UserId,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub frozen: bool,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(name: impl Into<String>, creator_id: UserId) -> Self {
        Self {
            id: ChannelId::new(),
            name: name.into(),
            creator_id,
            description: None,
            visibility: Visibility::default(),
            frozen: false,
            created_at: now_millis(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

impl ChannelMember {
    pub fn new(channel_id: ChannelId, user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            channel_id,
            user_id,
            display_name: display_name.into(),
            role: MemberRole::Member,
            joined_at: now_millis(),
        }
    }

    pub fn owner(channel_id: ChannelId, user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            role: MemberRole::Owner,
            ..Self::new(channel_id, user_id, display_name)
        }
    }
}

/// File metadata issued by the upload service. Opaque to the messaging core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    pub file_id: String,
    pub url: String,
    pub mime_type: String,
    pub size: u64,
}

/// A posted message. Immutable once saved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    /// Denormalized from the sender's membership; absent once they left.
    pub sender_name: Option<String>,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh ID and the server's current time.
    pub fn new(
        channel_id: ChannelId,
        sender_id: UserId,
        body: impl Into<String>,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            channel_id,
            sender_id,
            sender_name: None,
            body: body.into(),
            attachment,
            created_at: now_millis(),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn created_at_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_parse_and_display() {
        assert_eq!("private".parse::<Visibility>().unwrap(), Visibility::Private);
        assert_eq!(Visibility::Public.to_string(), "public");
        assert!("hidden".parse::<Visibility>().is_err());
    }

    #[test]
    fn role_parse_and_display() {
        assert_eq!("owner".parse::<MemberRole>().unwrap(), MemberRole::Owner);
        assert_eq!(MemberRole::Member.to_string(), "member");
    }

    #[test]
    fn new_message_has_millisecond_timestamp() {
        let msg = Message::new(ChannelId::from_raw("C1"), UserId::from_raw("U1"), "hi", None);
        assert_eq!(msg.created_at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert!(msg.id.as_str().starts_with("msg_"));
        assert!(msg.sender_name.is_none());
    }

    #[test]
    fn owner_member_has_owner_role() {
        let m = ChannelMember::owner(ChannelId::new(), UserId::from_raw("U1"), "Ada");
        assert_eq!(m.role, MemberRole::Owner);
        assert_eq!(m.display_name, "Ada");
    }
}
