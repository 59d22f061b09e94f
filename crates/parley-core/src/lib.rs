pub mod errors;
pub mod frames;
pub mod ids;
pub mod models;

pub use errors::ChatError;
pub use frames::{InboundFrame, OutboundFrame};
pub use ids::{AttachmentId, ChannelId, ConnectionId, MessageId, UserId};
pub use models::{Attachment, Channel, ChannelMember, MemberRole, Message, Visibility};
