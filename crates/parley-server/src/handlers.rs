//! Request/response routes: history, channel and membership management.
//!
//! The caller's identity comes from the `x-user-id` header, set by the
//! authenticating proxy in front of this service.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_core::{
    Attachment, Channel, ChannelId, ChannelMember, ChatError, MemberRole, Message, UserId,
    Visibility,
};
use parley_engine::NewChannel;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::server::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Error body: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub enum ApiError {
    MissingIdentity,
    Chat(ChatError),
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self::Chat(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingIdentity => StatusCode::UNAUTHORIZED,
            Self::Chat(e) => match e {
                ChatError::Unauthorized(_) => StatusCode::FORBIDDEN,
                ChatError::NotFound(_) => StatusCode::NOT_FOUND,
                ChatError::InvalidRequest(_) | ChatError::Protocol(_) => StatusCode::BAD_REQUEST,
                ChatError::Connection(_) | ChatError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                ChatError::Storage(_) | ChatError::Internal(_) | ChatError::Broadcast(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match &self {
            Self::MissingIdentity => (
                "unauthorized",
                format!("missing {USER_ID_HEADER} header"),
            ),
            Self::Chat(e) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %e, "request failed");
                (e.error_kind(), "internal server error".to_string())
            }
            Self::Chat(e) => (e.error_kind(), e.to_string()),
        };
        let body = serde_json::json!({
            "error": { "code": code, "message": message },
        });
        (status, Json(body)).into_response()
    }
}

/// Authenticated caller.
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(UserId::from_raw(v)))
            .ok_or(ApiError::MissingIdentity)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: i64,
}

impl From<Message> for MessageInfo {
    fn from(m: Message) -> Self {
        let created_at = m.created_at_millis();
        Self {
            id: m.id.to_string(),
            channel_id: m.channel_id.to_string(),
            sender_id: m.sender_id.to_string(),
            sender_name: m.sender_name,
            content: m.body,
            attachment: m.attachment,
            created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub visibility: Visibility,
    pub frozen: bool,
    pub created_at: i64,
}

impl From<Channel> for ChannelInfo {
    fn from(c: Channel) -> Self {
        Self {
            id: c.id.to_string(),
            name: c.name,
            creator_id: c.creator_id.to_string(),
            description: c.description,
            visibility: c.visibility,
            frozen: c.frozen,
            created_at: c.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: String,
    pub display_name: String,
    pub role: MemberRole,
    pub joined_at: i64,
}

impl From<ChannelMember> for MemberInfo {
    fn from(m: ChannelMember) -> Self {
        Self {
            user_id: m.user_id.to_string(),
            display_name: m.display_name,
            role: m.role,
            joined_at: m.joined_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    /// Creator's display name; defaults to the user ID.
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberBody {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FrozenBody {
    pub frozen: bool,
}

/// `GET /channels/{id}/messages?limit&offset`
pub async fn list_messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(channel_id): Path<String>,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<MessageInfo>>, ApiError> {
    let messages = state
        .session()
        .get_history_as(
            &caller,
            &ChannelId::from_raw(channel_id),
            page.limit.unwrap_or(0),
            page.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(messages.into_iter().map(MessageInfo::from).collect()))
}

/// `POST /channels`
pub async fn create_channel(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<CreateChannelBody>,
) -> Result<(StatusCode, Json<ChannelInfo>), ApiError> {
    let creator_name = body
        .display_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| caller.to_string());
    let params = NewChannel {
        name: body.name,
        description: body.description,
        visibility: body.visibility,
        creator_name,
    };
    let channel = state.session().create_channel(&caller, params).await?;
    Ok((StatusCode::CREATED, Json(channel.into())))
}

/// `GET /channels/{id}`
pub async fn get_channel(
    State(state): State<AppState>,
    Caller(_caller): Caller,
    Path(channel_id): Path<String>,
) -> Result<Json<ChannelInfo>, ApiError> {
    let channel = state
        .session()
        .get_channel(&ChannelId::from_raw(channel_id))
        .await?;
    Ok(Json(channel.into()))
}

/// `DELETE /channels/{id}`
pub async fn delete_channel(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(channel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .session()
        .delete_channel(&caller, &ChannelId::from_raw(channel_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /channels/{id}/frozen`
pub async fn set_frozen(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(channel_id): Path<String>,
    Json(body): Json<FrozenBody>,
) -> Result<Json<ChannelInfo>, ApiError> {
    let channel = state
        .session()
        .set_frozen(&caller, &ChannelId::from_raw(channel_id), body.frozen)
        .await?;
    Ok(Json(channel.into()))
}

/// `GET /channels/{id}/members`
pub async fn list_members(
    State(state): State<AppState>,
    Caller(_caller): Caller,
    Path(channel_id): Path<String>,
) -> Result<Json<Vec<MemberInfo>>, ApiError> {
    let members = state
        .session()
        .list_members(&ChannelId::from_raw(channel_id))
        .await?;
    Ok(Json(members.into_iter().map(MemberInfo::from).collect()))
}

/// `POST /channels/{id}/members`
pub async fn add_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(channel_id): Path<String>,
    Json(body): Json<AddMemberBody>,
) -> Result<Json<MemberInfo>, ApiError> {
    if body.user_id.trim().is_empty() {
        return Err(ChatError::InvalidRequest("userId is required".into()).into());
    }
    let user_id = UserId::from_raw(body.user_id.trim());
    let display_name = body
        .display_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| user_id.to_string());
    let member = state
        .session()
        .add_member(&caller, &ChannelId::from_raw(channel_id), &user_id, &display_name)
        .await?;
    Ok(Json(member.into()))
}

/// `DELETE /channels/{id}/members/{user_id}`
pub async fn remove_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((channel_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .session()
        .remove_member(
            &caller,
            &ChannelId::from_raw(channel_id),
            &UserId::from_raw(user_id),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /users/{id}/channels`. Callers may only list their own channels.
pub async fn list_user_channels(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ChannelInfo>>, ApiError> {
    let user_id = UserId::from_raw(user_id);
    if user_id != caller {
        return Err(ChatError::Unauthorized("cannot list another user's channels".into()).into());
    }
    let channels = state.session().list_channels_for_user(&user_id).await?;
    Ok(Json(channels.into_iter().map(ChannelInfo::from).collect()))
}
