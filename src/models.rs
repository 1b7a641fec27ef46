//! Data models for the WorkChat messaging core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Conversation Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_type: String, // 'private' | 'group'
    pub group_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<Uuid>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.conversation_type == "group"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationMember {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: String, // 'owner' | 'admin' | 'member'
    pub is_muted: bool,
    pub is_hidden: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub unread_count: i32,
    pub last_read_message_id: Option<Uuid>,
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Member row plus profile fields resolved from the user-data agent.
#[derive(Debug, Clone, Serialize)]
pub struct MemberView {
    #[serde(flatten)]
    pub member: ConversationMember,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub username: Option<String>,
    pub position: Option<String>,
    pub company: Option<String>,
}

impl MemberView {
    pub fn bare(member: ConversationMember) -> Self {
        Self {
            member,
            name: None,
            avatar_url: None,
            username: None,
            position: None,
            company: None,
        }
    }
}

/// One entry of the conversation listing, with preview and presence.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationListItem {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: i32,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_text: Option<String>,
    pub online_status: std::collections::HashMap<String, bool>,
    pub members: Vec<MemberView>,
}

// ============================================================================
// Message Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: String, // 'text' | 'image' | 'video' | 'emoji'
    pub content: Option<String>,
    pub metadata: Option<Value>,
    pub status: String, // 'sent' | 'delivered' | 'read'
    pub reply_to_message_id: Option<Uuid>,
    pub is_recalled: bool,
    pub recalled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Emoji,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Emoji => "emoji",
        }
    }
}

/// Short preview string shown in conversation lists.
pub fn message_preview(message_type: &str, content: Option<&str>) -> Option<String> {
    match message_type {
        "text" => content.map(|text| {
            let chars: Vec<char> = text.chars().collect();
            if chars.len() > 50 {
                let head: String = chars[..50].iter().collect();
                format!("{}...", head)
            } else {
                text.to_string()
            }
        }),
        "image" => Some("[image]".to_string()),
        "video" => Some("[video]".to_string()),
        "emoji" => Some("[emoji]".to_string()),
        _ => None,
    }
}

// ============================================================================
// Relationship / Notification / Settings Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRelationship {
    pub id: Uuid,
    pub user_id: Uuid,
    pub target_user_id: Uuid,
    pub relationship_type: String, // 'blocked' | 'friend' | 'follow' | 'muted'
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub content: Option<String>,
    pub metadata: Option<Value>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub priority: i32, // 0 normal, 1 important, 2 urgent
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationTemplate {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub template_type: String,
    pub title: String,
    pub content_template: Option<String>,
    pub priority: i32,
    pub enable_push: bool,
    pub enable_websocket: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SystemSetting {
    pub id: Uuid,
    pub setting_key: String,
    pub setting_value: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// WebSocket Frames
// ============================================================================

/// Raw inbound frame; `data` is decoded per frame type by the dispatcher.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound frames, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Message(MessageFrame),
    OfflineMessage(Value),
    ConversationUpdate {
        conversation_id: Uuid,
        last_message_time: Option<DateTime<Utc>>,
        last_message_text: Option<String>,
        unread_count: i32,
    },
    UnreadCountUpdate {
        conversation_id: Uuid,
        unread_count: i32,
    },
    OnlineStatusUpdate {
        user_id: Uuid,
        is_online: bool,
    },
    Notification(Notification),
    NotificationUpdate {
        unread_count: i32,
        latest_notif_time: Option<DateTime<Utc>>,
    },
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
    },
    Read {
        conversation_id: Uuid,
        message_id: Uuid,
        reader_id: Uuid,
    },
    Recalled {
        message_id: Uuid,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: None,
            message: message.into(),
        }
    }

    /// Frames are serialized once and enqueued as text on every target
    /// session; serialization of our own types cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server frame serialization")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageFrame {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: String,
    pub content: Option<String>,
    pub metadata: Option<Value>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub reply_to_message_id: Option<Uuid>,
    pub can_send: bool,
}

impl MessageFrame {
    pub fn from_message(message: &Message, can_send: bool) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            message_type: message.message_type.clone(),
            content: message.content.clone(),
            metadata: message.metadata.clone(),
            status: message.status.clone(),
            created_at: message.created_at,
            reply_to_message_id: message.reply_to_message_id,
            can_send,
        }
    }
}

/// Envelope published on the `ws:broadcast` pub/sub channel for cross-replica
/// fan-out. `pod_id` lets the originating replica drop its own echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub user_id: Uuid,
    pub pod_id: Uuid,
    pub payload: String,
}

// ============================================================================
// WS Ingress Payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: Option<Uuid>,
    pub receiver_id: Option<Uuid>,
    pub message_type: MessageKind,
    pub content: Option<String>,
    pub metadata: Option<Value>,
    pub reply_to_message_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ReadPayload {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RecallPayload {
    pub message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SetCurrentConversationPayload {
    // null or empty string means the user left the chat view
    pub conversation_id: Option<String>,
}

// ============================================================================
// HTTP Request/Response Models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreatePrivateConversationRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AddMembersRequest {
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveMemberRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct BlockUserRequest {
    pub target_user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingRequest {
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    #[serde(rename = "type")]
    pub template_type: String,
    pub title: String,
    pub content_template: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enable_push: bool,
    #[serde(default = "default_true")]
    pub enable_websocket: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    pub title: Option<String>,
    pub content_template: Option<String>,
    pub priority: Option<i32>,
    pub enable_push: Option<bool>,
    pub enable_websocket: Option<bool>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchSendNotificationRequest {
    pub user_ids: Vec<Uuid>,
    pub template_type: String,
    #[serde(default)]
    pub template_vars: std::collections::HashMap<String, String>,
    pub metadata: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_preview_truncates_long_text() {
        let long: String = "a".repeat(80);
        let preview = message_preview("text", Some(&long)).unwrap();
        assert_eq!(preview.chars().count(), 53);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_message_preview_counts_chars_not_bytes() {
        let text: String = "é".repeat(50);
        let preview = message_preview("text", Some(&text)).unwrap();
        assert_eq!(preview, text);
    }

    #[test]
    fn test_message_preview_media_kinds() {
        assert_eq!(message_preview("image", None).unwrap(), "[image]");
        assert_eq!(message_preview("video", None).unwrap(), "[video]");
        assert_eq!(message_preview("emoji", None).unwrap(), "[emoji]");
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let frame = ServerFrame::UnreadCountUpdate {
            conversation_id: Uuid::nil(),
            unread_count: 3,
        };
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "unread_count_update");
        assert_eq!(value["data"]["unread_count"], 3);
    }

    #[test]
    fn test_error_frame_omits_absent_code() {
        let value: Value = serde_json::from_str(&ServerFrame::error("nope").to_json()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["message"], "nope");
        assert!(value["data"].get("code").is_none());
    }

    #[test]
    fn test_client_envelope_tolerates_missing_data() {
        let envelope: ClientEnvelope = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(envelope.frame_type, "heartbeat");
        assert!(envelope.data.is_null());
    }

    #[test]
    fn test_broadcast_envelope_round_trip() {
        let envelope = BroadcastEnvelope {
            user_id: Uuid::new_v4(),
            pod_id: Uuid::new_v4(),
            payload: ServerFrame::error("offline").to_json(),
        };
        let decoded: BroadcastEnvelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(decoded.user_id, envelope.user_id);
        assert_eq!(decoded.pod_id, envelope.pod_id);
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[test]
    fn test_send_request_decoding() {
        let req: SendMessageRequest = serde_json::from_str(
            r#"{"receiver_id":"7f2c1a10-9f7c-4b4e-a6c8-0a4f4e1b2c3d","message_type":"text","content":"Hello B!"}"#,
        )
        .unwrap();
        assert!(req.conversation_id.is_none());
        assert_eq!(req.message_type, MessageKind::Text);
        assert_eq!(req.content.as_deref(), Some("Hello B!"));
    }
}
