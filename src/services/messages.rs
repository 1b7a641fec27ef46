//! Message send pipeline, recall, read-marking and search
//!
//! The send pipeline commits to the database first and fans out second, so a
//! cache outage can never leave a half-delivered message: fan-out failures
//! are logged and the message stays durable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::{send_lock_key, Cache};
use crate::error::{AppError, Result};
use crate::models::{message_preview, Conversation, ConversationMember, Message, MessageKind, SendMessageRequest};
use crate::services::conversations::ConversationService;
use crate::settings::{SettingsRegistry, ENABLE_FIRST_MESSAGE_LIMIT, MAX_VIDEO_SIZE_MB};
use crate::websocket::{ConversationUpdateNotifier, OnlineChecker, UnreadNotifier};

const SEND_LOCK_TTL: Duration = Duration::from_secs(2);
const SEND_LOCK_ATTEMPTS: u32 = 3;
const RECALL_WINDOW_SECS: f64 = 120.0;

pub struct MessageService {
    pool: PgPool,
    cache: Cache,
    settings: Arc<SettingsRegistry>,
    conversations: Arc<ConversationService>,
    online: Arc<dyn OnlineChecker>,
    unread_notifier: Arc<dyn UnreadNotifier>,
    conversation_notifier: Arc<dyn ConversationUpdateNotifier>,
    default_max_video_size_mb: i64,
}

impl MessageService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        cache: Cache,
        settings: Arc<SettingsRegistry>,
        conversations: Arc<ConversationService>,
        online: Arc<dyn OnlineChecker>,
        unread_notifier: Arc<dyn UnreadNotifier>,
        conversation_notifier: Arc<dyn ConversationUpdateNotifier>,
        default_max_video_size_mb: i64,
    ) -> Self {
        Self {
            pool,
            cache,
            settings,
            conversations,
            online,
            unread_notifier,
            conversation_notifier,
            default_max_video_size_mb,
        }
    }

    // ========================================================================
    // Send pipeline
    // ========================================================================

    pub async fn send(&self, sender_id: Uuid, req: &SendMessageRequest) -> Result<Message> {
        // Content shape
        if req.message_type == MessageKind::Text
            && req.content.as_deref().map_or(true, |c| c.is_empty())
        {
            return Err(AppError::InvalidArgument(
                "content is required for text messages".to_string(),
            ));
        }

        // Conversation resolution
        let (conversation_id, just_created) = match (req.conversation_id, req.receiver_id) {
            (Some(conversation_id), _) => (conversation_id, false),
            (None, Some(receiver_id)) => {
                let (conversation, created) = self
                    .conversations
                    .resolve_or_create_private(sender_id, receiver_id)
                    .await?;
                (conversation.id, created)
            }
            (None, None) => {
                return Err(AppError::InvalidArgument(
                    "conversation_id is required".to_string(),
                ))
            }
        };

        // Membership
        if !self
            .conversations
            .is_member(conversation_id, sender_id)
            .await?
        {
            return Err(AppError::Forbidden(
                "you are not a member of this conversation".to_string(),
            ));
        }

        // Block check
        if let Some(receiver_id) = req.receiver_id {
            if self.is_blocked_by(receiver_id, sender_id).await? {
                return Err(AppError::Forbidden(
                    "you are blocked by this user".to_string(),
                ));
            }
        }

        // Video size
        if req.message_type == MessageKind::Video {
            self.check_video_size(req.metadata.as_ref())?;
        }

        // First-message anti-spam. The lock spans the check and the insert so
        // two concurrent sends cannot both pass the check.
        let lock_key = send_lock_key(conversation_id, sender_id);
        let locked = if !just_created && self.settings.is_enabled(ENABLE_FIRST_MESSAGE_LIMIT) {
            if !self
                .cache
                .acquire_lock(&lock_key, SEND_LOCK_TTL, SEND_LOCK_ATTEMPTS)
                .await?
            {
                return Err(AppError::ResourceExhausted(
                    "failed to acquire send lock, please try again".to_string(),
                ));
            }
            if !self.can_send(sender_id, conversation_id).await {
                self.cache.release_lock(&lock_key).await;
                return Err(AppError::Forbidden(
                    "first message limit: wait for reply before sending more messages".to_string(),
                ));
            }
            true
        } else {
            false
        };

        let persisted = self.persist(sender_id, conversation_id, req).await;
        if locked {
            self.cache.release_lock(&lock_key).await;
        }
        let (message, recipients) = persisted?;

        self.fan_out(&message, &recipients).await;

        Ok(message)
    }

    /// Viewer snapshot plus the transactional write.
    async fn persist(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        req: &SendMessageRequest,
    ) -> Result<(Message, Vec<Recipient>)> {
        // Snapshot recipients and their viewing state before the transaction;
        // this snapshot is the authority for the unread update.
        let members: Vec<ConversationMember> = sqlx::query_as(
            "SELECT * FROM conversation_members
             WHERE conversation_id = $1 AND user_id != $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(sender_id)
        .fetch_all(&self.pool)
        .await?;

        let recipients: Vec<Recipient> = members
            .into_iter()
            .map(|member| {
                let is_viewing = self.online.is_viewing(member.user_id, conversation_id);
                Recipient {
                    user_id: member.user_id,
                    prior_unread: member.unread_count,
                    is_viewing,
                }
            })
            .collect();

        let mut tx = self.pool.begin().await?;

        let message: Message = sqlx::query_as(
            r#"
            INSERT INTO messages
                (conversation_id, sender_id, message_type, content, metadata,
                 status, reply_to_message_id)
            VALUES ($1, $2, $3, $4, $5, 'sent', $6)
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(req.message_type.as_str())
        .bind(&req.content)
        .bind(&req.metadata)
        .bind(req.reply_to_message_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations
             SET last_message_at = $2, last_message_id = $3, updated_at = $2
             WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(message.created_at)
        .bind(message.id)
        .execute(&mut *tx)
        .await?;

        for recipient in &recipients {
            // New messages always unhide; unread only grows for members not
            // currently viewing the conversation.
            sqlx::query(
                r#"
                UPDATE conversation_members
                SET is_hidden = FALSE,
                    unread_count = unread_count + CASE WHEN $3 THEN 0 ELSE 1 END
                WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
                "#,
            )
            .bind(conversation_id)
            .bind(recipient.user_id)
            .bind(recipient.is_viewing)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((message, recipients))
    }

    /// Offline-queue handoff plus conversation/unread pushes. All failures
    /// here are non-fatal; the message is already committed.
    async fn fan_out(&self, message: &Message, recipients: &[Recipient]) {
        let preview = message_preview(&message.message_type, message.content.as_deref());
        let serialized = match serde_json::to_string(message) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to serialize message {}: {}", message.id, e);
                return;
            }
        };

        for recipient in recipients {
            if let Err(e) = self
                .cache
                .push_offline_message(recipient.user_id, &serialized)
                .await
            {
                tracing::error!(
                    "Failed to queue offline message for {}: {}",
                    recipient.user_id,
                    e
                );
            }

            let unread_count = if recipient.is_viewing {
                recipient.prior_unread
            } else {
                recipient.prior_unread + 1
            };

            self.conversation_notifier
                .send_conversation_update(
                    recipient.user_id,
                    message.conversation_id,
                    Some(message.created_at),
                    preview.clone(),
                    unread_count,
                )
                .await;

            self.unread_notifier
                .send_unread_count_update(recipient.user_id, message.conversation_id, unread_count)
                .await;
        }
    }

    fn check_video_size(&self, metadata: Option<&serde_json::Value>) -> Result<()> {
        let Some(file_size) = metadata
            .and_then(|m| m.get("file_size"))
            .and_then(|v| v.as_f64())
        else {
            return Ok(());
        };

        let max_mb = self
            .settings
            .get_int(MAX_VIDEO_SIZE_MB, self.default_max_video_size_mb);
        let file_size_mb = file_size / (1024.0 * 1024.0);
        if file_size_mb > max_mb as f64 {
            return Err(AppError::InvalidArgument(format!(
                "video file size exceeds limit: max {}MB, got {:.2}MB",
                max_mb, file_size_mb
            )));
        }
        Ok(())
    }

    async fn is_blocked_by(&self, owner: Uuid, target: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_relationships
             WHERE user_id = $1 AND target_user_id = $2 AND relationship_type = 'blocked'",
        )
        .bind(owner)
        .bind(target)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// First-message rule: groups are exempt; in a private conversation the
    /// sender may send when they have sent nothing yet or the other side has
    /// replied.
    pub async fn can_send(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        if !self.settings.is_enabled(ENABLE_FIRST_MESSAGE_LIMIT) {
            return true;
        }

        let conversation: Option<Conversation> =
            sqlx::query_as("SELECT * FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await
                .unwrap_or(None);
        let Some(conversation) = conversation else {
            return true;
        };
        if conversation.is_group() {
            return true;
        }

        let counts: std::result::Result<(i64, i64), sqlx::Error> = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE sender_id = $2),
                COUNT(*) FILTER (WHERE sender_id != $2)
            FROM messages WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await;

        match counts {
            Ok((mine, theirs)) => mine == 0 || theirs > 0,
            Err(e) => {
                tracing::warn!("can_send query failed: {}", e);
                true
            }
        }
    }

    // ========================================================================
    // Recall
    // ========================================================================

    pub async fn get_message(&self, message_id: Uuid) -> Result<Message> {
        sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("message not found".to_string()))
    }

    /// One-way `Live -> Recalled` transition, allowed to the sender within a
    /// window measured by the database clock.
    pub async fn recall(&self, user_id: Uuid, message_id: Uuid) -> Result<()> {
        let message = self.get_message(message_id).await?;

        if message.sender_id != user_id {
            return Err(AppError::Forbidden(
                "you can only recall your own messages".to_string(),
            ));
        }
        if message.is_recalled {
            return Err(AppError::InvalidArgument(
                "message already recalled".to_string(),
            ));
        }

        let (elapsed_secs,): (f64,) = sqlx::query_as(
            "SELECT EXTRACT(EPOCH FROM (NOW() - created_at))::DOUBLE PRECISION
             FROM messages WHERE id = $1",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;

        if elapsed_secs > RECALL_WINDOW_SECS {
            return Err(AppError::InvalidArgument(format!(
                "can only recall messages within 2 minutes (elapsed: {:.0} seconds)",
                elapsed_secs
            )));
        }

        sqlx::query(
            "UPDATE messages SET is_recalled = TRUE, recalled_at = NOW()
             WHERE id = $1 AND is_recalled = FALSE",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Read-marking
    // ========================================================================

    /// Monotone mark-read: the member row only advances when the target
    /// message is at least as new as the currently recorded one, which makes
    /// concurrent marks from multiple devices safe.
    pub async fn mark_read(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<bool> {
        let target = self.get_message(message_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE conversation_members cm
            SET unread_count = 0,
                last_read_message_id = $1,
                last_read_at = NOW()
            WHERE cm.conversation_id = $2
              AND cm.user_id = $3
              AND cm.left_at IS NULL
              AND (
                  cm.last_read_message_id IS NULL
                  OR NOT EXISTS (
                      SELECT 1 FROM messages m
                      WHERE m.id = cm.last_read_message_id
                        AND m.created_at > $4
                  )
              )
            "#,
        )
        .bind(message_id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(target.created_at)
        .execute(&self.pool)
        .await?;

        let advanced = result.rows_affected() > 0;
        if advanced {
            self.unread_notifier
                .send_unread_count_update(user_id, conversation_id, 0)
                .await;
        }
        Ok(advanced)
    }

    // ========================================================================
    // Search
    // ========================================================================

    pub async fn search(
        &self,
        user_id: Uuid,
        keyword: &str,
        conversation_id: Option<Uuid>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        if let Some(conversation_id) = conversation_id {
            if !self
                .conversations
                .is_member(conversation_id, user_id)
                .await?
            {
                return Err(AppError::Forbidden(
                    "you are not a member of this conversation".to_string(),
                ));
            }
        }

        let pattern = format!("%{}%", keyword);
        let messages = sqlx::query_as(
            r#"
            SELECT DISTINCT m.* FROM messages m
            INNER JOIN conversation_members cm
                ON m.conversation_id = cm.conversation_id
                AND cm.user_id = $1 AND cm.left_at IS NULL
            WHERE m.content ILIKE $2
              AND m.is_recalled = FALSE
              AND ($3::uuid IS NULL OR m.conversation_id = $3)
            ORDER BY m.created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(&pattern)
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    pub async fn member_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        self.conversations.member_ids(conversation_id).await
    }
}

struct Recipient {
    user_id: Uuid,
    prior_unread: i32,
    is_viewing: bool,
}
