//! Conversation lifecycle and listing
//!
//! Private conversations are resolved idempotently under an advisory cache
//! lock ("select, lock, select again, insert"); the partial unique index on
//! active members is the hard safety net underneath.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::agent::UserDataClient;
use crate::cache::{conversation_lock_key, Cache};
use crate::error::{AppError, Result};
use crate::models::{
    message_preview, Conversation, ConversationListItem, ConversationMember, MemberView, Message,
};
use crate::settings::{SettingsRegistry, ENABLE_FIRST_MESSAGE_LIMIT, ENABLE_ONLINE_STATUS};

const CREATE_LOCK_TTL: Duration = Duration::from_secs(5);
const CREATE_LOCK_ATTEMPTS: u32 = 30;

const FIND_PRIVATE_SQL: &str = r#"
    SELECT c.* FROM conversations c
    INNER JOIN conversation_members m1
        ON c.id = m1.conversation_id AND m1.user_id = $1 AND m1.left_at IS NULL
    INNER JOIN conversation_members m2
        ON c.id = m2.conversation_id AND m2.user_id = $2 AND m2.left_at IS NULL
    WHERE c.conversation_type = 'private'
      AND (SELECT COUNT(*) FROM conversation_members
           WHERE conversation_id = c.id AND left_at IS NULL) = 2
    LIMIT 1
"#;

pub struct ConversationService {
    pool: PgPool,
    cache: Cache,
    settings: Arc<SettingsRegistry>,
    agent: UserDataClient,
}

/// Message history page with the caller's send verdict and peer presence.
#[derive(Debug, serde::Serialize)]
pub struct MessagesPage {
    pub messages: Vec<Message>,
    pub can_send: bool,
    pub online_status: HashMap<String, bool>,
}

impl ConversationService {
    pub fn new(
        pool: PgPool,
        cache: Cache,
        settings: Arc<SettingsRegistry>,
        agent: UserDataClient,
    ) -> Self {
        Self {
            pool,
            cache,
            settings,
            agent,
        }
    }

    // ========================================================================
    // Membership helpers
    // ========================================================================

    pub async fn get(&self, conversation_id: Uuid) -> Result<Conversation> {
        sqlx::query_as("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))
    }

    pub async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM conversation_members
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn active_members(&self, conversation_id: Uuid) -> Result<Vec<ConversationMember>> {
        let members = sqlx::query_as(
            "SELECT * FROM conversation_members
             WHERE conversation_id = $1 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    pub async fn member_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM conversation_members
             WHERE conversation_id = $1 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn require_active_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<ConversationMember> {
        sqlx::query_as(
            "SELECT * FROM conversation_members
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Forbidden("you are not a member of this conversation".to_string()))
    }

    // ========================================================================
    // Private conversation resolution
    // ========================================================================

    async fn find_private(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as(FIND_PRIVATE_SQL)
            .bind(a)
            .bind(b)
            .fetch_optional(&self.pool)
            .await?;
        Ok(conversation)
    }

    /// Resolve-or-create for the unordered pair. Returns the conversation and
    /// whether it was created by this call.
    pub async fn resolve_or_create_private(&self, a: Uuid, b: Uuid) -> Result<(Conversation, bool)> {
        if a == b {
            return Err(AppError::InvalidArgument(
                "cannot create conversation with yourself".to_string(),
            ));
        }

        // Common path: the conversation already exists, no lock needed.
        if let Some(existing) = self.find_private(a, b).await? {
            return Ok((existing, false));
        }

        let lock_key = conversation_lock_key(a, b);
        if !self
            .cache
            .acquire_lock(&lock_key, CREATE_LOCK_TTL, CREATE_LOCK_ATTEMPTS)
            .await?
        {
            return Err(AppError::ResourceExhausted(
                "failed to acquire lock for creating conversation".to_string(),
            ));
        }

        let result = self.create_private_locked(a, b).await;
        self.cache.release_lock(&lock_key).await;
        result
    }

    async fn create_private_locked(&self, a: Uuid, b: Uuid) -> Result<(Conversation, bool)> {
        // A concurrent first-send may have won the race before we held the
        // lock.
        if let Some(existing) = self.find_private(a, b).await? {
            return Ok((existing, false));
        }

        let mut tx = self.pool.begin().await?;
        let conversation: Conversation = sqlx::query_as(
            "INSERT INTO conversations (conversation_type) VALUES ('private') RETURNING *",
        )
        .fetch_one(&mut *tx)
        .await?;

        for user_id in [a, b] {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, role)
                 VALUES ($1, $2, 'member')",
            )
            .bind(conversation.id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok((conversation, true))
    }

    // ========================================================================
    // Group lifecycle
    // ========================================================================

    pub async fn create_group(
        &self,
        creator_id: Uuid,
        name: &str,
        member_ids: &[Uuid],
    ) -> Result<Conversation> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "group name is required".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let conversation: Conversation = sqlx::query_as(
            "INSERT INTO conversations (conversation_type, group_name)
             VALUES ('group', $1) RETURNING *",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role)
             VALUES ($1, $2, 'owner')",
        )
        .bind(conversation.id)
        .bind(creator_id)
        .execute(&mut *tx)
        .await?;

        let mut seen = HashSet::new();
        for &member_id in member_ids {
            if member_id == creator_id || !seen.insert(member_id) {
                continue;
            }
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, role)
                 VALUES ($1, $2, 'member')",
            )
            .bind(conversation.id)
            .bind(member_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(conversation)
    }

    pub async fn add_members(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        member_ids: &[Uuid],
    ) -> Result<()> {
        let conversation = self.get(conversation_id).await?;
        if !conversation.is_group() {
            return Err(AppError::InvalidArgument(
                "can only add members to group conversations".to_string(),
            ));
        }

        let operator = self.require_active_member(conversation_id, user_id).await?;
        if operator.role != "owner" && operator.role != "admin" {
            return Err(AppError::Forbidden(
                "only owner or admin can add members".to_string(),
            ));
        }

        for &member_id in member_ids {
            // Already-active members are skipped; the partial unique index
            // backs this up under concurrency.
            sqlx::query(
                r#"
                INSERT INTO conversation_members (conversation_id, user_id, role)
                SELECT $1, $2, 'member'
                WHERE NOT EXISTS (
                    SELECT 1 FROM conversation_members
                    WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
                )
                "#,
            )
            .bind(conversation_id)
            .bind(member_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn remove_member(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<()> {
        let conversation = self.get(conversation_id).await?;
        if !conversation.is_group() {
            return Err(AppError::InvalidArgument(
                "can only remove members from group conversations".to_string(),
            ));
        }

        let operator = self.require_active_member(conversation_id, user_id).await?;
        if operator.role != "owner" && operator.role != "admin" {
            return Err(AppError::Forbidden(
                "only owner or admin can remove members".to_string(),
            ));
        }

        let target = sqlx::query_as::<_, ConversationMember>(
            "SELECT * FROM conversation_members
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(target_user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("target user is not a member".to_string()))?;

        if target.role == "owner" {
            return Err(AppError::Forbidden("cannot remove owner".to_string()));
        }

        sqlx::query("UPDATE conversation_members SET left_at = NOW() WHERE id = $1")
            .bind(target.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn leave_group(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        let conversation = self.get(conversation_id).await?;
        if !conversation.is_group() {
            return Err(AppError::InvalidArgument(
                "can only leave group conversations".to_string(),
            ));
        }

        let member = self.require_active_member(conversation_id, user_id).await?;
        if member.role == "owner" {
            return Err(AppError::Forbidden(
                "owner cannot leave group, please transfer ownership first".to_string(),
            ));
        }

        sqlx::query("UPDATE conversation_members SET left_at = NOW() WHERE id = $1")
            .bind(member.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_role(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        target_user_id: Uuid,
        new_role: &str,
    ) -> Result<()> {
        if !matches!(new_role, "owner" | "admin" | "member") {
            return Err(AppError::InvalidArgument("invalid role".to_string()));
        }

        let operator = self.require_active_member(conversation_id, user_id).await?;
        if operator.role != "owner" {
            return Err(AppError::Forbidden(
                "only owner can change roles".to_string(),
            ));
        }

        let result = sqlx::query(
            "UPDATE conversation_members SET role = $3
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(target_user_id)
        .bind(new_role)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("member not found".to_string()));
        }
        Ok(())
    }

    pub async fn hide(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conversation_members SET is_hidden = TRUE
             WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(
                "conversation not found or already left".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    pub async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        search: &str,
    ) -> Result<Vec<ConversationListItem>> {
        let search = search.trim();
        let rows: Vec<ListRow> = if search.is_empty() {
            sqlx::query_as(
                r#"
                SELECT c.*, cm.unread_count AS my_unread_count
                FROM conversations c
                INNER JOIN conversation_members cm
                    ON c.id = cm.conversation_id AND cm.user_id = $1
                WHERE cm.left_at IS NULL AND cm.is_hidden = FALSE
                ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC
                LIMIT $2 OFFSET $3
                "#,
            )
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            let matched = self.match_private_by_peer(user_id, search, limit, offset).await?;
            if matched.is_empty() {
                return Ok(Vec::new());
            }
            sqlx::query_as(
                r#"
                SELECT c.*, cm.unread_count AS my_unread_count
                FROM conversations c
                INNER JOIN conversation_members cm
                    ON c.id = cm.conversation_id AND cm.user_id = $1
                WHERE cm.left_at IS NULL AND cm.is_hidden = FALSE AND c.id = ANY($2)
                ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC
                "#,
            )
            .bind(user_id)
            .bind(&matched)
            .fetch_all(&self.pool)
            .await?
        };

        self.assemble_list(user_id, rows).await
    }

    pub async fn detail(&self, conversation_id: Uuid, user_id: Uuid) -> Result<ConversationListItem> {
        let row: ListRow = sqlx::query_as(
            r#"
            SELECT c.*, cm.unread_count AS my_unread_count
            FROM conversations c
            INNER JOIN conversation_members cm
                ON c.id = cm.conversation_id AND cm.user_id = $2
            WHERE c.id = $1 AND cm.left_at IS NULL
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;

        let mut items = self.assemble_list(user_id, vec![row]).await?;
        Ok(items.remove(0))
    }

    /// Joins member rows, last-message previews, agent profiles and presence
    /// into listing items. One batch query per concern; no per-row fan-out.
    async fn assemble_list(
        &self,
        user_id: Uuid,
        rows: Vec<ListRow>,
    ) -> Result<Vec<ConversationListItem>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let conversation_ids: Vec<Uuid> = rows.iter().map(|r| r.conversation.id).collect();

        let all_members: Vec<ConversationMember> = sqlx::query_as(
            "SELECT * FROM conversation_members
             WHERE conversation_id = ANY($1) AND left_at IS NULL",
        )
        .bind(&conversation_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut members_by_conversation: HashMap<Uuid, Vec<ConversationMember>> = HashMap::new();
        let mut all_user_ids: HashSet<Uuid> = HashSet::new();
        for member in all_members {
            all_user_ids.insert(member.user_id);
            members_by_conversation
                .entry(member.conversation_id)
                .or_default()
                .push(member);
        }

        let message_ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|r| r.conversation.last_message_id)
            .collect();
        let previews = self.previews_by_ids(&message_ids).await?;

        let user_ids: Vec<Uuid> = all_user_ids.into_iter().collect();
        let profiles = self.agent.batch_get(&user_ids).await;

        let presence_enabled = self.settings.is_enabled(ENABLE_ONLINE_STATUS);

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = row.conversation;
            let members = members_by_conversation
                .remove(&conversation.id)
                .unwrap_or_default();

            let mut online_status = HashMap::new();
            if presence_enabled && !conversation.is_group() {
                for member in &members {
                    if member.user_id == user_id {
                        continue;
                    }
                    let online = self.cache.is_online(member.user_id).await.unwrap_or(false);
                    online_status.insert(member.user_id.to_string(), online);
                }
            }

            let member_views = members
                .into_iter()
                .map(|member| {
                    let mut view = MemberView::bare(member);
                    if let Some(profile) = profiles.get(&view.member.user_id.to_string()) {
                        view.name = Some(profile.name.clone());
                        view.avatar_url = Some(profile.avatar_url.clone());
                        view.username = Some(profile.domain.clone());
                        view.position = Some(profile.position.clone());
                        view.company = Some(profile.company.clone());
                    }
                    view
                })
                .collect();

            let last_message_text = conversation
                .last_message_id
                .and_then(|id| previews.get(&id).cloned());

            items.push(ConversationListItem {
                unread_count: row.my_unread_count,
                last_message_time: conversation.last_message_at,
                last_message_text,
                online_status,
                members: member_views,
                conversation,
            });
        }

        Ok(items)
    }

    /// Preview strings for the given message ids; recalled messages yield
    /// nothing.
    async fn previews_by_ids(&self, message_ids: &[Uuid]) -> Result<HashMap<Uuid, String>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(Uuid, Option<String>, String)> = sqlx::query_as(
            "SELECT id, content, message_type FROM messages
             WHERE id = ANY($1) AND is_recalled = FALSE",
        )
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut previews = HashMap::new();
        for (id, content, message_type) in rows {
            if let Some(preview) = message_preview(&message_type, content.as_deref()) {
                previews.insert(id, preview);
            }
        }
        Ok(previews)
    }

    /// Ids of the caller's private conversations whose peer name or handle
    /// contains the keyword (resolved via the user-data agent).
    async fn match_private_by_peer(
        &self,
        user_id: Uuid,
        keyword: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Uuid>> {
        let peers: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT cm2.conversation_id, cm2.user_id
            FROM conversation_members cm1
            INNER JOIN conversation_members cm2
                ON cm1.conversation_id = cm2.conversation_id
                AND cm2.user_id != $1
                AND cm2.left_at IS NULL
            INNER JOIN conversations c
                ON c.id = cm1.conversation_id AND c.conversation_type = 'private'
            WHERE cm1.user_id = $1 AND cm1.left_at IS NULL AND cm1.is_hidden = FALSE
            ORDER BY c.updated_at DESC, c.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        if peers.is_empty() {
            return Ok(Vec::new());
        }

        let peer_ids: Vec<Uuid> = peers.iter().map(|(_, peer)| *peer).collect();
        let profiles = self.agent.batch_get(&peer_ids).await;

        let keyword_lower = keyword.to_lowercase();
        let matched: Vec<Uuid> = peers
            .iter()
            .filter(|(_, peer)| {
                profiles
                    .get(&peer.to_string())
                    .map(|p| {
                        p.name.to_lowercase().contains(&keyword_lower)
                            || p.domain.to_lowercase().contains(&keyword_lower)
                    })
                    .unwrap_or(false)
            })
            .map(|(conversation_id, _)| *conversation_id)
            .collect();

        let start = (offset.max(0) as usize).min(matched.len());
        let end = (start + limit.max(0) as usize).min(matched.len());
        Ok(matched[start..end].to_vec())
    }

    // ========================================================================
    // Message history
    // ========================================================================

    pub async fn messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<MessagesPage> {
        if !self.is_member(conversation_id, user_id).await? {
            return Err(AppError::Forbidden(
                "you are not a member of this conversation".to_string(),
            ));
        }

        let mut messages: Vec<Message> = sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        messages.reverse(); // newest last

        let can_send = self
            .can_send_from_history(user_id, conversation_id, &messages)
            .await?;
        let online_status = self.online_status_for(user_id, conversation_id).await?;

        Ok(MessagesPage {
            messages,
            can_send,
            online_status,
        })
    }

    /// Send verdict derived from a loaded page: the caller may send when the
    /// limit is off, the conversation is a group, they have sent nothing yet,
    /// or the other side has replied.
    async fn can_send_from_history(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        messages: &[Message],
    ) -> Result<bool> {
        if !self.settings.is_enabled(ENABLE_FIRST_MESSAGE_LIMIT) {
            return Ok(true);
        }
        let conversation = self.get(conversation_id).await?;
        if conversation.is_group() {
            return Ok(true);
        }

        let mine = messages.iter().any(|m| m.sender_id == user_id);
        let theirs = messages.iter().any(|m| m.sender_id != user_id);
        Ok(!mine || theirs)
    }

    async fn online_status_for(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<HashMap<String, bool>> {
        let mut online_status = HashMap::new();
        if !self.settings.is_enabled(ENABLE_ONLINE_STATUS) {
            return Ok(online_status);
        }
        let conversation = self.get(conversation_id).await?;
        if conversation.is_group() {
            return Ok(online_status);
        }

        for member in self.active_members(conversation_id).await? {
            if member.user_id == user_id {
                continue;
            }
            let online = self.cache.is_online(member.user_id).await.unwrap_or(false);
            online_status.insert(member.user_id.to_string(), online);
        }
        Ok(online_status)
    }
}

#[derive(sqlx::FromRow)]
struct ListRow {
    #[sqlx(flatten)]
    conversation: Conversation,
    my_unread_count: i32,
}
