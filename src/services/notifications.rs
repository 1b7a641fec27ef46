//! Notification bridge
//!
//! Persists notifications and pushes them over WebSocket to online
//! recipients only. Chat messages never create notifications; this bridge
//! serves system events and admin batch sends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::Notification;
use crate::services::templates::{render_template, TemplateService};
use crate::websocket::HubNotifier;

pub struct NotificationService {
    pool: PgPool,
    templates: Arc<TemplateService>,
    hub: Arc<dyn HubNotifier>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationSummary {
    pub unread_count: i32,
    pub latest_notif_time: Option<DateTime<Utc>>,
}

impl NotificationService {
    pub fn new(pool: PgPool, templates: Arc<TemplateService>, hub: Arc<dyn HubNotifier>) -> Self {
        Self {
            pool,
            templates,
            hub,
        }
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        notification_type: &str,
        title: &str,
        content: Option<&str>,
        metadata: Option<&Value>,
        priority: i32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Notification> {
        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (user_id, notification_type, title, content, metadata, priority, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(notification_type)
        .bind(title)
        .bind(content)
        .bind(metadata.cloned())
        .bind(priority)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        if self.hub.is_user_online(user_id) {
            self.hub.push_notification(user_id, &notification).await;
        }

        Ok(notification)
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1
              AND (expires_at IS NULL OR expires_at > NOW())
              AND (NOT $2 OR is_read = FALSE)
            ORDER BY priority DESC, created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(unread_only)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Returns the notification and marks it read as a side effect. A failed
    /// mark does not fail the read.
    pub async fn detail(&self, user_id: Uuid, notification_id: Uuid) -> Result<Notification> {
        let mut notification: Notification =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1 AND user_id = $2")
                .bind(notification_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| AppError::NotFound("notification not found".to_string()))?;

        if !notification.is_read {
            let now = Utc::now();
            let marked = sqlx::query(
                "UPDATE notifications SET is_read = TRUE, read_at = $2 WHERE id = $1",
            )
            .bind(notification_id)
            .bind(now)
            .execute(&self.pool)
            .await;

            match marked {
                Ok(_) => {
                    notification.is_read = true;
                    notification.read_at = Some(now);
                }
                Err(e) => tracing::warn!("Failed to mark notification read: {}", e),
            }
        }

        Ok(notification)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET is_read = TRUE, read_at = NOW()
             WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, user_id: Uuid, notification_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(notification_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("notification not found".to_string()));
        }
        Ok(())
    }

    pub async fn summary(&self, user_id: Uuid) -> Result<NotificationSummary> {
        let (unread_count, latest_notif_time): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE is_read = FALSE), MAX(created_at)
            FROM notifications
            WHERE user_id = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(NotificationSummary {
            unread_count: unread_count as i32,
            latest_notif_time,
        })
    }

    /// Most recent unread notification, replayed to a freshly connected
    /// session.
    pub async fn latest_unread(&self, user_id: Uuid) -> Result<Option<Notification>> {
        let notification = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1 AND is_read = FALSE
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(notification)
    }

    /// Renders the template once and creates one notification per recipient.
    /// Returns the number of rows written; per-user failures are logged and
    /// skipped.
    pub async fn batch_send_with_template(
        &self,
        user_ids: &[Uuid],
        template_type: &str,
        template_vars: &HashMap<String, String>,
        metadata: Option<&Value>,
    ) -> Result<usize> {
        if user_ids.is_empty() {
            return Err(AppError::InvalidArgument(
                "user_ids must not be empty".to_string(),
            ));
        }

        let template = self.templates.get(template_type).await?;
        let title = render_template(&template.title, template_vars);
        let content = template
            .content_template
            .as_deref()
            .map(|t| render_template(t, template_vars));

        let mut success_count = 0;
        for &user_id in user_ids {
            let inserted: std::result::Result<Notification, sqlx::Error> = sqlx::query_as(
                r#"
                INSERT INTO notifications
                    (user_id, notification_type, title, content, metadata, priority)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
            )
            .bind(user_id)
            .bind(template_type)
            .bind(&title)
            .bind(&content)
            .bind(metadata.cloned())
            .bind(template.priority)
            .fetch_one(&self.pool)
            .await;

            let notification = match inserted {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Failed to create notification for {}: {}", user_id, e);
                    continue;
                }
            };
            success_count += 1;

            if template.enable_websocket && self.hub.is_user_online(user_id) {
                self.hub.push_notification(user_id, &notification).await;
            }
        }

        Ok(success_count)
    }
}
