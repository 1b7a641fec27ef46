//! Notification templates

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{CreateTemplateRequest, NotificationTemplate, UpdateTemplateRequest};

pub struct TemplateService {
    pool: PgPool,
}

impl TemplateService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Active template for the given type.
    pub async fn get(&self, template_type: &str) -> Result<NotificationTemplate> {
        sqlx::query_as(
            "SELECT * FROM notification_templates WHERE template_type = $1 AND is_active = TRUE",
        )
        .bind(template_type)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("template not found: {}", template_type)))
    }

    pub async fn list(&self) -> Result<Vec<NotificationTemplate>> {
        let rows = sqlx::query_as("SELECT * FROM notification_templates ORDER BY template_type ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn create(&self, req: &CreateTemplateRequest) -> Result<NotificationTemplate> {
        let template = sqlx::query_as(
            r#"
            INSERT INTO notification_templates
                (template_type, title, content_template, priority, enable_push,
                 enable_websocket, is_active, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (template_type) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&req.template_type)
        .bind(&req.title)
        .bind(&req.content_template)
        .bind(req.priority)
        .bind(req.enable_push)
        .bind(req.enable_websocket)
        .bind(req.is_active)
        .bind(&req.description)
        .fetch_optional(&self.pool)
        .await?;

        template.ok_or_else(|| {
            AppError::Conflict(format!("template already exists: {}", req.template_type))
        })
    }

    pub async fn update(&self, id: Uuid, req: &UpdateTemplateRequest) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_templates SET
                title = COALESCE($2, title),
                content_template = COALESCE($3, content_template),
                priority = COALESCE($4, priority),
                enable_push = COALESCE($5, enable_push),
                enable_websocket = COALESCE($6, enable_websocket),
                is_active = COALESCE($7, is_active),
                description = COALESCE($8, description),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&req.title)
        .bind(&req.content_template)
        .bind(req.priority)
        .bind(req.enable_push)
        .bind(req.enable_websocket)
        .bind(req.is_active)
        .bind(&req.description)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("template not found".to_string()));
        }
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM notification_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("template not found".to_string()));
        }
        Ok(())
    }

    /// Seeds the built-in templates; existing rows are left untouched.
    pub async fn init_defaults(&self) -> Result<()> {
        let defaults: [(&str, &str, Option<&str>, i32, &str); 3] = [
            (
                "new_message",
                "New Message",
                Some("{{sender_name}}: {{content}}"),
                0,
                "Direct message notification",
            ),
            (
                "new_group_message",
                "New Group Message",
                Some("{{sender_name}} in {{group_name}}: {{content}}"),
                0,
                "Group message notification",
            ),
            (
                "system",
                "System Notification",
                Some("{{content}}"),
                1,
                "System announcement",
            ),
        ];

        for (template_type, title, content, priority, description) in defaults {
            sqlx::query(
                r#"
                INSERT INTO notification_templates
                    (template_type, title, content_template, priority, description)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (template_type) DO NOTHING
                "#,
            )
            .bind(template_type)
            .bind(title)
            .bind(content)
            .bind(priority)
            .bind(description)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

/// Substitutes `{{var}}` placeholders; unknown placeholders are left as-is.
pub fn render_template(template: &str, vars: &std::collections::HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_render_substitutes_vars() {
        let mut vars = HashMap::new();
        vars.insert("sender_name".to_string(), "Alice".to_string());
        vars.insert("content".to_string(), "hi there".to_string());
        assert_eq!(
            render_template("{{sender_name}}: {{content}}", &vars),
            "Alice: hi there"
        );
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let vars = HashMap::new();
        assert_eq!(render_template("hello {{who}}", &vars), "hello {{who}}");
    }

    #[test]
    fn test_render_repeated_placeholder() {
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), "y".to_string());
        assert_eq!(render_template("{{x}}{{x}}", &vars), "yy");
    }
}
