//! User relationships (blocking)

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::UserRelationship;

const BLOCKED: &str = "blocked";

pub struct RelationshipService {
    pool: PgPool,
}

impl RelationshipService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn block_user(&self, user_id: Uuid, target_user_id: Uuid) -> Result<()> {
        if user_id == target_user_id {
            return Err(AppError::InvalidArgument(
                "cannot block yourself".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO user_relationships (user_id, target_user_id, relationship_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, target_user_id, relationship_type) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(target_user_id)
        .bind(BLOCKED)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict("user already blocked".to_string()));
        }
        Ok(())
    }

    pub async fn unblock_user(&self, user_id: Uuid, target_user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM user_relationships
             WHERE user_id = $1 AND target_user_id = $2 AND relationship_type = $3",
        )
        .bind(user_id)
        .bind(target_user_id)
        .bind(BLOCKED)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("user not blocked".to_string()));
        }
        Ok(())
    }

    pub async fn blocked_users(&self, user_id: Uuid) -> Result<Vec<UserRelationship>> {
        let rows = sqlx::query_as(
            "SELECT * FROM user_relationships
             WHERE user_id = $1 AND relationship_type = $2
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(BLOCKED)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// True when `owner` has blocked `target`.
    pub async fn is_blocked(&self, owner: Uuid, target: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_relationships
             WHERE user_id = $1 AND target_user_id = $2 AND relationship_type = $3",
        )
        .bind(owner)
        .bind(target)
        .bind(BLOCKED)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
