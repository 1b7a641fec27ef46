//! Postgres bootstrap for the WorkChat messaging core

use sqlx::{postgres::PgPoolOptions, Executor, PgPool};

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

async fn initialize_schema(pool: &PgPool) -> anyhow::Result<()> {
    // Plain-text execute: the DDL batch runs over the simple query protocol,
    // which permits multiple statements.
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            conversation_type VARCHAR(20) NOT NULL,
            group_name VARCHAR(100),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_message_at TIMESTAMPTZ,
            last_message_id UUID
        );

        CREATE TABLE IF NOT EXISTS conversation_members (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            conversation_id UUID NOT NULL REFERENCES conversations(id),
            user_id UUID NOT NULL,
            role VARCHAR(20) NOT NULL DEFAULT 'member',
            is_muted BOOLEAN NOT NULL DEFAULT FALSE,
            is_hidden BOOLEAN NOT NULL DEFAULT FALSE,
            joined_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            left_at TIMESTAMPTZ,
            unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
            last_read_message_id UUID,
            last_read_at TIMESTAMPTZ
        );

        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            conversation_id UUID NOT NULL REFERENCES conversations(id),
            sender_id UUID NOT NULL,
            message_type VARCHAR(20) NOT NULL,
            content TEXT,
            metadata JSONB,
            status VARCHAR(20) NOT NULL DEFAULT 'sent',
            reply_to_message_id UUID,
            is_recalled BOOLEAN NOT NULL DEFAULT FALSE,
            recalled_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE TABLE IF NOT EXISTS user_relationships (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID NOT NULL,
            target_user_id UUID NOT NULL,
            relationship_type VARCHAR(20) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (user_id, target_user_id, relationship_type)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID NOT NULL,
            notification_type VARCHAR(30) NOT NULL,
            title VARCHAR(200) NOT NULL,
            content TEXT,
            metadata JSONB,
            is_read BOOLEAN NOT NULL DEFAULT FALSE,
            read_at TIMESTAMPTZ,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            expires_at TIMESTAMPTZ
        );

        CREATE TABLE IF NOT EXISTS notification_templates (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            template_type VARCHAR(50) NOT NULL UNIQUE,
            title VARCHAR(200) NOT NULL,
            content_template TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            enable_push BOOLEAN NOT NULL DEFAULT TRUE,
            enable_websocket BOOLEAN NOT NULL DEFAULT TRUE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS system_settings (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            setting_key VARCHAR(100) NOT NULL UNIQUE,
            setting_value VARCHAR(200) NOT NULL,
            description TEXT,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
            ON messages(conversation_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id);
        CREATE INDEX IF NOT EXISTS idx_messages_content_fts
            ON messages USING GIN (to_tsvector('simple', content))
            WHERE NOT is_recalled AND content IS NOT NULL;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_members_active_unique
            ON conversation_members(conversation_id, user_id)
            WHERE left_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_members_user_active
            ON conversation_members(user_id)
            WHERE left_at IS NULL;

        CREATE INDEX IF NOT EXISTS idx_relationships_target
            ON user_relationships(target_user_id, relationship_type);

        CREATE INDEX IF NOT EXISTS idx_notifications_user_created
            ON notifications(user_id, created_at DESC);
        "#,
    )
    .await?;

    Ok(())
}
