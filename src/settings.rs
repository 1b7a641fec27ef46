//! Process-wide feature flags and numeric limits
//!
//! The registry is loaded eagerly at startup and refreshed on demand. Writes
//! go to the `system_settings` table first, then to the in-memory map. Reads
//! never touch the database.

use std::collections::HashMap;
use std::sync::RwLock;

use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::models::SystemSetting;

pub const ENABLE_FIRST_MESSAGE_LIMIT: &str = "enable_first_message_limit";
pub const ENABLE_READ_RECEIPT: &str = "enable_read_receipt";
pub const ENABLE_TYPING_INDICATOR: &str = "enable_typing_indicator";
pub const ENABLE_ONLINE_STATUS: &str = "enable_online_status";
pub const MAX_VIDEO_SIZE_MB: &str = "max_video_size_mb";

pub struct SettingsRegistry {
    pool: PgPool,
    cache: RwLock<HashMap<String, String>>,
}

impl SettingsRegistry {
    pub async fn load(pool: PgPool) -> Result<Self> {
        let registry = Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        };
        registry.reload_all().await?;
        Ok(registry)
    }

    /// Replaces the in-memory map with the current table contents.
    pub async fn reload_all(&self) -> Result<()> {
        let rows: Vec<SystemSetting> = sqlx::query_as("SELECT * FROM system_settings")
            .fetch_all(&self.pool)
            .await?;

        let mut cache = self.cache.write().unwrap();
        cache.clear();
        for row in rows {
            cache.insert(row.setting_key, row.setting_value);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.read().unwrap().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => value == "true",
            None => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.get_bool(key, false)
    }

    /// Persists the value, then updates the cache so subsequent checks see it
    /// immediately.
    pub async fn update(&self, key: &str, value: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE system_settings SET setting_value = $1, updated_at = NOW() WHERE setting_key = $2",
        )
        .bind(value)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("setting key not found: {}", key)));
        }

        self.cache
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.cache.read().unwrap().clone()
    }

    #[cfg(test)]
    pub fn with_entries(pool: PgPool, entries: &[(&str, &str)]) -> Self {
        let cache = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            pool,
            cache: RwLock::new(cache),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(entries: &[(&str, &str)]) -> SettingsRegistry {
        let pool = PgPool::connect_lazy("postgres://localhost/workchat_test").unwrap();
        SettingsRegistry::with_entries(pool, entries)
    }

    #[tokio::test]
    async fn test_bool_parsing() {
        let registry = registry(&[
            (ENABLE_READ_RECEIPT, "true"),
            (ENABLE_TYPING_INDICATOR, "false"),
        ]);
        assert!(registry.is_enabled(ENABLE_READ_RECEIPT));
        assert!(!registry.is_enabled(ENABLE_TYPING_INDICATOR));
        assert!(!registry.is_enabled(ENABLE_ONLINE_STATUS));
        assert!(registry.get_bool(ENABLE_ONLINE_STATUS, true));
    }

    #[tokio::test]
    async fn test_int_parsing_with_fallback() {
        let registry = registry(&[(MAX_VIDEO_SIZE_MB, "25"), ("bad_int", "abc")]);
        assert_eq!(registry.get_int(MAX_VIDEO_SIZE_MB, 5), 25);
        assert_eq!(registry.get_int("bad_int", 5), 5);
        assert_eq!(registry.get_int("missing", 7), 7);
    }
}
