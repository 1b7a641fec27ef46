//! Configuration for the WorkChat messaging core

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
    pub db: i64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub ws_token_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_video_size_mb: i64,
    pub max_devices_per_user: usize,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub base_url: String,
}

impl Config {
    /// Builds the configuration from environment variables, falling back to
    /// development defaults for everything except the secrets.
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            server: ServerConfig {
                port: env_parsed("PORT", 8080),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_parsed("DATABASE_MAX_CONNECTIONS", 100),
            },
            redis: RedisConfig {
                url: env_or("REDIS_URL", "redis://localhost:6379"),
                password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
                db: env_parsed("REDIS_DB", 0),
            },
            auth: AuthConfig {
                jwt_secret,
                ws_token_ttl_secs: env_parsed("WS_TOKEN_TTL", 300),
            },
            limits: LimitsConfig {
                max_video_size_mb: env_parsed("MAX_VIDEO_SIZE_MB", 5),
                max_devices_per_user: env_parsed("MAX_DEVICES_PER_USER", 18),
            },
            agent: AgentConfig {
                base_url: env_or("AGENT_URL", "http://localhost:8082"),
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parsed_falls_back_on_garbage() {
        std::env::set_var("WORKCHAT_TEST_PORT", "not-a-number");
        let port: u16 = env_parsed("WORKCHAT_TEST_PORT", 9000);
        assert_eq!(port, 9000);
        std::env::remove_var("WORKCHAT_TEST_PORT");
    }
}
