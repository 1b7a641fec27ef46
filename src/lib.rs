//! WorkChat Server - Real-time messaging core
//!
//! This service handles:
//! - Long-lived multi-device WebSocket sessions
//! - Message routing between users and groups with unread accounting
//! - Cross-replica fan-out over a shared cache channel
//! - At-least-once offline delivery through a cache-backed queue

pub mod agent;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod settings;
pub mod storage;
pub mod websocket;

use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::Cache;
use crate::config::Config;
use crate::services::conversations::ConversationService;
use crate::services::messages::MessageService;
use crate::services::notifications::NotificationService;
use crate::services::relationships::RelationshipService;
use crate::services::templates::TemplateService;
use crate::settings::SettingsRegistry;
use crate::websocket::Hub;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub cache: Cache,
    pub settings: Arc<SettingsRegistry>,
    pub hub: Arc<Hub>,
    pub conversations: Arc<ConversationService>,
    pub messages: Arc<MessageService>,
    pub notifications: Arc<NotificationService>,
    pub templates: Arc<TemplateService>,
    pub relationships: Arc<RelationshipService>,
}
