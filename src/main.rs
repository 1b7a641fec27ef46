use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workchat_server::{
    agent::UserDataClient,
    cache::Cache,
    config::Config,
    handlers,
    services::{
        conversations::ConversationService, messages::MessageService,
        notifications::NotificationService, relationships::RelationshipService,
        templates::TemplateService,
    },
    settings::SettingsRegistry,
    storage,
    websocket::{ConversationUpdateNotifier, Hub, HubNotifier, OnlineChecker, UnreadNotifier},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "workchat_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = storage::connect(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database connected");

    let cache = Cache::connect(
        &config.redis.url,
        config.redis.password.as_deref(),
        config.redis.db,
    )
    .await?;

    let settings = Arc::new(SettingsRegistry::load(pool.clone()).await?);

    let hub = Hub::new(
        pool.clone(),
        cache.clone(),
        settings.clone(),
        config.limits.max_devices_per_user,
    );

    let agent = UserDataClient::new(config.agent.base_url.clone());
    let conversations = Arc::new(ConversationService::new(
        pool.clone(),
        cache.clone(),
        settings.clone(),
        agent,
    ));
    let messages = Arc::new(MessageService::new(
        pool.clone(),
        cache.clone(),
        settings.clone(),
        conversations.clone(),
        hub.clone() as Arc<dyn OnlineChecker>,
        hub.clone() as Arc<dyn UnreadNotifier>,
        hub.clone() as Arc<dyn ConversationUpdateNotifier>,
        config.limits.max_video_size_mb,
    ));
    let templates = Arc::new(TemplateService::new(pool.clone()));
    let notifications = Arc::new(NotificationService::new(
        pool.clone(),
        templates.clone(),
        hub.clone() as Arc<dyn HubNotifier>,
    ));
    let relationships = Arc::new(RelationshipService::new(pool.clone()));

    if let Err(e) = templates.init_defaults().await {
        tracing::warn!("Failed to init default notification templates: {}", e);
    }

    hub.clone().spawn_background_tasks();

    let state = AppState {
        config: config.clone(),
        pool,
        cache,
        settings,
        hub,
        conversations,
        messages,
        notifications,
        templates,
        relationships,
    };

    let api = Router::new()
        // Conversations
        .route("/conversations", get(handlers::conversations::list))
        .route("/conversations/search", get(handlers::conversations::search))
        .route("/conversations/private", post(handlers::conversations::create_private))
        .route("/conversations/group", post(handlers::conversations::create_group))
        .route("/conversations/:id/messages", get(handlers::conversations::messages))
        .route("/conversations/:id/hide", post(handlers::conversations::hide))
        // Group membership
        .route("/conversations/:id/members", post(handlers::conversations::add_members))
        .route("/conversations/:id/members/remove", post(handlers::conversations::remove_member))
        .route("/conversations/:id/leave", post(handlers::conversations::leave))
        .route("/conversations/:id/members/:user_id/role", post(handlers::conversations::update_role))
        // Messages
        .route("/messages/:id/recall", post(handlers::messages::recall))
        .route("/messages/search", get(handlers::messages::search))
        // Notifications
        .route("/notifications", get(handlers::notifications::list))
        .route("/notifications/read-all", post(handlers::notifications::mark_all_read))
        .route("/notifications/:id", get(handlers::notifications::detail))
        .route("/notifications/:id/delete", post(handlers::notifications::delete))
        // Relationships
        .route("/relationships/block", post(handlers::relationships::block))
        .route("/relationships/unblock", post(handlers::relationships::unblock))
        .route("/relationships/blocked", get(handlers::relationships::blocked))
        // Logout clears presence and disconnects all devices
        .route("/logout", post(handlers::relationships::logout));

    let admin = Router::new()
        .route("/settings", get(handlers::settings::list))
        .route("/settings/reload", post(handlers::settings::reload))
        .route("/settings/:key", post(handlers::settings::update))
        .route(
            "/notification-templates",
            get(handlers::templates::list).post(handlers::templates::create),
        )
        .route(
            "/notification-templates/init-defaults",
            post(handlers::templates::init_defaults),
        )
        .route(
            "/notification-templates/:id",
            post(handlers::templates::update).delete(handlers::templates::delete),
        )
        .route("/notifications/batch-send", post(handlers::notifications::batch_send));

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ws", get(handlers::websocket::websocket_handler))
        .nest("/api/v1", api)
        .nest("/api/admin", admin)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    tracing::info!("workchat-server listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
