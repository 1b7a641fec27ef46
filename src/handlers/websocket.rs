//! WebSocket endpoint: upgrade, session tasks and ingress dispatch
//!
//! Each connection runs exactly two tasks: a reader with a 60-second idle
//! deadline and a writer that drains the session buffer under a 10-second
//! write deadline, pinging every 54 seconds.

use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval_at, timeout, Instant};
use uuid::Uuid;

use crate::{
    auth::validate_token,
    error::AppError,
    models::{
        ClientEnvelope, MessageFrame, ReadPayload, RecallPayload, SendMessageRequest, ServerFrame,
        SetCurrentConversationPayload, TypingPayload,
    },
    settings::{ENABLE_ONLINE_STATUS, ENABLE_READ_RECEIPT, ENABLE_TYPING_INDICATOR},
    websocket::{Session, SessionTasks},
    AppState,
};

const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(54);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let token = match query.token {
        Some(token) if !token.is_empty() => token,
        _ => return AppError::Unauthorized("missing token".to_string()).into_response(),
    };

    let user_id = match validate_token(&token, &state.config.auth.jwt_secret) {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (ws_sender, ws_receiver) = socket.split();

    let (session, tasks) = Session::new(user_id);
    let writer = tokio::spawn(run_writer(ws_sender, tasks, session.clone()));

    if let Err(rejection) = state.hub.register(session.clone()).await {
        tracing::error!(
            "User {} exceeds max devices ({}), rejecting session {}",
            user_id,
            rejection.limit,
            session.id
        );
        let reason = format!("Maximum {} devices allowed", rejection.limit);
        let _ = session.enqueue_frame(&ServerFrame::Error {
            code: Some("too_many_devices".to_string()),
            message: reason.clone(),
        });
        session.close(Some(reason));
        let _ = writer.await;
        return;
    }

    // Replay queued messages without delaying the read loop.
    {
        let state = state.clone();
        let session = session.clone();
        tokio::spawn(async move { replay_offline(state, session).await });
    }

    read_loop(ws_receiver, &state, &session).await;

    state.hub.unregister(&session).await;
    let _ = writer.await;
}

/// Drains the session buffer onto the socket. `biased` ordering guarantees
/// frames enqueued before a close are written before the close frame.
async fn run_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut tasks: SessionTasks,
    session: std::sync::Arc<Session>,
) {
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            biased;

            maybe_frame = tasks.rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                match timeout(WRITE_TIMEOUT, sender.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }

            _ = tasks.shutdown_rx.changed() => {
                let reason = session.take_close_reason().unwrap_or_default();
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                }));
                let _ = timeout(WRITE_TIMEOUT, sender.send(close)).await;
                break;
            }

            _ = ping.tick() => {
                match timeout(WRITE_TIMEOUT, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}

async fn read_loop(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
    session: &std::sync::Arc<Session>,
) {
    loop {
        let next = match timeout(READ_IDLE_TIMEOUT, receiver.next()).await {
            Err(_) => {
                tracing::info!("Session {} idle timeout", session.id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!("WebSocket read error for user {}: {}", session.user_id, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match next {
            Message::Text(text) => dispatch(state, session, &text).await,
            // Pings are answered by the library; both directions refresh the
            // idle deadline simply by arriving.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {}
            Message::Close(_) => break,
        }
    }
}

/// Routes one inbound frame. Unknown types are ignored; malformed JSON is
/// answered with an `error` frame and the connection stays open.
async fn dispatch(state: &AppState, session: &std::sync::Arc<Session>, text: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Invalid frame from user {}: {}", session.user_id, e);
            send_error(session, "Invalid JSON format");
            return;
        }
    };

    match envelope.frame_type.as_str() {
        "heartbeat" => {
            if state.settings.is_enabled(ENABLE_ONLINE_STATUS) {
                if let Err(e) = state.cache.mark_online(session.user_id).await {
                    tracing::warn!("Heartbeat presence refresh failed: {}", e);
                }
            }
        }
        "message" => handle_send(state, session, envelope.data).await,
        "typing" => handle_typing(state, session, envelope.data).await,
        "read" => handle_read(state, session, envelope.data).await,
        "recall" => handle_recall(state, session, envelope.data).await,
        "set_current_conversation" => handle_set_current(session, envelope.data),
        _ => {}
    }
}

async fn handle_send(state: &AppState, session: &std::sync::Arc<Session>, data: serde_json::Value) {
    let req: SendMessageRequest = match serde_json::from_value(data) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!("Invalid message payload: {}", e);
            send_error(session, "Invalid message format");
            return;
        }
    };

    let message = match state.messages.send(session.user_id, &req).await {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("Failed to send message: {}", e);
            send_error(session, &e.client_message());
            return;
        }
    };

    // Every member, sender included, receives the message frame with their
    // own send verdict attached.
    let member_ids = state
        .messages
        .member_ids(message.conversation_id)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to get conversation members: {}", e);
            Vec::new()
        });

    for member_id in member_ids {
        let can_send = state.messages.can_send(member_id, message.conversation_id).await;
        let frame = ServerFrame::Message(MessageFrame::from_message(&message, can_send));
        state.hub.broadcast_frame(member_id, &frame).await;
    }
}

async fn handle_typing(state: &AppState, session: &std::sync::Arc<Session>, data: serde_json::Value) {
    if !state.settings.is_enabled(ENABLE_TYPING_INDICATOR) {
        return;
    }
    let Ok(payload) = serde_json::from_value::<TypingPayload>(data) else {
        return;
    };

    let frame = ServerFrame::Typing {
        conversation_id: payload.conversation_id,
        user_id: session.user_id,
    };
    let member_ids = state
        .messages
        .member_ids(payload.conversation_id)
        .await
        .unwrap_or_default();
    for member_id in member_ids {
        if member_id != session.user_id {
            state.hub.broadcast_frame(member_id, &frame).await;
        }
    }
}

async fn handle_read(state: &AppState, session: &std::sync::Arc<Session>, data: serde_json::Value) {
    let payload: ReadPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Invalid read payload: {}", e);
            return;
        }
    };

    // Unread accounting always runs; the peer-facing receipt is a feature.
    let advanced = match state
        .messages
        .mark_read(session.user_id, payload.conversation_id, payload.message_id)
        .await
    {
        Ok(advanced) => advanced,
        Err(e) => {
            tracing::error!("Failed to mark as read: {}", e);
            return;
        }
    };

    if advanced && state.settings.is_enabled(ENABLE_READ_RECEIPT) {
        let frame = ServerFrame::Read {
            conversation_id: payload.conversation_id,
            message_id: payload.message_id,
            reader_id: session.user_id,
        };
        let member_ids = state
            .messages
            .member_ids(payload.conversation_id)
            .await
            .unwrap_or_default();
        for member_id in member_ids {
            if member_id != session.user_id {
                state.hub.broadcast_frame(member_id, &frame).await;
            }
        }
    }
}

async fn handle_recall(state: &AppState, session: &std::sync::Arc<Session>, data: serde_json::Value) {
    let payload: RecallPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Invalid recall payload: {}", e);
            send_error(session, "Invalid recall format");
            return;
        }
    };

    let message = match state.messages.get_message(payload.message_id).await {
        Ok(message) => message,
        Err(_) => {
            send_error(session, "Message not found");
            return;
        }
    };

    if let Err(e) = state.messages.recall(session.user_id, payload.message_id).await {
        tracing::error!("Failed to recall message: {}", e);
        send_error(session, &e.client_message());
        return;
    }

    let frame = ServerFrame::Recalled {
        message_id: payload.message_id,
    };
    let member_ids = state
        .messages
        .member_ids(message.conversation_id)
        .await
        .unwrap_or_default();
    for member_id in member_ids {
        state.hub.broadcast_frame(member_id, &frame).await;
    }
}

fn handle_set_current(session: &std::sync::Arc<Session>, data: serde_json::Value) {
    let payload: SetCurrentConversationPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Invalid set_current_conversation payload: {}", e);
            return;
        }
    };

    match payload.conversation_id.as_deref() {
        None | Some("") => session.set_current_conversation(None),
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(conversation_id) => session.set_current_conversation(Some(conversation_id)),
            Err(e) => tracing::warn!("Invalid conversation_id: {}", e),
        },
    }
}

/// Replays the offline queue onto a freshly registered session, then pushes
/// the most recent unread notification. Enqueue is non-blocking: a full
/// buffer drops the replay frame, which is safe because the message is still
/// in the database.
async fn replay_offline(state: AppState, session: std::sync::Arc<Session>) {
    let entries = match state.cache.drain_offline_messages(session.user_id).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(
                "Failed to read offline messages for {}: {}",
                session.user_id,
                e
            );
            return;
        }
    };

    for entry in entries {
        let decoded: serde_json::Value = match serde_json::from_str(&entry) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Undecodable offline message: {}", e);
                continue;
            }
        };
        if session
            .enqueue_frame(&ServerFrame::OfflineMessage(decoded))
            .is_err()
        {
            tracing::error!(
                "Failed to replay offline message to {}: buffer full",
                session.user_id
            );
        }
    }

    match state.notifications.latest_unread(session.user_id).await {
        Ok(Some(notification)) => {
            if session
                .enqueue_frame(&ServerFrame::Notification(notification))
                .is_err()
            {
                tracing::error!(
                    "Failed to push notification to {}: buffer full",
                    session.user_id
                );
            }
        }
        Ok(None) => {}
        Err(e) => tracing::error!(
            "Failed to load latest notification for {}: {}",
            session.user_id,
            e
        ),
    }
}

fn send_error(session: &std::sync::Arc<Session>, message: &str) {
    if session.enqueue_frame(&ServerFrame::error(message)).is_err() {
        tracing::error!(
            "Failed to send error frame to {}: buffer unavailable",
            session.user_id
        );
    }
}
