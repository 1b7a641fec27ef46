//! WebSocket connection management for the WorkChat messaging core
//!
//! The `Hub` owns the `user -> device -> session` registry and performs all
//! fan-out: local enqueue onto per-session buffers plus cross-replica
//! pub/sub. Network I/O never happens under the registry lock; target sets
//! are snapshotted first and iterated after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::cache::{Cache, BROADCAST_CHANNEL};
use crate::models::{BroadcastEnvelope, Notification, ServerFrame};
use crate::settings::{SettingsRegistry, ENABLE_ONLINE_STATUS};

pub const SESSION_BUFFER_CAPACITY: usize = 1024;

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbound buffer is full; the session is considered faulty.
    Full,
    Closed,
}

/// One live connection bound to an authenticated user and device.
///
/// Owns a bounded outbound FIFO drained by a dedicated writer task; the
/// reader task and the hub only ever enqueue. Closing is idempotent.
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    tx: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    close_reason: Mutex<Option<String>>,
    current_conversation: Mutex<Option<Uuid>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(user_id: Uuid) -> (Arc<Self>, SessionTasks) {
        Self::with_capacity(user_id, SESSION_BUFFER_CAPACITY)
    }

    pub fn with_capacity(user_id: Uuid, capacity: usize) -> (Arc<Self>, SessionTasks) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            tx,
            shutdown,
            close_reason: Mutex::new(None),
            current_conversation: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        (session, SessionTasks { rx, shutdown_rx })
    }

    /// Non-blocking enqueue of a pre-serialized frame.
    pub fn enqueue(&self, frame: String) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn enqueue_frame(&self, frame: &ServerFrame) -> Result<(), EnqueueError> {
        self.enqueue(frame.to_json())
    }

    /// Signals the writer to drain remaining frames and close the socket.
    /// Only the first call takes effect.
    pub fn close(&self, reason: Option<String>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            *self.close_reason.lock().unwrap() = reason;
            let _ = self.shutdown.send(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn take_close_reason(&self) -> Option<String> {
        self.close_reason.lock().unwrap().take()
    }

    pub fn set_current_conversation(&self, conversation_id: Option<Uuid>) {
        *self.current_conversation.lock().unwrap() = conversation_id;
    }

    pub fn is_viewing(&self, conversation_id: Uuid) -> bool {
        *self.current_conversation.lock().unwrap() == Some(conversation_id)
    }
}

/// Receiver halves handed to the writer task.
pub struct SessionTasks {
    pub rx: mpsc::Receiver<String>,
    pub shutdown_rx: watch::Receiver<bool>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
pub struct TooManyDevices {
    pub limit: usize,
}

/// The in-memory `user -> device -> session` map, guarded by one
/// read/write lock. No I/O happens while the lock is held.
pub struct Registry {
    users: RwLock<HashMap<Uuid, HashMap<Uuid, Arc<Session>>>>,
    max_devices_per_user: usize,
}

impl Registry {
    pub fn new(max_devices_per_user: usize) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            max_devices_per_user,
        }
    }

    /// Inserts the session; reports whether it is the user's first device.
    pub fn insert(&self, session: Arc<Session>) -> Result<bool, TooManyDevices> {
        let mut users = self.users.write().unwrap();
        let devices = users.entry(session.user_id).or_default();
        if devices.len() >= self.max_devices_per_user {
            return Err(TooManyDevices {
                limit: self.max_devices_per_user,
            });
        }
        devices.insert(session.id, session);
        Ok(devices.len() == 1)
    }

    /// Removes the session; reports whether the user has no devices left.
    /// Returns `None` when the session was not registered.
    pub fn remove(&self, session: &Session) -> Option<bool> {
        let mut users = self.users.write().unwrap();
        let devices = users.get_mut(&session.user_id)?;
        devices.remove(&session.id)?;
        if devices.is_empty() {
            users.remove(&session.user_id);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Copies the user's session handles so callers can enqueue outside the
    /// lock.
    pub fn snapshot(&self, user_id: Uuid) -> Vec<Arc<Session>> {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .map(|devices| !devices.is_empty())
            .unwrap_or(false)
    }

    /// True when any device of the user currently has the conversation open.
    pub fn is_viewing(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let users = self.users.read().unwrap();
        match users.get(&user_id) {
            Some(devices) => devices.values().any(|s| s.is_viewing(conversation_id)),
            None => false,
        }
    }

    pub fn online_user_count(&self) -> usize {
        self.users.read().unwrap().len()
    }
}

// ============================================================================
// Hub
// ============================================================================

pub struct Hub {
    registry: Registry,
    pod_id: Uuid,
    cache: Cache,
    settings: Arc<SettingsRegistry>,
    pool: PgPool,
    presence_tx: mpsc::UnboundedSender<(Uuid, bool)>,
    presence_rx: Mutex<Option<mpsc::UnboundedReceiver<(Uuid, bool)>>>,
}

impl Hub {
    pub fn new(
        pool: PgPool,
        cache: Cache,
        settings: Arc<SettingsRegistry>,
        max_devices_per_user: usize,
    ) -> Arc<Self> {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry: Registry::new(max_devices_per_user),
            pod_id: Uuid::new_v4(),
            cache,
            settings,
            pool,
            presence_tx,
            presence_rx: Mutex::new(Some(presence_rx)),
        })
    }

    pub fn pod_id(&self) -> Uuid {
        self.pod_id
    }

    /// Spawns the cross-replica subscriber and the presence announcer.
    pub fn spawn_background_tasks(self: Arc<Self>) {
        let subscriber = Arc::clone(&self);
        tokio::spawn(async move { subscriber.run_pubsub().await });

        if let Some(rx) = self.presence_rx.lock().unwrap().take() {
            let announcer = Arc::clone(&self);
            tokio::spawn(async move { announcer.run_presence_announcer(rx).await });
        }
    }

    /// Registers a new session, enforcing the per-user device cap. On the
    /// first device the presence key is written and an online announcement
    /// is queued.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), TooManyDevices> {
        let user_id = session.user_id;
        let first_device = self.registry.insert(session)?;

        if self.settings.is_enabled(ENABLE_ONLINE_STATUS) {
            if let Err(e) = self.cache.mark_online(user_id).await {
                tracing::warn!("Failed to mark user {} online: {}", user_id, e);
            }
            if first_device {
                let _ = self.presence_tx.send((user_id, true));
            }
        }

        tracing::info!(
            "User {} connected, total users online: {}",
            user_id,
            self.registry.online_user_count()
        );
        Ok(())
    }

    /// Removes a session and closes its outbound buffer. When the last
    /// device disconnects, presence is cleared and an offline announcement
    /// queued.
    pub async fn unregister(&self, session: &Arc<Session>) {
        let user_id = session.user_id;
        let was_last = self.registry.remove(session);

        if was_last == Some(true) && self.settings.is_enabled(ENABLE_ONLINE_STATUS) {
            if let Err(e) = self.cache.clear_online(user_id).await {
                tracing::warn!("Failed to clear presence for {}: {}", user_id, e);
            }
            let _ = self.presence_tx.send((user_id, false));
        }

        session.close(None);

        if was_last.is_some() {
            tracing::info!(
                "User {} disconnected, total users online: {}",
                user_id,
                self.registry.online_user_count()
            );
        }
    }

    /// Enqueues the frame on every local device of the user. Devices whose
    /// buffer is full are forcibly unregistered.
    pub async fn send_local(&self, user_id: Uuid, frame: &str) -> bool {
        let sessions = self.registry.snapshot(user_id);
        if sessions.is_empty() {
            return false;
        }

        let mut sent_to_any = false;
        let mut faulty = Vec::new();
        for session in sessions {
            match session.enqueue(frame.to_string()) {
                Ok(()) => sent_to_any = true,
                Err(EnqueueError::Full) => {
                    tracing::error!(
                        "Send buffer full: user={}, session={}, closing connection",
                        user_id,
                        session.id
                    );
                    faulty.push(session);
                }
                Err(EnqueueError::Closed) => {}
            }
        }
        for session in faulty {
            self.unregister(&session).await;
        }

        sent_to_any
    }

    /// Local fan-out plus cross-replica publish. A publish failure is logged
    /// and swallowed; the message is already durable in the database.
    pub async fn broadcast(&self, user_id: Uuid, frame: &str) {
        self.send_local(user_id, frame).await;

        let envelope = BroadcastEnvelope {
            user_id,
            pod_id: self.pod_id,
            payload: frame.to_string(),
        };
        match serde_json::to_string(&envelope) {
            Ok(payload) => {
                if let Err(e) = self.cache.publish(BROADCAST_CHANNEL, &payload).await {
                    tracing::error!("Failed to publish broadcast: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to encode broadcast envelope: {}", e),
        }
    }

    pub async fn broadcast_frame(&self, user_id: Uuid, frame: &ServerFrame) {
        self.broadcast(user_id, &frame.to_json()).await;
    }

    pub fn is_user_online(&self, user_id: Uuid) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn is_user_viewing(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        self.registry.is_viewing(user_id, conversation_id)
    }

    /// Refreshes a client's notification badge after bulk reads or deletes.
    pub async fn send_notification_update(
        &self,
        user_id: Uuid,
        unread_count: i32,
        latest_notif_time: Option<DateTime<Utc>>,
    ) {
        let frame = ServerFrame::NotificationUpdate {
            unread_count,
            latest_notif_time,
        };
        self.broadcast_frame(user_id, &frame).await;
    }

    /// Clears presence and disconnects every device of the user (logout).
    pub async fn force_offline(&self, user_id: Uuid) {
        if self.settings.is_enabled(ENABLE_ONLINE_STATUS) {
            if let Err(e) = self.cache.clear_online(user_id).await {
                tracing::warn!("Failed to clear presence for {}: {}", user_id, e);
            }
        }

        for session in self.registry.snapshot(user_id) {
            self.unregister(&session).await;
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn run_pubsub(self: Arc<Self>) {
        loop {
            match self.subscribe_loop().await {
                Ok(()) => return, // channel closed deliberately
                Err(e) => {
                    tracing::error!("Pub/sub subscriber failed: {}, reconnecting", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn subscribe_loop(&self) -> crate::error::Result<()> {
        let mut pubsub = self.cache.pubsub().await?;
        pubsub.subscribe(BROADCAST_CHANNEL).await?;
        tracing::info!("Pod {} subscribed to {}", self.pod_id, BROADCAST_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Unreadable broadcast payload: {}", e);
                    continue;
                }
            };
            let envelope: BroadcastEnvelope = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(e) => {
                    tracing::error!("Invalid broadcast envelope: {}", e);
                    continue;
                }
            };
            // Our own publishes come back on the channel; drop them.
            if envelope.pod_id == self.pod_id {
                continue;
            }
            self.send_local(envelope.user_id, &envelope.payload).await;
        }
        Ok(())
    }

    async fn run_presence_announcer(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(Uuid, bool)>) {
        while let Some((user_id, is_online)) = rx.recv().await {
            if let Err(e) = self.announce_online_status(user_id, is_online).await {
                tracing::error!("Online status announcement failed for {}: {}", user_id, e);
            }
        }
    }

    /// Pushes `online_status_update` to the other participant of every
    /// private conversation the user belongs to.
    async fn announce_online_status(&self, user_id: Uuid, is_online: bool) -> crate::error::Result<()> {
        let peers: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT cm2.user_id
            FROM conversation_members cm1
            INNER JOIN conversation_members cm2
                ON cm1.conversation_id = cm2.conversation_id
                AND cm2.user_id != $1
                AND cm2.left_at IS NULL
            INNER JOIN conversations c
                ON c.id = cm1.conversation_id
                AND c.conversation_type = 'private'
            WHERE cm1.user_id = $1 AND cm1.left_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let frame = ServerFrame::OnlineStatusUpdate { user_id, is_online }.to_json();
        for (peer,) in peers {
            self.broadcast(peer, &frame).await;
        }
        Ok(())
    }
}

// ============================================================================
// Capability interfaces
// ============================================================================

/// Viewing/online checks consulted by the send pipeline.
pub trait OnlineChecker: Send + Sync {
    fn is_online(&self, user_id: Uuid) -> bool;
    fn is_viewing(&self, user_id: Uuid, conversation_id: Uuid) -> bool;
}

#[async_trait]
pub trait UnreadNotifier: Send + Sync {
    async fn send_unread_count_update(&self, user_id: Uuid, conversation_id: Uuid, unread_count: i32);
}

#[async_trait]
pub trait ConversationUpdateNotifier: Send + Sync {
    async fn send_conversation_update(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        last_message_time: Option<DateTime<Utc>>,
        last_message_text: Option<String>,
        unread_count: i32,
    );
}

/// Online-only notification push used by the notification bridge.
#[async_trait]
pub trait HubNotifier: Send + Sync {
    fn is_user_online(&self, user_id: Uuid) -> bool;
    async fn push_notification(&self, user_id: Uuid, notification: &Notification);
}

impl OnlineChecker for Hub {
    fn is_online(&self, user_id: Uuid) -> bool {
        self.is_user_online(user_id)
    }

    fn is_viewing(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        self.is_user_viewing(user_id, conversation_id)
    }
}

#[async_trait]
impl UnreadNotifier for Hub {
    async fn send_unread_count_update(&self, user_id: Uuid, conversation_id: Uuid, unread_count: i32) {
        let frame = ServerFrame::UnreadCountUpdate {
            conversation_id,
            unread_count,
        };
        self.broadcast_frame(user_id, &frame).await;
    }
}

#[async_trait]
impl ConversationUpdateNotifier for Hub {
    async fn send_conversation_update(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        last_message_time: Option<DateTime<Utc>>,
        last_message_text: Option<String>,
        unread_count: i32,
    ) {
        let frame = ServerFrame::ConversationUpdate {
            conversation_id,
            last_message_time,
            last_message_text,
            unread_count,
        };
        self.broadcast_frame(user_id, &frame).await;
    }
}

#[async_trait]
impl HubNotifier for Hub {
    fn is_user_online(&self, user_id: Uuid) -> bool {
        Hub::is_user_online(self, user_id)
    }

    async fn push_notification(&self, user_id: Uuid, notification: &Notification) {
        let frame = ServerFrame::Notification(notification.clone());
        self.broadcast_frame(user_id, &frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_multi_device_lifecycle() {
        let registry = Registry::new(18);
        let user = Uuid::new_v4();

        let (first, _t1) = Session::new(user);
        assert_eq!(registry.insert(first.clone()).unwrap(), true);
        assert!(registry.is_online(user));

        let (second, _t2) = Session::new(user);
        assert_eq!(registry.insert(second.clone()).unwrap(), false);
        assert_eq!(registry.snapshot(user).len(), 2);

        assert_eq!(registry.remove(&first), Some(false));
        assert!(registry.is_online(user));
        assert_eq!(registry.remove(&second), Some(true));
        assert!(!registry.is_online(user));

        // Removing again is a no-op.
        assert_eq!(registry.remove(&second), None);
    }

    #[test]
    fn test_registry_rejects_device_over_cap() {
        let registry = Registry::new(2);
        let user = Uuid::new_v4();
        let mut tasks = Vec::new();

        for _ in 0..2 {
            let (session, t) = Session::new(user);
            tasks.push(t);
            registry.insert(session).unwrap();
        }

        let (extra, _t) = Session::new(user);
        let err = registry.insert(extra).unwrap_err();
        assert_eq!(err.limit, 2);
        assert_eq!(registry.snapshot(user).len(), 2);
    }

    #[test]
    fn test_registry_viewing_is_per_device() {
        let registry = Registry::new(18);
        let user = Uuid::new_v4();
        let conversation = Uuid::new_v4();

        let (a, _ta) = Session::new(user);
        let (b, _tb) = Session::new(user);
        registry.insert(a.clone()).unwrap();
        registry.insert(b).unwrap();

        assert!(!registry.is_viewing(user, conversation));
        a.set_current_conversation(Some(conversation));
        assert!(registry.is_viewing(user, conversation));
        a.set_current_conversation(None);
        assert!(!registry.is_viewing(user, conversation));
    }

    #[tokio::test]
    async fn test_session_preserves_enqueue_order() {
        let (session, mut tasks) = Session::new(Uuid::new_v4());
        session.enqueue("one".to_string()).unwrap();
        session.enqueue("two".to_string()).unwrap();
        session.enqueue("three".to_string()).unwrap();

        assert_eq!(tasks.rx.recv().await.unwrap(), "one");
        assert_eq!(tasks.rx.recv().await.unwrap(), "two");
        assert_eq!(tasks.rx.recv().await.unwrap(), "three");
    }

    #[tokio::test]
    async fn test_session_full_buffer_reports_fault() {
        let (session, _tasks) = Session::with_capacity(Uuid::new_v4(), 2);
        session.enqueue("a".to_string()).unwrap();
        session.enqueue("b".to_string()).unwrap();
        assert_eq!(session.enqueue("c".to_string()), Err(EnqueueError::Full));
    }

    #[tokio::test]
    async fn test_session_close_is_idempotent() {
        let (session, mut tasks) = Session::new(Uuid::new_v4());
        session.close(Some("first".to_string()));
        session.close(Some("second".to_string()));

        assert!(session.is_closed());
        assert_eq!(session.take_close_reason(), Some("first".to_string()));
        assert_eq!(
            session.enqueue("late".to_string()),
            Err(EnqueueError::Closed)
        );
        assert!(*tasks.shutdown_rx.borrow_and_update());
    }
}
