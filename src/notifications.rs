use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::helpers::{decode_all, to_document};
use crate::core::scope::TaskScope;
use crate::models::models::Notification;
use crate::remote::{Backend, Document, DocumentStore, FieldUpdate, Query, Snapshot};
use crate::users::fetch_profile;

/// Actor name used when the liker's profile cannot be read.
pub const UNKNOWN_ACTOR: &str = "Someone";

/// Writes `notification` under a freshly allocated id and mirrors that id
/// into the document's own `id` field.
pub async fn create_notification(
    store: &dyn DocumentStore,
    collection: &str,
    notification: Notification,
) -> SyncResult<String> {
    if notification.recipient_user_id.is_empty() {
        return Err(SyncError::InvalidInput("notification has no recipient".to_string()));
    }
    if notification.recipient_user_id == notification.actor_user_id {
        return Err(SyncError::InvalidInput(
            "users are not notified about their own actions".to_string(),
        ));
    }

    let id = store.allocate_id(collection);
    let notification = Notification {
        id: id.clone(),
        ..notification
    };
    store.set(collection, &id, to_document(&notification)?).await?;
    debug!(id = %id, recipient = %notification.recipient_user_id, "notification created");
    Ok(id)
}

/// Tells the author of `post_id` that `actor_user_id` liked it.
///
/// The actor's name and avatar are copied from their profile at this moment;
/// an unreadable profile degrades to [`UNKNOWN_ACTOR`] instead of failing.
pub async fn notify_like(
    backend: &Backend,
    config: &SyncConfig,
    recipient_user_id: &str,
    actor_user_id: &str,
    post_id: &str,
    post_title: &str,
) -> SyncResult<String> {
    if recipient_user_id == actor_user_id {
        return Err(SyncError::InvalidInput(
            "users are not notified about their own actions".to_string(),
        ));
    }

    let actor = fetch_profile(
        backend.documents.as_ref(),
        &config.users_collection,
        actor_user_id,
    )
    .await
    .ok();
    let actor_name = actor
        .as_ref()
        .map(|p| p.name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_ACTOR)
        .to_string();
    let actor_image = actor
        .map(|p| p.profile_image_url)
        .filter(|url| !url.is_empty());

    let notification = Notification::like(
        recipient_user_id,
        actor_user_id,
        &actor_name,
        actor_image,
        post_id,
        post_title,
    );
    create_notification(
        backend.documents.as_ref(),
        &config.notifications_collection,
        notification,
    )
    .await
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationState {
    /// Newest first, exactly as last pushed by the store.
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Recipient of the open subscription, if any.
    pub subscribed_user: Option<String>,
}

/// Commands the UI fires without waiting for the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationIntent {
    Subscribe(String),
    MarkAsRead(String),
    MarkAllAsRead(String),
    Delete(String),
}

/// Push listener currently installed, plus a counter bumped by every
/// subscribe or unsubscribe so that a slower, older subscribe cannot win.
#[derive(Default)]
struct ListenerSlot {
    generation: u64,
    token: Option<CancellationToken>,
}

struct NotificationInner {
    backend: Backend,
    config: SyncConfig,
    state: watch::Sender<NotificationState>,
    scope: TaskScope,
    listener: Mutex<ListenerSlot>,
}

/// Live projection of one recipient's notifications plus the commands that
/// change them. Commands never touch local state; the open subscription
/// delivers their effect.
#[derive(Clone)]
pub struct NotificationSyncEngine {
    inner: Arc<NotificationInner>,
    /// Present on handles given out by [`new`](Self::new) and their clones,
    /// absent on the copies background tasks run with.
    _owner: Option<Arc<DropGuard>>,
}

impl NotificationSyncEngine {
    pub fn new(backend: Backend, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(NotificationState::default());
        let scope = TaskScope::new();
        let owner = Arc::new(scope.owner_guard());
        Self {
            inner: Arc::new(NotificationInner {
                backend,
                config,
                state,
                scope,
                listener: Mutex::new(ListenerSlot::default()),
            }),
            _owner: Some(owner),
        }
    }

    /// Handle for tasks spawned on the scope. Dropping every owning handle
    /// still cancels them.
    fn worker(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _owner: None,
        }
    }

    pub fn state(&self) -> NotificationState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<NotificationState> {
        self.inner.state.subscribe()
    }

    pub fn clear_error(&self) {
        self.inner.state.send_modify(|s| s.error = None);
    }

    /// Closes the subscription and stops every pending command.
    pub fn shutdown(&self) {
        self.inner.scope.cancel();
    }

    /// Waits for dispatched commands and side effects to finish.
    pub async fn wait_idle(&self) {
        self.inner.scope.idle().await;
    }

    fn collection(&self) -> &str {
        &self.inner.config.notifications_collection
    }

    fn store(&self) -> &dyn DocumentStore {
        self.inner.backend.documents.as_ref()
    }

    fn listener(&self) -> MutexGuard<'_, ListenerSlot> {
        self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the installed listener and starts a new generation.
    fn begin_generation(&self) -> u64 {
        let mut slot = self.listener();
        if let Some(token) = slot.token.take() {
            token.cancel();
        }
        slot.generation += 1;
        slot.generation
    }

    /// Installs `token` unless a later subscribe or unsubscribe happened.
    fn install_listener(&self, generation: u64, token: CancellationToken) -> bool {
        let mut slot = self.listener();
        if slot.generation != generation {
            return false;
        }
        slot.token = Some(token);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.listener().generation == generation
    }

    /// Opens the push subscription for `user_id`, replacing any previous one.
    ///
    /// Every push replaces the list and recounts unread entries. A broken
    /// subscription is reported once in `error` and is not reopened. When a
    /// later call overtakes this one, this call returns
    /// [`SyncError::Cancelled`] and leaves the state to the later call.
    pub async fn subscribe_for_user(&self, user_id: &str) -> SyncResult<()> {
        let generation = self.begin_generation();
        self.inner.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
            s.subscribed_user = Some(user_id.to_string());
        });

        let query = Query::collection(self.collection())
            .where_eq("recipientUserId", user_id)
            .order_by_desc("createdAt");
        let mut subscription = match self.inner.scope.run(self.store().subscribe(query)).await? {
            Ok(subscription) => subscription,
            Err(e) if !self.is_current(generation) => {
                debug!(user_id, error = %e, "superseded notification subscription failed");
                return Err(SyncError::Cancelled);
            }
            Err(e) => {
                let message = format!("Failed to load notifications: {}", e);
                warn!(user_id, %message, "notification subscription failed");
                self.inner.state.send_modify(|s| {
                    s.is_loading = false;
                    s.error = Some(message);
                    s.subscribed_user = None;
                });
                return Err(e.into());
            }
        };

        let token = self.inner.scope.child_token();
        if !self.install_listener(generation, token.clone()) {
            debug!(user_id, "notification subscription superseded before it opened");
            subscription.close();
            return Err(SyncError::Cancelled);
        }
        info!(user_id, "notification subscription opened");

        let engine = self.worker();
        let user_id = user_id.to_string();
        self.inner.scope.spawn_listener(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(%user_id, "notification subscription closed");
                        subscription.close();
                        break;
                    }
                    event = subscription.next() => match event {
                        Some(Ok(snapshots)) => engine.apply(&snapshots),
                        Some(Err(e)) if engine.is_current(generation) => {
                            let message = format!("Failed to load notifications: {}", e);
                            warn!(%user_id, %message, "notification subscription broke");
                            engine.inner.state.send_modify(|s| {
                                s.is_loading = false;
                                s.error = Some(message);
                                s.subscribed_user = None;
                            });
                            break;
                        }
                        Some(Err(_)) | None => break,
                    }
                }
            }
        });
        Ok(())
    }

    fn apply(&self, snapshots: &[Snapshot]) {
        let notifications: Vec<Notification> = decode_all(snapshots, "id");
        let unread = notifications.iter().filter(|n| !n.is_read).count();
        self.inner.state.send_modify(|s| {
            s.notifications = notifications;
            s.unread_count = unread;
            s.is_loading = false;
        });
    }

    /// Closes the active subscription. The last pushed list stays visible.
    pub fn unsubscribe(&self) {
        self.begin_generation();
        self.inner.state.send_modify(|s| {
            s.subscribed_user = None;
            s.is_loading = false;
        });
    }

    pub async fn mark_as_read(&self, notification_id: &str) -> SyncResult<()> {
        let mut fields = Document::new();
        fields.insert("isRead".to_string(), json!(true));
        self.inner
            .scope
            .run(self.store().update(self.collection(), notification_id, fields))
            .await??;
        Ok(())
    }

    /// Flags every unread notification of `user_id` as read in one batch.
    /// Returns how many documents were updated.
    pub async fn mark_all_as_read(&self, user_id: &str) -> SyncResult<usize> {
        self.inner.scope.run(self.mark_all_as_read_inner(user_id)).await?
    }

    async fn mark_all_as_read_inner(&self, user_id: &str) -> SyncResult<usize> {
        let unread = self
            .store()
            .query(
                &Query::collection(self.collection())
                    .where_eq("recipientUserId", user_id)
                    .where_eq("isRead", false),
            )
            .await?;
        if unread.is_empty() {
            return Ok(0);
        }

        let updates: Vec<FieldUpdate> = unread
            .iter()
            .map(|snap| {
                let mut fields = Document::new();
                fields.insert("isRead".to_string(), json!(true));
                FieldUpdate {
                    collection: self.collection().to_string(),
                    id: snap.id.clone(),
                    fields,
                }
            })
            .collect();
        let count = updates.len();
        self.store().batch_update(updates).await?;
        info!(user_id, count, "notifications marked read");
        Ok(count)
    }

    /// Counts unread notifications straight from the store.
    pub async fn fetch_unread_count(&self, user_id: &str) -> SyncResult<usize> {
        let query = Query::collection(self.collection())
            .where_eq("recipientUserId", user_id)
            .where_eq("isRead", false);
        let unread = self.inner.scope.run(self.store().query(&query)).await??;
        Ok(unread.len())
    }

    pub async fn create(&self, notification: Notification) -> SyncResult<String> {
        self.inner
            .scope
            .run(create_notification(self.store(), self.collection(), notification))
            .await?
    }

    pub async fn delete(&self, notification_id: &str) -> SyncResult<()> {
        self.inner
            .scope
            .run(self.store().delete(self.collection(), notification_id))
            .await??;
        Ok(())
    }

    /// Runs `intent` on the engine scope. Failures are logged only.
    pub fn dispatch(&self, intent: NotificationIntent) {
        let engine = self.worker();
        self.inner.scope.spawn(async move {
            let result = match &intent {
                NotificationIntent::Subscribe(user_id) => engine.subscribe_for_user(user_id).await,
                NotificationIntent::MarkAsRead(id) => engine.mark_as_read(id).await,
                NotificationIntent::MarkAllAsRead(user_id) => {
                    engine.mark_all_as_read(user_id).await.map(|_| ())
                }
                NotificationIntent::Delete(id) => engine.delete(id).await,
            };
            if let Err(e) = result {
                warn!(?intent, error = %e, "notification command failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryBackend;

    #[tokio::test]
    async fn own_action_is_never_notified() {
        let mem = MemoryBackend::new();
        let err = notify_like(&mem.backend(), &SyncConfig::default(), "u1", "u1", "p1", "T")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        assert!(mem.documents.documents("notifications").is_empty());
    }

    #[tokio::test]
    async fn created_notification_mirrors_its_id() {
        let mem = MemoryBackend::new();
        let n = Notification::like("bob", "alice", "Alice", None, "p1", "Hi");
        let id = create_notification(mem.documents.as_ref(), "notifications", n)
            .await
            .unwrap();
        let stored = mem.documents.document("notifications", &id).unwrap();
        assert_eq!(stored["id"], json!(id));
        assert_eq!(stored["type"], json!("LIKE"));
        assert_eq!(stored["isRead"], json!(false));
    }

    #[tokio::test]
    async fn missing_actor_profile_falls_back_to_someone() {
        let mem = MemoryBackend::new();
        let id = notify_like(&mem.backend(), &SyncConfig::default(), "bob", "ghost", "p1", "Trip")
            .await
            .unwrap();
        let stored = mem.documents.document("notifications", &id).unwrap();
        assert_eq!(stored["actorName"], json!("Someone"));
        assert_eq!(stored["message"], json!("Someone liked your post \"Trip\""));
    }
}
