use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use crate::config::*;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::helpers::{decode_all, now, to_document};
use crate::core::scope::TaskScope;
use crate::core::uploads::upload_image;
use crate::models::models::{BlogCategory, Post};
use crate::notifications::notify_like;
use crate::remote::{Backend, Document, DocumentStore, ImageSource, Query};
use crate::users::fetch_profile;

/// Posts keyed by id, plus the two ordered views the screens show.
///
/// A post appearing in both views is stored once, so a change to it is seen
/// by both. A view that never loaded a post is not affected by changes to it.
#[derive(Debug, Clone, Default, PartialEq)]
struct PostCache {
    posts: HashMap<String, Post>,
    all: Vec<String>,
    mine: Vec<String>,
}

impl PostCache {
    fn view(&self, index: &[String]) -> Vec<Post> {
        index
            .iter()
            .filter_map(|id| self.posts.get(id))
            .cloned()
            .collect()
    }

    fn absorb(&mut self, posts: Vec<Post>) -> Vec<String> {
        posts
            .into_iter()
            .map(|post| {
                let id = post.id.clone();
                self.posts.insert(id.clone(), post);
                id
            })
            .collect()
    }

    fn replace_all(&mut self, posts: Vec<Post>) {
        self.all = self.absorb(posts);
        self.compact();
    }

    fn replace_mine(&mut self, posts: Vec<Post>) {
        self.mine = self.absorb(posts);
        self.compact();
    }

    // Drop entries no view points at any more
    fn compact(&mut self) {
        let Self { posts, all, mine } = self;
        let live: HashSet<&String> = all.iter().chain(mine.iter()).collect();
        posts.retain(|id, _| live.contains(id));
    }

    fn remove(&mut self, id: &str) -> bool {
        let removed = self.posts.remove(id).is_some();
        self.all.retain(|p| p != id);
        self.mine.retain(|p| p != id);
        removed
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostsState {
    cache: PostCache,
    pub all_posts_loading: bool,
    pub my_posts_loading: bool,
    /// A create or update is in flight.
    pub saving: bool,
    pub error: Option<String>,
    /// One-shot: set when a create or update lands, consumed by `take_post_saved`.
    pub post_saved: bool,
}

impl PostsState {
    /// Global feed, newest first.
    pub fn all_posts(&self) -> Vec<Post> {
        self.cache.view(&self.cache.all)
    }

    /// Posts written by the signed-in user, newest first.
    pub fn my_posts(&self) -> Vec<Post> {
        self.cache.view(&self.cache.mine)
    }

    /// Feed restricted to `category`; `None` means every category.
    pub fn all_posts_in(&self, category: Option<BlogCategory>) -> Vec<Post> {
        let mut posts = self.all_posts();
        if let Some(category) = category {
            posts.retain(|p| p.category == category);
        }
        posts
    }

    pub fn post(&self, id: &str) -> Option<&Post> {
        self.cache.posts.get(id)
    }

    pub fn in_all_posts(&self, id: &str) -> bool {
        self.cache.all.iter().any(|p| p == id)
    }

    pub fn in_my_posts(&self, id: &str) -> bool {
        self.cache.mine.iter().any(|p| p == id)
    }
}

/// What the author typed in the editor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub category: BlogCategory,
    /// Newly picked cover image; `None` keeps whatever the post already has.
    pub image: Option<ImageSource>,
}

impl PostDraft {
    pub fn new(title: &str, content: &str, category: BlogCategory) -> Self {
        Self {
            title: title.to_string(),
            content: content.to_string(),
            category,
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.image = Some(image);
        self
    }
}

/// User actions the UI fires without waiting on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostIntent {
    LoadAll,
    LoadMine,
    Refresh,
    Create(PostDraft),
    Update { post_id: String, draft: PostDraft },
    Delete(String),
    ToggleLike(String),
}

struct PostInner {
    backend: Backend,
    config: SyncConfig,
    state: watch::Sender<PostsState>,
    scope: TaskScope,
    last_created_at: Mutex<Option<DateTime<Utc>>>,
}

/// Keeps the feed and the user's own posts in step with the document store.
///
/// Deletes and likes are applied locally first; a failed like is rolled back
/// and a failed delete reloads both views from the store. Every failure ends
/// the action: nothing is retried.
#[derive(Clone)]
pub struct PostSyncEngine {
    inner: Arc<PostInner>,
    /// Cancels the scope once the last owning handle is gone. Copies used by
    /// spawned intents carry `None`.
    _owner: Option<Arc<DropGuard>>,
}

impl PostSyncEngine {
    pub fn new(backend: Backend, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(PostsState::default());
        let scope = TaskScope::new();
        let owner = Arc::new(scope.owner_guard());
        Self {
            inner: Arc::new(PostInner {
                backend,
                config,
                state,
                scope,
                last_created_at: Mutex::new(None),
            }),
            _owner: Some(owner),
        }
    }

    fn worker(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _owner: None,
        }
    }

    pub fn state(&self) -> PostsState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PostsState> {
        self.inner.state.subscribe()
    }

    pub fn clear_error(&self) {
        self.inner.state.send_modify(|s| s.error = None);
    }

    /// Returns the one-shot saved flag and resets it.
    pub fn take_post_saved(&self) -> bool {
        let mut saved = false;
        self.inner.state.send_if_modified(|s| {
            saved = std::mem::take(&mut s.post_saved);
            saved
        });
        saved
    }

    /// Cancels in-flight operations, uploads and pending side effects.
    pub fn shutdown(&self) {
        self.inner.scope.cancel();
    }

    /// Waits for dispatched intents and side effects to finish.
    pub async fn wait_idle(&self) {
        self.inner.scope.idle().await;
    }

    fn store(&self) -> &dyn DocumentStore {
        self.inner.backend.documents.as_ref()
    }

    fn collection(&self) -> &str {
        &self.inner.config.posts_collection
    }

    fn fail(&self, message: String) {
        warn!(%message, "post operation failed");
        self.inner.state.send_modify(|s| {
            s.saving = false;
            s.error = Some(message);
        });
    }

    // Never earlier than the previous post this engine created
    fn next_created_at(&self) -> DateTime<Utc> {
        let mut last = self
            .inner
            .last_created_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let stamp = match *last {
            Some(prev) if prev > now() => prev,
            _ => now(),
        };
        *last = Some(stamp);
        stamp
    }

    pub async fn load_all_posts(&self) -> SyncResult<()> {
        self.inner.scope.run(self.load_all_inner()).await?
    }

    async fn load_all_inner(&self) -> SyncResult<()> {
        self.inner.state.send_modify(|s| {
            s.all_posts_loading = true;
            s.error = None;
        });

        let query = Query::collection(self.collection()).order_by_desc("createdAt");
        match self.store().query(&query).await {
            Ok(snapshots) => {
                let posts: Vec<Post> = decode_all(&snapshots, "id");
                debug!(count = posts.len(), "feed loaded");
                self.inner.state.send_modify(|s| {
                    s.cache.replace_all(posts);
                    s.all_posts_loading = false;
                });
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to load posts: {}", e);
                warn!(%message, "feed load failed");
                self.inner.state.send_modify(|s| {
                    s.all_posts_loading = false;
                    s.error = Some(message);
                });
                Err(e.into())
            }
        }
    }

    pub async fn load_my_posts(&self) -> SyncResult<()> {
        self.inner.scope.run(self.load_mine_inner()).await?
    }

    async fn load_mine_inner(&self) -> SyncResult<()> {
        self.inner.state.send_modify(|s| {
            s.my_posts_loading = true;
            s.error = None;
        });

        let Some(uid) = self.inner.backend.current_user() else {
            self.inner.state.send_modify(|s| {
                s.my_posts_loading = false;
                s.error = Some(SyncError::NotSignedIn.to_string());
            });
            return Err(SyncError::NotSignedIn);
        };

        let query = Query::collection(self.collection())
            .where_eq("author.uid", uid.as_str())
            .order_by_desc("createdAt");
        match self.store().query(&query).await {
            Ok(snapshots) => {
                let posts: Vec<Post> = decode_all(&snapshots, "id");
                debug!(uid = %uid, count = posts.len(), "own posts loaded");
                self.inner.state.send_modify(|s| {
                    s.cache.replace_mine(posts);
                    s.my_posts_loading = false;
                });
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to load your posts: {}", e);
                warn!(%message, "own posts load failed");
                self.inner.state.send_modify(|s| {
                    s.my_posts_loading = false;
                    s.error = Some(message);
                });
                Err(e.into())
            }
        }
    }

    /// Reloads the feed and the user's own posts side by side.
    pub async fn refresh(&self) -> SyncResult<()> {
        let (all, mine) = tokio::join!(self.load_all_posts(), self.load_my_posts());
        all.and(mine)
    }

    /// Publishes a new post authored by the signed-in user.
    ///
    /// The cover image is uploaded first and the post is only written once
    /// its URL is known. The author profile is copied into the post as it is
    /// now; later profile edits do not reach it.
    pub async fn create_post(&self, draft: PostDraft) -> SyncResult<Post> {
        self.inner.scope.run(self.create_inner(draft)).await?
    }

    async fn create_inner(&self, draft: PostDraft) -> SyncResult<Post> {
        self.inner.state.send_modify(|s| {
            s.post_saved = false;
            s.saving = true;
            s.error = None;
        });

        let Some(uid) = self.inner.backend.current_user() else {
            self.fail(SyncError::NotSignedIn.to_string());
            return Err(SyncError::NotSignedIn);
        };

        let title = draft.title.trim();
        let content = draft.content.trim();
        if title.is_empty() || content.is_empty() {
            self.fail("Title and content are required.".to_string());
            return Err(SyncError::InvalidInput("title and content".to_string()));
        }
        validate_lengths(title, content).inspect_err(|e| self.fail(e.detail()))?;

        let image_url = match draft.image {
            Some(image) => Some(self.upload(image).await?),
            None => None,
        };

        let author = match fetch_profile(
            self.store(),
            &self.inner.config.users_collection,
            &uid,
        )
        .await
        {
            Ok(author) => author,
            Err(e) => {
                self.fail("Could not fetch author profile.".to_string());
                return Err(e);
            }
        };

        let mut post = Post::new(
            title,
            content,
            draft.category,
            author,
            image_url,
            self.next_created_at(),
        );
        let doc = to_document(&post).inspect_err(|e| self.fail(e.to_string()))?;
        match self.store().create(self.collection(), doc).await {
            Ok(id) => {
                info!(post_id = %id, uid = %uid, "post created");
                post.id = id;
                self.inner.state.send_modify(|s| {
                    s.saving = false;
                    s.post_saved = true;
                });
                Ok(post)
            }
            Err(e) => {
                self.fail(format!("Error creating post: {}", e));
                Err(e.into())
            }
        }
    }

    /// Edits title, content, category and (when a new one is picked) the
    /// cover image. Empty title or content leave the stored value alone;
    /// author, creation time and likes are never sent.
    pub async fn update_post(&self, post_id: &str, draft: PostDraft) -> SyncResult<()> {
        self.inner.scope.run(self.update_inner(post_id, draft)).await?
    }

    async fn update_inner(&self, post_id: &str, draft: PostDraft) -> SyncResult<()> {
        self.inner.state.send_modify(|s| {
            s.post_saved = false;
            s.saving = true;
            s.error = None;
        });

        if self.inner.backend.current_user().is_none() {
            self.fail(SyncError::NotSignedIn.to_string());
            return Err(SyncError::NotSignedIn);
        }
        let title = draft.title.trim().to_string();
        let content = draft.content.trim().to_string();
        validate_lengths(&title, &content).inspect_err(|e| self.fail(e.detail()))?;

        let image_url = match draft.image {
            Some(image) => Some(self.upload(image).await?),
            None => None,
        };

        let mut fields = Document::new();
        if !title.is_empty() {
            fields.insert("title".to_string(), json!(title));
        }
        if !content.is_empty() {
            fields.insert("content".to_string(), json!(content));
        }
        fields.insert("category".to_string(), json!(draft.category));
        if let Some(url) = &image_url {
            fields.insert("imageUrl".to_string(), json!(url));
        }

        match self.store().update(self.collection(), post_id, fields).await {
            Ok(()) => {
                info!(post_id, "post updated");
                self.inner.state.send_modify(|s| {
                    if let Some(post) = s.cache.posts.get_mut(post_id) {
                        if !title.is_empty() {
                            post.title = title.clone();
                        }
                        if !content.is_empty() {
                            post.content = content.clone();
                        }
                        post.category = draft.category;
                        if image_url.is_some() {
                            post.image_url = image_url.clone();
                        }
                    }
                    s.saving = false;
                    s.post_saved = true;
                });
                Ok(())
            }
            Err(e) => {
                self.fail(format!("Error updating post: {}", e));
                Err(e.into())
            }
        }
    }

    async fn upload(&self, image: ImageSource) -> SyncResult<String> {
        upload_image(
            self.inner.backend.objects.clone(),
            image,
            &self.inner.config.upload_preset,
        )
        .await
        .inspect_err(|e| self.fail(e.to_string()))
    }

    /// Removes the post from both views at once, then deletes it remotely.
    /// If the store refuses, both views are reloaded from the store.
    pub async fn delete_post(&self, post_id: &str) -> SyncResult<()> {
        self.inner.scope.run(self.delete_inner(post_id)).await?
    }

    async fn delete_inner(&self, post_id: &str) -> SyncResult<()> {
        self.inner.state.send_if_modified(|s| s.cache.remove(post_id));

        match self.store().delete(self.collection(), post_id).await {
            Ok(()) => {
                info!(post_id, "post deleted");
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to delete post: {}", e);
                warn!(post_id, %message, "delete failed, reloading posts");
                let _ = self.load_all_inner().await;
                if self.inner.backend.current_user().is_some() {
                    let _ = self.load_mine_inner().await;
                }
                self.inner.state.send_modify(|s| s.error = Some(message));
                Err(e.into())
            }
        }
    }

    /// Likes or unlikes a loaded post for the signed-in user.
    ///
    /// Returns the new liked state, or `None` when neither view holds the
    /// post. A new like on someone else's post also notifies its author in
    /// the background; that notification never affects the like.
    pub async fn toggle_like(&self, post_id: &str) -> SyncResult<Option<bool>> {
        self.inner.scope.run(self.toggle_like_inner(post_id)).await?
    }

    async fn toggle_like_inner(&self, post_id: &str) -> SyncResult<Option<bool>> {
        let Some(uid) = self.inner.backend.current_user() else {
            self.inner.state.send_modify(|s| {
                s.error = Some("You must be logged in to like posts.".to_string());
            });
            return Err(SyncError::NotSignedIn);
        };

        let mut before: Option<Post> = None;
        self.inner.state.send_if_modified(|s| {
            let Some(post) = s.cache.posts.get_mut(post_id) else {
                return false;
            };
            let liked = post.is_liked_by(&uid);
            let next = post.with_like(&uid, !liked);
            before = Some(std::mem::replace(post, next));
            true
        });
        let Some(before) = before else {
            debug!(post_id, "like ignored for a post that is not loaded");
            return Ok(None);
        };
        let was_liked = before.is_liked_by(&uid);

        if let Err(e) = self.write_like(post_id, &uid, !was_liked).await {
            let message = format!("Failed to update like: {}", e.detail());
            warn!(post_id, %message, "like rolled back");
            self.inner.state.send_modify(|s| {
                // Only undo this user's toggle; a reload may have landed meanwhile.
                if let Some(post) = s.cache.posts.get_mut(post_id) {
                    *post = post.with_like(&uid, was_liked);
                }
                s.error = Some(message);
            });
            return Err(e);
        }

        if !was_liked {
            if let Some(author) = before.author_id().filter(|author| *author != uid) {
                self.spawn_like_notification(author, &uid, post_id, &before.title);
            }
        }
        Ok(Some(!was_liked))
    }

    // Read-modify-write of `likedBy` alone, so concurrent likes from other
    // sessions on the same post are kept
    async fn write_like(&self, post_id: &str, uid: &str, like: bool) -> SyncResult<()> {
        let Some(doc) = self.store().get(self.collection(), post_id).await? else {
            debug!(post_id, "liked post no longer exists");
            return Ok(());
        };
        let mut likers: Vec<String> = match doc.get("likedBy") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())?,
        };

        let present = likers.iter().any(|l| l == uid);
        if like == present {
            return Ok(());
        }
        if like {
            likers.push(uid.to_string());
        } else {
            likers.retain(|l| l != uid);
        }

        let mut fields = Document::new();
        fields.insert("likedBy".to_string(), json!(likers));
        self.store().update(self.collection(), post_id, fields).await?;
        Ok(())
    }

    fn spawn_like_notification(&self, recipient: &str, actor: &str, post_id: &str, title: &str) {
        let backend = self.inner.backend.clone();
        let config = self.inner.config.clone();
        let (recipient, actor, post_id, title) = (
            recipient.to_string(),
            actor.to_string(),
            post_id.to_string(),
            title.to_string(),
        );
        self.inner.scope.spawn(async move {
            match notify_like(&backend, &config, &recipient, &actor, &post_id, &title).await {
                Ok(id) => debug!(notification_id = %id, %post_id, "like notification sent"),
                Err(e) => warn!(%post_id, error = %e, "like notification failed"),
            }
        });
    }

    /// Runs `intent` on the engine scope. Its outcome shows up in the state.
    pub fn dispatch(&self, intent: PostIntent) {
        let engine = self.worker();
        self.inner.scope.spawn(async move {
            let result = match intent {
                PostIntent::LoadAll => engine.load_all_posts().await,
                PostIntent::LoadMine => engine.load_my_posts().await,
                PostIntent::Refresh => engine.refresh().await,
                PostIntent::Create(draft) => engine.create_post(draft).await.map(|_| ()),
                PostIntent::Update { post_id, draft } => engine.update_post(&post_id, draft).await,
                PostIntent::Delete(post_id) => engine.delete_post(&post_id).await,
                PostIntent::ToggleLike(post_id) => engine.toggle_like(&post_id).await.map(|_| ()),
            };
            if let Err(e) = result {
                debug!(error = %e, "post intent finished with an error");
            }
        });
    }
}

fn validate_lengths(title: &str, content: &str) -> SyncResult<()> {
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(SyncError::InvalidInput(format!(
            "Title too long (max {} chars)",
            MAX_TITLE_LENGTH
        )));
    }
    if content.chars().count() > MAX_POST_LENGTH {
        return Err(SyncError::InvalidInput(format!(
            "Post too long (max {} chars)",
            MAX_POST_LENGTH
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::models::UserProfile;

    fn post(id: &str, author: &str) -> Post {
        let mut p = Post::new(
            id,
            "body",
            BlogCategory::General,
            UserProfile::new(author, author, ""),
            None,
            Utc::now(),
        );
        p.id = id.to_string();
        p
    }

    #[test]
    fn shared_post_is_stored_once() {
        let mut cache = PostCache::default();
        cache.replace_all(vec![post("a", "u1"), post("b", "u2")]);
        cache.replace_mine(vec![post("a", "u1")]);
        assert_eq!(cache.posts.len(), 2);

        cache.posts.get_mut("a").unwrap().liked_by.insert("u2".into());
        assert!(cache.view(&cache.all)[0].is_liked_by("u2"));
        assert!(cache.view(&cache.mine)[0].is_liked_by("u2"));
    }

    #[test]
    fn reload_drops_unreferenced_posts() {
        let mut cache = PostCache::default();
        cache.replace_all(vec![post("a", "u1"), post("b", "u2")]);
        cache.replace_mine(vec![post("a", "u1")]);
        cache.replace_all(vec![post("b", "u2")]);
        assert!(cache.posts.contains_key("a"));

        cache.replace_mine(Vec::new());
        assert!(!cache.posts.contains_key("a"));
        assert_eq!(cache.all, vec!["b".to_string()]);
    }

    #[test]
    fn remove_clears_both_views() {
        let mut cache = PostCache::default();
        cache.replace_all(vec![post("a", "u1")]);
        cache.replace_mine(vec![post("a", "u1")]);
        assert!(cache.remove("a"));
        assert!(cache.all.is_empty() && cache.mine.is_empty());
        assert!(!cache.remove("a"));
    }

    #[test]
    fn category_filter() {
        let mut tech = post("t", "u1");
        tech.category = BlogCategory::Technology;
        let state = PostsState {
            cache: {
                let mut c = PostCache::default();
                c.replace_all(vec![tech, post("g", "u1")]);
                c
            },
            ..PostsState::default()
        };
        assert_eq!(state.all_posts_in(None).len(), 2);
        let only = state.all_posts_in(Some(BlogCategory::Technology));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, "t");
    }

    #[test]
    fn overlong_title_is_rejected() {
        let title = "x".repeat(MAX_TITLE_LENGTH + 1);
        assert!(validate_lengths(&title, "ok").is_err());
        assert!(validate_lengths("ok", "ok").is_ok());
    }
}
