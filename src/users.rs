use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::*;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::helpers::{from_snapshot, is_http_url, sanitize_text, to_document};
use crate::core::scope::TaskScope;
use crate::core::uploads::upload_image;
use crate::models::models::UserProfile;
use crate::remote::{Backend, Document, DocumentStore, ImageSource, Snapshot};

/// Reads the profile document of `uid`.
pub async fn fetch_profile(
    store: &dyn DocumentStore,
    users_collection: &str,
    uid: &str,
) -> SyncResult<UserProfile> {
    match store.get(users_collection, uid).await? {
        Some(data) => from_snapshot(
            &Snapshot {
                id: uid.to_string(),
                data,
            },
            "uid",
        ),
        None => Err(SyncError::NotFound("User profile not found.".to_string())),
    }
}

/// Writes a brand new profile document at `users/{uid}`.
pub async fn create_profile(
    store: &dyn DocumentStore,
    users_collection: &str,
    profile: &UserProfile,
) -> SyncResult<()> {
    let mut doc = to_document(profile)?;
    doc.remove("uid");
    store.set(users_collection, &profile.uid, doc).await?;
    Ok(())
}

fn fields(pairs: &[(&str, Value)]) -> Document {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileState {
    pub user: Option<UserProfile>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub is_saved: bool,
}

struct ProfileInner {
    backend: Backend,
    config: SyncConfig,
    state: watch::Sender<ProfileState>,
    scope: TaskScope,
}

/// Loads and edits the signed-in user's own profile.
///
/// Edits only touch the profile document. Posts and notifications keep the
/// author/actor copy taken when they were written.
#[derive(Clone)]
pub struct ProfileEngine {
    inner: Arc<ProfileInner>,
}

impl ProfileEngine {
    pub fn new(backend: Backend, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(ProfileState::default());
        Self {
            inner: Arc::new(ProfileInner {
                backend,
                config,
                state,
                scope: TaskScope::new(),
            }),
        }
    }

    pub fn state(&self) -> ProfileState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProfileState> {
        self.inner.state.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.scope.cancel();
    }

    pub fn clear_error(&self) {
        self.inner.state.send_modify(|s| s.error = None);
    }

    /// Returns the one-shot saved flag and resets it.
    pub fn take_saved(&self) -> bool {
        let mut saved = false;
        self.inner.state.send_if_modified(|s| {
            saved = std::mem::take(&mut s.is_saved);
            saved
        });
        saved
    }

    fn fail(&self, message: String) {
        warn!(%message, "profile operation failed");
        self.inner.state.send_modify(|s| {
            s.is_loading = false;
            s.error = Some(message);
        });
    }

    fn signed_in(&self, message: &str) -> SyncResult<String> {
        match self.inner.backend.current_user() {
            Some(uid) => Ok(uid),
            None => {
                self.fail(message.to_string());
                Err(SyncError::NotSignedIn)
            }
        }
    }

    pub async fn load_current_user(&self) -> SyncResult<UserProfile> {
        self.inner.scope.run(self.load_current_user_inner()).await?
    }

    async fn load_current_user_inner(&self) -> SyncResult<UserProfile> {
        self.inner.state.send_modify(|s| {
            s.is_loading = true;
            s.is_saved = false;
            s.error = None;
        });
        let uid = self.signed_in("No authenticated user found.")?;

        match fetch_profile(
            self.inner.backend.documents.as_ref(),
            &self.inner.config.users_collection,
            &uid,
        )
        .await
        {
            Ok(profile) => {
                self.inner.state.send_modify(|s| {
                    s.user = Some(profile.clone());
                    s.is_loading = false;
                });
                Ok(profile)
            }
            Err(e) => {
                self.fail(format!("Failed to load profile: {}", e.detail()));
                Err(e)
            }
        }
    }

    /// Saves display name and bio as plain text.
    pub async fn save_profile(&self, name: &str, bio: &str) -> SyncResult<()> {
        self.inner.scope.run(self.save_profile_inner(name, bio)).await?
    }

    async fn save_profile_inner(&self, name: &str, bio: &str) -> SyncResult<()> {
        let uid = self.signed_in("User not logged in.")?;

        let name = sanitize_text(name);
        let bio = sanitize_text(bio);
        if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
            self.fail(format!("Name must be 1-{} characters", MAX_NAME_LENGTH));
            return Err(SyncError::InvalidInput("name".to_string()));
        }
        if bio.chars().count() > MAX_BIO_LENGTH {
            self.fail(format!("Bio too long (max {} chars)", MAX_BIO_LENGTH));
            return Err(SyncError::InvalidInput("bio".to_string()));
        }

        self.inner.state.send_modify(|s| {
            s.is_loading = true;
            s.is_saved = false;
        });
        let update = fields(&[("name", json!(name)), ("bio", json!(bio))]);
        match self
            .inner
            .backend
            .documents
            .update(&self.inner.config.users_collection, &uid, update)
            .await
        {
            Ok(()) => {
                info!(uid = %uid, "profile saved");
                self.inner.state.send_modify(|s| {
                    if let Some(user) = s.user.as_mut() {
                        user.name = name.clone();
                        user.bio = bio.clone();
                    }
                    s.is_loading = false;
                    s.is_saved = true;
                });
                Ok(())
            }
            Err(e) => {
                self.fail(format!("Failed to save profile: {}", e));
                Err(e.into())
            }
        }
    }

    /// Replaces the social links map. Every link must be an http(s) URL.
    pub async fn update_social_links(&self, links: BTreeMap<String, String>) -> SyncResult<()> {
        self.inner.scope.run(self.update_social_links_inner(links)).await?
    }

    async fn update_social_links_inner(&self, links: BTreeMap<String, String>) -> SyncResult<()> {
        let uid = self.signed_in("User not logged in.")?;

        let links: BTreeMap<String, String> = links
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        if let Some((network, _)) = links.iter().find(|(_, url)| !is_http_url(url)) {
            self.fail(format!("Invalid link for {}", network));
            return Err(SyncError::InvalidInput(network.clone()));
        }

        let update = fields(&[("socialLinks", json!(links))]);
        match self
            .inner
            .backend
            .documents
            .update(&self.inner.config.users_collection, &uid, update)
            .await
        {
            Ok(()) => {
                self.inner.state.send_modify(|s| {
                    if let Some(user) = s.user.as_mut() {
                        user.social_links = links.clone();
                    }
                    s.is_saved = true;
                });
                Ok(())
            }
            Err(e) => {
                self.fail(format!("Failed to save links: {}", e));
                Err(e.into())
            }
        }
    }

    /// Uploads a new avatar, then points the profile at it.
    pub async fn upload_profile_image(&self, image: ImageSource) -> SyncResult<String> {
        self.inner.scope.run(self.upload_profile_image_inner(image)).await?
    }

    async fn upload_profile_image_inner(&self, image: ImageSource) -> SyncResult<String> {
        let uid = self.signed_in("User not logged in to upload image.")?;
        self.inner.state.send_modify(|s| s.is_loading = true);

        let url = match upload_image(
            self.inner.backend.objects.clone(),
            image,
            &self.inner.config.upload_preset,
        )
        .await
        {
            Ok(url) => url,
            Err(e) => {
                self.fail(format!("Upload failed: {}", e.detail()));
                return Err(e);
            }
        };

        let update = fields(&[("profileImageUrl", json!(url))]);
        match self
            .inner
            .backend
            .documents
            .update(&self.inner.config.users_collection, &uid, update)
            .await
        {
            Ok(()) => {
                self.inner.state.send_modify(|s| {
                    if let Some(user) = s.user.as_mut() {
                        user.profile_image_url = url.clone();
                    }
                    s.is_loading = false;
                });
                Ok(url)
            }
            Err(e) => {
                self.fail(format!("Failed to save new image URL: {}", e));
                Err(e.into())
            }
        }
    }
}
