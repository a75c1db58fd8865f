//! Sync engines of the BlogHub client: the post feed, the user's own posts,
//! likes and notifications, kept in step with a remote document store.
//!
//! The engines only talk to the [`remote`] contracts; [`remote::memory`]
//! provides in-process implementations for tests and the demo binary.

pub mod auth;
pub mod config;
pub mod notifications;
pub mod posts;
pub mod remote;
pub mod users;

pub mod core {
    pub mod db;
    pub mod errors;
    pub mod helpers;
    pub mod scope;
    pub mod uploads;
}

pub mod models {
    pub mod models;
}

pub use crate::auth::{AuthSession, AuthState};
pub use crate::config::SyncConfig;
pub use crate::core::errors::{SyncError, SyncResult};
pub use crate::models::models::{BlogCategory, Notification, NotificationType, Post, UserProfile};
pub use crate::notifications::{NotificationIntent, NotificationState, NotificationSyncEngine};
pub use crate::posts::{PostDraft, PostIntent, PostSyncEngine, PostsState};
pub use crate::remote::{Backend, ImageSource};
pub use crate::users::{ProfileEngine, ProfileState};
