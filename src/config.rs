pub const DEFAULT_POSTS_COLLECTION: &str = "blogs";
pub const DEFAULT_USERS_COLLECTION: &str = "users";
pub const DEFAULT_NOTIFICATIONS_COLLECTION: &str = "notifications";
pub const DEFAULT_UPLOAD_PRESET: &str = "appdefault";

pub const MAX_NAME_LENGTH: usize = 50;
pub const MAX_BIO_LENGTH: usize = 500;
pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_POST_LENGTH: usize = 20_000;

/// Subscription buffer between a store listener and its consumer.
pub const SUBSCRIPTION_BUFFER: usize = 16;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn upload_preset() -> String {
    env_or("BLOGHUB_UPLOAD_PRESET", DEFAULT_UPLOAD_PRESET)
}

/// Names of the remote collections and the upload preset the engines talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub posts_collection: String,
    pub users_collection: String,
    pub notifications_collection: String,
    pub upload_preset: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            posts_collection: env_or("BLOGHUB_POSTS_COLLECTION", DEFAULT_POSTS_COLLECTION),
            users_collection: env_or("BLOGHUB_USERS_COLLECTION", DEFAULT_USERS_COLLECTION),
            notifications_collection: env_or(
                "BLOGHUB_NOTIFICATIONS_COLLECTION",
                DEFAULT_NOTIFICATIONS_COLLECTION,
            ),
            upload_preset: upload_preset(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            posts_collection: DEFAULT_POSTS_COLLECTION.to_string(),
            users_collection: DEFAULT_USERS_COLLECTION.to_string(),
            notifications_collection: DEFAULT_NOTIFICATIONS_COLLECTION.to_string(),
            upload_preset: DEFAULT_UPLOAD_PRESET.to_string(),
        }
    }
}
