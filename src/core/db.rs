use std::collections::BTreeMap;

use chrono::Duration;
use tracing::info;

use crate::config::SyncConfig;
use crate::core::helpers::{now, to_document};
use crate::models::models::{BlogCategory, Post, UserProfile};
use crate::remote::{Backend, Query};
use crate::users::{create_profile, fetch_profile};

struct SeedUser {
    name: &'static str,
    email: &'static str,
    password: &'static str,
    bio: &'static str,
    posts: &'static [(&'static str, &'static str, BlogCategory)],
}

static SEED_USERS: [SeedUser; 3] = [
    SeedUser {
        name: "test",
        email: "test@bloghub.local",
        password: "testpass",
        bio: "Test user bio",
        posts: &[(
            "Hello BlogHub",
            "This is my first post on BlogHub!",
            BlogCategory::General,
        )],
    },
    SeedUser {
        name: "alice",
        email: "alice@bloghub.local",
        password: "alicepass",
        bio: "Hello, I'm Alice!",
        posts: &[
            (
                "Welcome",
                "Welcome to my blog! Excited to share thoughts here.",
                BlogCategory::Lifestyle,
            ),
            (
                "Shipped it",
                "Just finished an amazing project. Feeling productive today!",
                BlogCategory::Technology,
            ),
        ],
    },
    SeedUser {
        name: "bob",
        email: "bob@bloghub.local",
        password: "bobpass1",
        bio: "Bob's corner of the internet",
        posts: &[(
            "Hi all",
            "Hey everyone! Just joined BlogHub, looking forward to reading your posts.",
            BlogCategory::General,
        )],
    },
];

/// Password of a seeded account, for demos and tests.
pub fn seed_password(name: &str) -> Option<&'static str> {
    SEED_USERS
        .iter()
        .find(|u| u.name == name)
        .map(|u| u.password)
}

pub fn seed_email(name: &str) -> Option<&'static str> {
    SEED_USERS.iter().find(|u| u.name == name).map(|u| u.email)
}

/// Creates the demo accounts `test`, `alice` and `bob` with their profiles
/// and posts. Accounts that already exist are left as they are.
///
/// Returns the uid of every seeded user by name. Nobody is signed in
/// afterwards.
pub async fn init_test_data(
    backend: &Backend,
    config: &SyncConfig,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut uids = BTreeMap::new();
    let mut stamp = now() - Duration::minutes(10);

    for seed in &SEED_USERS {
        let existing = backend
            .identity
            .sign_in_with_email(seed.email, seed.password)
            .await
            .ok();
        if let Some(uid) = &existing {
            // Already initialized
            if fetch_profile(backend.documents.as_ref(), &config.users_collection, uid)
                .await
                .is_ok()
            {
                uids.insert(seed.name.to_string(), uid.clone());
                continue;
            }
        }

        let uid = match existing {
            Some(uid) => uid,
            None => {
                backend
                    .identity
                    .sign_up_with_email(seed.email, seed.password)
                    .await?
            }
        };
        let mut profile = UserProfile::new(&uid, seed.name, seed.email);
        profile.bio = seed.bio.to_string();
        create_profile(backend.documents.as_ref(), &config.users_collection, &profile).await?;

        for (title, content, category) in seed.posts {
            stamp += Duration::minutes(1);
            let post = Post::new(title, content, *category, profile.clone(), None, stamp);
            backend
                .documents
                .create(&config.posts_collection, to_document(&post)?)
                .await?;
        }
        info!(user = seed.name, uid = %uid, posts = seed.posts.len(), "seeded user");
        uids.insert(seed.name.to_string(), uid);
    }

    backend.identity.sign_out().await;
    Ok(uids)
}

/// Deletes every post, profile and notification document.
pub async fn reset_db_data(backend: &Backend, config: &SyncConfig) -> anyhow::Result<()> {
    for collection in [
        &config.posts_collection,
        &config.users_collection,
        &config.notifications_collection,
    ] {
        let docs = backend.documents.query(&Query::collection(collection)).await?;
        for doc in &docs {
            backend.documents.delete(collection, &doc.id).await?;
        }
        info!(collection = %collection, removed = docs.len(), "collection cleared");
    }
    backend.identity.sign_out().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryBackend;

    #[tokio::test]
    async fn seeding_twice_keeps_one_copy() {
        let mem = MemoryBackend::new();
        let backend = mem.backend();
        let config = SyncConfig::default();

        let first = init_test_data(&backend, &config).await.unwrap();
        let second = init_test_data(&backend, &config).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mem.documents.documents("users").len(), 3);
        assert_eq!(mem.documents.documents("blogs").len(), 4);
        assert_eq!(backend.current_user(), None);
    }

    #[tokio::test]
    async fn reset_empties_every_collection() {
        let mem = MemoryBackend::new();
        let backend = mem.backend();
        let config = SyncConfig::default();
        init_test_data(&backend, &config).await.unwrap();

        reset_db_data(&backend, &config).await.unwrap();
        assert!(mem.documents.documents("users").is_empty());
        assert!(mem.documents.documents("blogs").is_empty());
    }
}
