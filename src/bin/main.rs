use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bloghub_sync::core::db::{init_test_data, seed_email, seed_password};
use bloghub_sync::remote::memory::MemoryBackend;
use bloghub_sync::{AuthSession, NotificationSyncEngine, PostSyncEngine, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::from_env();
    let memory = MemoryBackend::new();
    let backend = memory.backend();
    let users = init_test_data(&backend, &config).await?;
    let alice = users.get("alice").context("alice was not seeded")?.clone();

    let auth = AuthSession::new(backend.clone(), config.clone());
    let posts = PostSyncEngine::new(backend.clone(), config.clone());
    let notifications = NotificationSyncEngine::new(backend.clone(), config.clone());

    // Alice watches her notifications while bob browses
    notifications.subscribe_for_user(&alice).await?;

    let email = seed_email("bob").context("no seed account for bob")?;
    let password = seed_password("bob").context("no seed account for bob")?;
    let bob = auth.login_with_email(email, password).await?;
    info!(user = %bob.name, "signed in");

    posts.refresh().await?;
    let state = posts.state();
    info!(
        feed = state.all_posts().len(),
        mine = state.my_posts().len(),
        "posts loaded"
    );
    for post in state.all_posts() {
        info!(
            title = %post.title,
            category = %post.category,
            likes = post.like_count(),
            "feed entry"
        );
    }

    let target = state
        .all_posts()
        .into_iter()
        .find(|p| p.author_id() == Some(alice.as_str()))
        .context("alice has no posts")?;
    posts.toggle_like(&target.id).await?;
    posts.wait_idle().await;

    let mut watcher = notifications.watch_state();
    let seen = watcher.wait_for(|s| s.unread_count > 0).await?.clone();
    for n in &seen.notifications {
        info!(message = %n.message, read = n.is_read, "notification for alice");
    }

    notifications.mark_all_as_read(&alice).await?;
    let seen = watcher.wait_for(|s| s.unread_count == 0).await?.clone();
    info!(total = seen.notifications.len(), "alice is all caught up");

    notifications.shutdown();
    posts.shutdown();
    auth.sign_out().await;
    Ok(())
}
