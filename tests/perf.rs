use std::time::Instant;

use bloghub_sync::remote::memory::MemoryBackend;
use bloghub_sync::remote::IdentityProvider;
use bloghub_sync::users::create_profile;
use bloghub_sync::{BlogCategory, PostDraft, PostSyncEngine, SyncConfig, UserProfile};

const NUM_USERS: usize = 100;
const POSTS_PER_USER: usize = 2;
const LOADED_USER_POSTS: usize = 50;
const LIKERS: usize = 50;

async fn create_users(mem: &MemoryBackend, config: &SyncConfig, count: usize) -> Vec<String> {
    let mut uids = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("perf_user_{}_{}", i, &uuid::Uuid::new_v4().to_string()[0..8]);
        let email = format!("{}@perf.local", name);
        let uid = mem
            .identity
            .sign_up_with_email(&email, "password123")
            .await
            .unwrap();
        let profile = UserProfile::new(&uid, &name, &email);
        create_profile(mem.documents.as_ref(), &config.users_collection, &profile)
            .await
            .unwrap();
        uids.push(uid);
    }
    mem.identity.sign_out().await;
    uids
}

#[cfg_attr(not(feature = "perf"), ignore)]
#[tokio::test(flavor = "multi_thread")]
async fn perf_test_users_with_posts() {
    let mem = MemoryBackend::new();
    let config = SyncConfig::default();
    let posts = PostSyncEngine::new(mem.backend(), config.clone());
    let start = Instant::now();

    println!("\n=== Performance Test ===");
    println!("Creating {} users with {} posts each...", NUM_USERS, POSTS_PER_USER);

    let user_creation_start = Instant::now();
    let uids = create_users(&mem, &config, NUM_USERS).await;
    let user_creation_time = user_creation_start.elapsed();
    println!(
        "User creation done: {} users in {:.2}s",
        uids.len(),
        user_creation_time.as_secs_f64()
    );

    let post_creation_start = Instant::now();
    let mut posts_created = 0;
    let mut posts_failed = 0;
    for (idx, uid) in uids.iter().enumerate() {
        mem.identity.sign_in_as(uid);
        for n in 0..POSTS_PER_USER {
            let draft = PostDraft::new(
                &format!("Post {} by user {}", n, idx),
                "Performance test content",
                BlogCategory::General,
            );
            match posts.create_post(draft).await {
                Ok(_) => posts_created += 1,
                Err(_) => posts_failed += 1,
            }
        }
        if (idx + 1) % 25 == 0 {
            println!("  Posted for {}/{} users", idx + 1, uids.len());
        }
    }
    let post_creation_time = post_creation_start.elapsed();

    let load_start = Instant::now();
    posts.load_all_posts().await.unwrap();
    let load_time = load_start.elapsed();
    let total_time = start.elapsed();

    println!("\n=== Results ===");
    println!("Total time: {:.2}s", total_time.as_secs_f64());
    println!("User creation: {:.2}s", user_creation_time.as_secs_f64());
    println!("Post creation: {:.2}s", post_creation_time.as_secs_f64());
    println!("Posts created: {}", posts_created);
    println!("Posts failed: {}", posts_failed);
    println!("Feed load: {:.2}ms", load_time.as_secs_f64() * 1000.0);

    assert_eq!(posts_failed, 0);
    assert_eq!(posts.state().all_posts().len(), NUM_USERS * POSTS_PER_USER);
}

#[cfg_attr(not(feature = "perf"), ignore)]
#[tokio::test(flavor = "multi_thread")]
async fn perf_test_load_user_and_likes() {
    let mem = MemoryBackend::new();
    let config = SyncConfig::default();
    let posts = PostSyncEngine::new(mem.backend(), config.clone());
    let start = Instant::now();

    println!("\n=== Load User Performance Test ===");
    let uids = create_users(&mem, &config, LIKERS + 1).await;
    let author = &uids[0];

    let post_creation_start = Instant::now();
    mem.identity.sign_in_as(author);
    for n in 0..LOADED_USER_POSTS {
        let draft = PostDraft::new(
            &format!("Loaded post {}", n),
            "Content for the loaded user",
            BlogCategory::Technology,
        );
        posts.create_post(draft).await.unwrap();
        if (n + 1) % 10 == 0 {
            println!("  Created {}/{} posts", n + 1, LOADED_USER_POSTS);
        }
    }
    let post_creation_time = post_creation_start.elapsed();

    let fetch_start = Instant::now();
    posts.load_my_posts().await.unwrap();
    let fetch_time = fetch_start.elapsed();
    let target = posts.state().my_posts()[0].id.clone();

    // every other user likes the newest post through its own engine
    let like_start = Instant::now();
    for uid in &uids[1..] {
        mem.identity.sign_in_as(uid);
        let engine = PostSyncEngine::new(mem.backend(), config.clone());
        engine.load_all_posts().await.unwrap();
        engine.toggle_like(&target).await.unwrap();
        engine.wait_idle().await;
    }
    let like_time = like_start.elapsed();
    let total_time = start.elapsed();

    println!("\n=== Results ===");
    println!("Total time: {:.2}s", total_time.as_secs_f64());
    println!("Post creation: {:.2}s", post_creation_time.as_secs_f64());
    println!("My posts fetch time: {:.2}ms", fetch_time.as_secs_f64() * 1000.0);
    println!("Likes: {} in {:.2}s", LIKERS, like_time.as_secs_f64());

    let stored = mem.documents.document(&config.posts_collection, &target).unwrap();
    assert_eq!(stored["likedBy"].as_array().unwrap().len(), LIKERS);
    assert_eq!(
        mem.documents.documents(&config.notifications_collection).len(),
        LIKERS
    );
}
