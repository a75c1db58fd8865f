use std::collections::BTreeMap;

use serde_json::json;

use bloghub_sync::core::db::{init_test_data, seed_email, seed_password};
use bloghub_sync::remote::memory::{MemoryBackend, StoreOp};
use bloghub_sync::remote::{IdentityProvider, ProviderCredential, ProviderUser};
use bloghub_sync::users::fetch_profile;
use bloghub_sync::{
    AuthSession, BlogCategory, ImageSource, NotificationSyncEngine, PostDraft, PostSyncEngine,
    ProfileEngine, SyncConfig, SyncError,
};

fn session(mem: &MemoryBackend) -> AuthSession {
    AuthSession::new(mem.backend(), SyncConfig::default())
}

#[tokio::test]
async fn sign_up_writes_an_empty_profile() {
    let mem = MemoryBackend::new();
    let auth = session(&mem);

    let profile = auth
        .sign_up_with_email("Ann", "ann@example.com", "hunter22")
        .await
        .unwrap();
    assert!(!profile.uid.is_empty());

    let stored = mem.documents.document("users", &profile.uid).unwrap();
    assert_eq!(stored["name"], json!("Ann"));
    assert_eq!(stored["email"], json!("ann@example.com"));
    assert_eq!(stored["bio"], json!(""));
    assert_eq!(stored["profileImageUrl"], json!(""));
    assert_eq!(stored["socialLinks"], json!({}));
    assert!(stored["createdAt"].is_string());

    let state = auth.state();
    assert_eq!(state.user_id.as_deref(), Some(profile.uid.as_str()));
    assert_eq!(state.current_user, Some(profile));
    assert!(!state.is_loading);
}

#[tokio::test]
async fn sign_up_rejections_are_reported() {
    let mem = MemoryBackend::new();
    let auth = session(&mem);

    assert!(auth
        .sign_up_with_email("Ann", "ann@example.com", "123")
        .await
        .is_err());
    let error = auth.state().error.unwrap();
    assert!(error.starts_with("Sign up failed: "), "{}", error);
    assert!(mem.documents.documents("users").is_empty());

    auth.sign_up_with_email("Ann", "ann@example.com", "hunter22")
        .await
        .unwrap();
    assert!(auth
        .sign_up_with_email("Ann again", "ANN@example.com", "hunter22")
        .await
        .is_err());
    assert_eq!(mem.documents.documents("users").len(), 1);
}

#[tokio::test]
async fn login_falls_back_to_the_email_name() {
    let mem = MemoryBackend::new();
    mem.identity
        .sign_up_with_email("dana@example.com", "password1")
        .await
        .unwrap();
    mem.identity.sign_out().await;

    let auth = session(&mem);
    let profile = auth
        .login_with_email("dana@example.com", "password1")
        .await
        .unwrap();
    assert_eq!(profile.name, "dana");
    assert_eq!(profile.email, "dana@example.com");
    assert_eq!(auth.current_user_id(), Some(profile.uid.clone()));
}

#[tokio::test]
async fn wrong_password_is_reported() {
    let mem = MemoryBackend::new();
    init_test_data(&mem.backend(), &SyncConfig::default())
        .await
        .unwrap();
    let auth = session(&mem);

    let email = seed_email("alice").unwrap();
    assert!(auth.login_with_email(email, "wrong-pass").await.is_err());
    let state = auth.state();
    assert!(state.error.unwrap().starts_with("Login failed: "));
    assert_eq!(state.current_user, None);
    assert_eq!(auth.current_user_id(), None);

    let password = seed_password("alice").unwrap();
    let alice = auth.login_with_email(email, password).await.unwrap();
    assert_eq!(alice.name, "alice");
    assert_eq!(alice.bio, "Hello, I'm Alice!");
}

#[tokio::test]
async fn social_sign_in_creates_the_profile_once() {
    let mem = MemoryBackend::new();
    mem.identity.register_provider_account(
        "google-token",
        ProviderUser {
            uid: "g-123".into(),
            display_name: Some("Gil".into()),
            email: Some("gil@example.com".into()),
            photo_url: Some("https://img.example.com/gil.png".into()),
        },
    );
    let auth = session(&mem);
    let credential = ProviderCredential {
        provider: "google".into(),
        id_token: "google-token".into(),
    };

    let first = auth.login_with_credential(&credential).await.unwrap();
    assert_eq!(first.uid, "g-123");
    assert_eq!(first.name, "Gil");
    assert_eq!(first.profile_image_url, "https://img.example.com/gil.png");
    assert_eq!(mem.documents.call_count(StoreOp::Set), 1);

    // edits made since the first sign-in survive the next one
    let mut rename = serde_json::Map::new();
    rename.insert("name".into(), json!("Gilbert"));
    mem.documents.put_raw("users", "g-123", {
        let mut doc = mem.documents.document("users", "g-123").unwrap();
        doc.extend(rename);
        doc
    });
    let second = auth.login_with_credential(&credential).await.unwrap();
    assert_eq!(second.name, "Gilbert");
    assert_eq!(mem.documents.call_count(StoreOp::Set), 1);

    let bad = ProviderCredential {
        provider: "google".into(),
        id_token: "forged".into(),
    };
    assert!(auth.login_with_credential(&bad).await.is_err());
    assert!(auth
        .state()
        .error
        .unwrap()
        .starts_with("google sign-in failed: "));
}

#[tokio::test]
async fn auth_state_follows_the_identity_provider() {
    let mem = MemoryBackend::new();
    let users = init_test_data(&mem.backend(), &SyncConfig::default())
        .await
        .unwrap();
    let auth = session(&mem);
    auth.watch_auth_state();
    let mut rx = auth.watch_state();

    mem.identity.sign_in_as(&users["bob"]);
    let state = rx
        .wait_for(|s| s.current_user.is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(state.user_id.as_deref(), Some(users["bob"].as_str()));
    assert_eq!(state.current_user.unwrap().name, "bob");

    auth.sign_out().await;
    rx.wait_for(|s| s.user_id.is_none() && s.current_user.is_none())
        .await
        .unwrap();
    assert_eq!(mem.identity.current_user(), None);
    auth.shutdown();
}

#[tokio::test]
async fn dropping_the_session_stops_following_auth_state() {
    let mem = MemoryBackend::new();
    let users = init_test_data(&mem.backend(), &SyncConfig::default())
        .await
        .unwrap();
    let auth = session(&mem);
    auth.watch_auth_state();
    let rx = auth.watch_state();
    assert_eq!(mem.identity.auth_listeners(), 1);

    drop(auth);
    for _ in 0..100 {
        if mem.identity.auth_listeners() == 0 && rx.has_changed().is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(mem.identity.auth_listeners(), 0);
    assert!(rx.has_changed().is_err());

    mem.identity.sign_in_as(&users["bob"]);
    tokio::task::yield_now().await;
    assert_eq!(rx.borrow().user_id, None);
}

#[tokio::test]
async fn profile_edits_are_sanitized_and_saved() {
    let mem = MemoryBackend::new();
    let users = init_test_data(&mem.backend(), &SyncConfig::default())
        .await
        .unwrap();
    mem.identity.sign_in_as(&users["alice"]);
    let profile = ProfileEngine::new(mem.backend(), SyncConfig::default());

    let loaded = profile.load_current_user().await.unwrap();
    assert_eq!(loaded.name, "alice");

    profile
        .save_profile("  <b>Alice</b> ", "Writes about <script>x()</script>rust")
        .await
        .unwrap();
    let stored = mem.documents.document("users", &users["alice"]).unwrap();
    assert_eq!(stored["name"], json!("Alice"));
    assert_eq!(stored["bio"], json!("Writes about rust"));
    assert_eq!(profile.state().user.unwrap().name, "Alice");
    assert!(profile.take_saved());
    assert!(!profile.take_saved());

    assert!(profile.save_profile("   ", "bio").await.is_err());
    assert!(profile.state().error.is_some());
    profile.clear_error();
    assert_eq!(profile.state().error, None);
}

#[tokio::test]
async fn social_links_must_be_web_addresses() {
    let mem = MemoryBackend::new();
    let users = init_test_data(&mem.backend(), &SyncConfig::default())
        .await
        .unwrap();
    mem.identity.sign_in_as(&users["bob"]);
    let profile = ProfileEngine::new(mem.backend(), SyncConfig::default());

    let bad = BTreeMap::from([("github".to_string(), "javascript:alert(1)".to_string())]);
    let err = profile.update_social_links(bad).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidInput(_)));
    assert_eq!(profile.state().error.as_deref(), Some("Invalid link for github"));

    let good = BTreeMap::from([
        ("GitHub".to_string(), " https://github.com/bob ".to_string()),
        ("blog".to_string(), "".to_string()),
    ]);
    profile.update_social_links(good).await.unwrap();
    let stored = mem.documents.document("users", &users["bob"]).unwrap();
    assert_eq!(
        stored["socialLinks"],
        json!({ "github": "https://github.com/bob" })
    );
}

#[tokio::test]
async fn profile_image_upload_updates_the_profile_only() {
    let mem = MemoryBackend::new();
    let config = SyncConfig::default();
    let users = init_test_data(&mem.backend(), &config).await.unwrap();
    mem.identity.sign_in_as(&users["alice"]);
    let profile = ProfileEngine::new(mem.backend(), config.clone());
    profile.load_current_user().await.unwrap();

    let url = profile
        .upload_profile_image(ImageSource::Bytes(vec![1, 2, 3, 4]))
        .await
        .unwrap();
    let stored = fetch_profile(mem.documents.as_ref(), "users", &users["alice"])
        .await
        .unwrap();
    assert_eq!(stored.profile_image_url, url);
    assert_eq!(profile.state().user.unwrap().profile_image_url, url);

    // posts keep the author copy taken when they were written
    let posts = PostSyncEngine::new(mem.backend(), config);
    posts.load_my_posts().await.unwrap();
    assert!(posts
        .state()
        .my_posts()
        .iter()
        .all(|p| p.author.as_ref().unwrap().profile_image_url.is_empty()));

    mem.objects.fail_next("too large");
    assert!(profile
        .upload_profile_image(ImageSource::Bytes(vec![0; 8]))
        .await
        .is_err());
    assert_eq!(
        profile.state().error.as_deref(),
        Some("Upload failed: too large")
    );
}

#[tokio::test]
async fn profile_needs_a_signed_in_user() {
    let mem = MemoryBackend::new();
    let profile = ProfileEngine::new(mem.backend(), SyncConfig::default());
    let err = profile.load_current_user().await.unwrap_err();
    assert!(matches!(err, SyncError::NotSignedIn));
    assert_eq!(
        profile.state().error.as_deref(),
        Some("No authenticated user found.")
    );
}

#[tokio::test]
async fn full_session_like_reaches_the_author() {
    let mem = MemoryBackend::new();
    let config = SyncConfig::default();
    let users = init_test_data(&mem.backend(), &config).await.unwrap();
    let alice = users["alice"].clone();

    let inbox = NotificationSyncEngine::new(mem.backend(), config.clone());
    inbox.subscribe_for_user(&alice).await.unwrap();
    let mut rx = inbox.watch_state();

    let auth = session(&mem);
    auth.login_with_email(seed_email("bob").unwrap(), seed_password("bob").unwrap())
        .await
        .unwrap();

    let posts = PostSyncEngine::new(mem.backend(), config.clone());
    let mine = posts
        .create_post(PostDraft::new("Bob's trip", "Went hiking", BlogCategory::Travel))
        .await
        .unwrap();
    assert!(posts.take_post_saved());
    posts.refresh().await.unwrap();
    let state = posts.state();
    assert_eq!(state.all_posts().len(), 5);
    assert_eq!(state.my_posts()[0].id, mine.id);

    let target = state
        .all_posts()
        .into_iter()
        .find(|p| p.title == "Shipped it")
        .unwrap();
    posts.toggle_like(&target.id).await.unwrap();
    posts.wait_idle().await;

    let inbox_state = rx.wait_for(|s| s.unread_count == 1).await.unwrap().clone();
    let note = &inbox_state.notifications[0];
    assert_eq!(note.actor_user_id, users["bob"]);
    assert_eq!(note.post_title, "Shipped it");

    inbox.mark_as_read(&note.id).await.unwrap();
    rx.wait_for(|s| s.unread_count == 0).await.unwrap();
    assert_eq!(inbox.fetch_unread_count(&alice).await.unwrap(), 0);

    posts.delete_post(&mine.id).await.unwrap();
    let state = posts.state();
    assert!(!state.in_my_posts(&mine.id));
    assert_eq!(state.my_posts().len(), 1);
    inbox.shutdown();
}
