use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::helpers::email_local_part;
use crate::core::scope::TaskScope;
use crate::models::models::UserProfile;
use crate::remote::{Backend, ProviderCredential};
use crate::users::{create_profile, fetch_profile};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    /// Identity of the signed-in user, as reported by the identity provider.
    pub user_id: Option<String>,
    /// Profile document of that user, once loaded.
    pub current_user: Option<UserProfile>,
    pub is_loading: bool,
    pub error: Option<String>,
}

struct AuthInner {
    backend: Backend,
    config: SyncConfig,
    state: watch::Sender<AuthState>,
    scope: TaskScope,
}

/// Sign-up, sign-in and sign-out, plus a live view of who is signed in.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<AuthInner>,
    _owner: Option<Arc<DropGuard>>,
}

impl AuthSession {
    pub fn new(backend: Backend, config: SyncConfig) -> Self {
        let user_id = backend.current_user();
        let (state, _) = watch::channel(AuthState {
            user_id,
            ..AuthState::default()
        });
        let scope = TaskScope::new();
        let owner = Arc::new(scope.owner_guard());
        Self {
            inner: Arc::new(AuthInner {
                backend,
                config,
                state,
                scope,
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

    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.inner.backend.current_user()
    }

    /// Stops the auth-state listener and any in-flight call.
    pub fn shutdown(&self) {
        self.inner.scope.cancel();
    }

    fn fail(&self, message: String) {
        warn!(%message, "auth operation failed");
        self.inner.state.send_modify(|s| {
            s.is_loading = false;
            s.error = Some(message);
        });
    }

    /// Follows the identity provider's auth stream for the lifetime of the
    /// session: each sign-in loads the profile, each sign-out clears it.
    /// Dropping the last session handle ends the listener.
    pub fn watch_auth_state(&self) {
        let session = self.worker();
        let mut states = self.inner.backend.identity.auth_state();
        self.inner.scope.spawn_listener(async move {
            while let Some(user_id) = states.next().await {
                debug!(?user_id, "auth state changed");
                session.inner.state.send_modify(|s| s.user_id = user_id.clone());
                match user_id {
                    Some(uid) => session.load_profile(&uid).await,
                    None => session.inner.state.send_modify(|s| s.current_user = None),
                }
            }
        });
    }

    async fn load_profile(&self, uid: &str) {
        self.inner.state.send_modify(|s| s.is_loading = true);
        match fetch_profile(
            self.inner.backend.documents.as_ref(),
            &self.inner.config.users_collection,
            uid,
        )
        .await
        {
            Ok(profile) => self.inner.state.send_modify(|s| {
                s.current_user = Some(profile);
                s.is_loading = false;
            }),
            Err(SyncError::NotFound(_)) => self.inner.state.send_modify(|s| {
                s.current_user = None;
                s.is_loading = false;
            }),
            Err(e) => self.fail(format!("Failed to load user: {}", e.detail())),
        }
    }

    /// Registers a new account and writes its profile document.
    pub async fn sign_up_with_email(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> SyncResult<UserProfile> {
        self.inner
            .scope
            .run(self.sign_up_inner(name, email, password))
            .await?
    }

    async fn sign_up_inner(&self, name: &str, email: &str, password: &str) -> SyncResult<UserProfile> {
        self.inner.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
        });
        let uid = match self
            .inner
            .backend
            .identity
            .sign_up_with_email(email, password)
            .await
        {
            Ok(uid) => uid,
            Err(e) => {
                self.fail(format!("Sign up failed: {}", e));
                return Err(e.into());
            }
        };

        let profile = UserProfile::new(&uid, name.trim(), email.trim());
        if let Err(e) = create_profile(
            self.inner.backend.documents.as_ref(),
            &self.inner.config.users_collection,
            &profile,
        )
        .await
        {
            self.fail(format!("Sign up failed: {}", e.detail()));
            return Err(e);
        }

        info!(uid = %uid, "account created");
        self.signed_in(profile.clone());
        Ok(profile)
    }

    /// Signs in and reads the profile; a profile without a name falls back to
    /// the local part of the email address.
    pub async fn login_with_email(&self, email: &str, password: &str) -> SyncResult<UserProfile> {
        self.inner.scope.run(self.login_inner(email, password)).await?
    }

    async fn login_inner(&self, email: &str, password: &str) -> SyncResult<UserProfile> {
        self.inner.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
        });
        let uid = match self
            .inner
            .backend
            .identity
            .sign_in_with_email(email, password)
            .await
        {
            Ok(uid) => uid,
            Err(e) => {
                self.fail(format!("Login failed: {}", e));
                return Err(e.into());
            }
        };

        let mut profile = match fetch_profile(
            self.inner.backend.documents.as_ref(),
            &self.inner.config.users_collection,
            &uid,
        )
        .await
        {
            Ok(profile) => profile,
            Err(SyncError::NotFound(_)) => UserProfile {
                uid: uid.clone(),
                email: email.trim().to_string(),
                ..UserProfile::default()
            },
            Err(e) => {
                self.fail(format!("Login failed: {}", e.detail()));
                return Err(e);
            }
        };
        if profile.name.is_empty() {
            profile.name = email_local_part(email.trim()).to_string();
        }
        if profile.email.is_empty() {
            profile.email = email.trim().to_string();
        }

        self.signed_in(profile.clone());
        Ok(profile)
    }

    /// Social sign-in. The profile document is created on the first sign-in
    /// only; later sign-ins leave it untouched.
    pub async fn login_with_credential(
        &self,
        credential: &ProviderCredential,
    ) -> SyncResult<UserProfile> {
        self.inner.scope.run(self.credential_inner(credential)).await?
    }

    async fn credential_inner(&self, credential: &ProviderCredential) -> SyncResult<UserProfile> {
        self.inner.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
        });
        let account = match self
            .inner
            .backend
            .identity
            .sign_in_with_credential(credential)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                self.fail(format!("{} sign-in failed: {}", credential.provider, e));
                return Err(e.into());
            }
        };

        let documents = self.inner.backend.documents.as_ref();
        let users = &self.inner.config.users_collection;
        let profile = match fetch_profile(documents, users, &account.uid).await {
            Ok(existing) => existing,
            Err(SyncError::NotFound(_)) => {
                let mut fresh = UserProfile::new(
                    &account.uid,
                    account.display_name.as_deref().unwrap_or_default(),
                    account.email.as_deref().unwrap_or_default(),
                );
                fresh.profile_image_url = account.photo_url.clone().unwrap_or_default();
                if let Err(e) = create_profile(documents, users, &fresh).await {
                    self.fail(format!("{} sign-in failed: {}", credential.provider, e.detail()));
                    return Err(e);
                }
                info!(uid = %account.uid, provider = %credential.provider, "profile created on first sign-in");
                fresh
            }
            Err(e) => {
                self.fail(format!("{} sign-in failed: {}", credential.provider, e.detail()));
                return Err(e);
            }
        };

        self.signed_in(profile.clone());
        Ok(profile)
    }

    fn signed_in(&self, profile: UserProfile) {
        self.inner.state.send_modify(|s| {
            s.user_id = Some(profile.uid.clone());
            s.current_user = Some(profile);
            s.is_loading = false;
        });
    }

    pub async fn sign_out(&self) {
        self.inner.backend.identity.sign_out().await;
        self.inner.state.send_modify(|s| {
            s.user_id = None;
            s.current_user = None;
        });
    }
}
