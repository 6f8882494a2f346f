//! Public session façade.
//!
//! `SessionContext` owns the session state consumed by route guards and
//! views, and is the only place that logs users in and out. Everything it
//! sends goes through the shared `RequestPipeline`.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, HttpTransport, RequestPipeline, Transport};
use crate::auth::{
    CredentialStore, FileStore, KeyValueStore, KeyringStore, MemoryStore, RefreshCoordinator, StorageScope,
};
use crate::config::{Config, Endpoints, APP_NAME};
use crate::events::{self, SessionEvent};
use crate::models::auth::LoginBody;
use crate::models::{AuthResponse, LoginCredentials, RegistrationData, SubscriptionStatus, UserProfile};

use super::AuthError;

/// Message shown after an unrecoverable session failure
pub const SESSION_EXPIRED_MESSAGE: &str = "session expired";

/// File name of the persistent credential store inside the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub user: Option<UserProfile>,
    pub loading: bool,
    pub error: Option<String>,
}

impl SessionState {
    fn expired() -> Self {
        Self {
            user: None,
            loading: false,
            error: Some(SESSION_EXPIRED_MESSAGE.to_string()),
        }
    }
}

pub struct SessionContext {
    pipeline: RequestPipeline,
    store: CredentialStore,
    endpoints: Endpoints,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionContext {
    /// Wire up the full session stack. Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, store: CredentialStore, endpoints: Endpoints) -> Self {
        let events = events::channel();
        let coordinator =
            RefreshCoordinator::new(Arc::clone(&transport), store.clone(), endpoints.refresh.clone(), events.clone());
        let pipeline = RequestPipeline::new(
            transport,
            store.clone(),
            coordinator,
            events.clone(),
            [endpoints.login.clone(), endpoints.register.clone()],
        );
        let (state, _) = watch::channel(SessionState::default());
        let state = Arc::new(state);

        spawn_invalidation_listener(events.subscribe(), Arc::clone(&state), store.clone());

        Self {
            pipeline,
            store,
            endpoints,
            events,
            state,
        }
    }

    /// Build an HTTP-backed context from the client configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(config.api_base_url.clone(), config.request_timeout_secs)?;
        let persistent: Arc<dyn KeyValueStore> = if config.use_keyring {
            Arc::new(KeyringStore::new(APP_NAME))
        } else {
            Arc::new(FileStore::open(config.data_dir()?.join(CREDENTIALS_FILE)))
        };
        let store = CredentialStore::new(persistent, Arc::new(MemoryStore::new()));
        Ok(Self::new(Arc::new(transport), store, config.endpoints.clone()))
    }

    // ===== State =====

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Invalidation and forced-redirect notifications
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Pipeline for presentation-layer requests
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().user.is_some()
    }

    fn expire_session(&self) {
        self.store.clear();
        self.state.send_replace(SessionState::expired());
    }

    fn set_user(&self, user: UserProfile) {
        if let Err(e) = self.store.save_profile(&user) {
            warn!(error = %e, "Failed to cache profile");
        }
        self.state.send_modify(|state| {
            state.user = Some(user);
            state.loading = false;
            state.error = None;
        });
    }

    // ===== Startup =====

    /// Resolve the session from stored credentials. Shows the cached
    /// profile right away, then reconciles it with the server.
    pub async fn initialize(&self) {
        let cached = self.store.load_profile();
        debug!(has_cached_profile = cached.is_some(), "Resolving stored session");
        self.state.send_modify(|state| {
            state.loading = true;
            if cached.is_some() {
                state.user = cached;
            }
        });
        self.fetch_user().await;
    }

    // ===== Login / Registration =====

    pub async fn login(
        &self,
        credentials: &LoginCredentials,
        remember_me: bool,
    ) -> Result<UserProfile, AuthError> {
        self.begin_auth();
        let result = match self.login_once(credentials, remember_me, true).await {
            Err(AuthError::BotVerificationFailure) if credentials.bot_verification_token.is_some() => {
                info!("Bot verification failed, retrying login without verification token");
                self.login_once(credentials, remember_me, false).await
            }
            other => other,
        };

        match result {
            Ok(response) => self.establish(response, StorageScope::from_remember_me(remember_me)).await,
            Err(e) => Err(self.fail_auth(e)),
        }
    }

    pub async fn register(&self, data: &RegistrationData) -> Result<UserProfile, AuthError> {
        self.begin_auth();
        let result = async {
            let request = ApiRequest::post(self.endpoints.register.clone()).with_json(data)?;
            let response = self.pipeline.send(request).await.map_err(AuthError::from_login)?;
            let response: AuthResponse = response.json()?;
            Ok::<_, AuthError>(response)
        }
        .await;

        match result {
            Ok(response) => self.establish(response, StorageScope::Persistent).await,
            Err(e) => Err(self.fail_auth(e)),
        }
    }

    async fn login_once(
        &self,
        credentials: &LoginCredentials,
        remember_me: bool,
        with_bot_token: bool,
    ) -> Result<AuthResponse, AuthError> {
        let body = LoginBody {
            identifier: &credentials.identifier,
            secret: &credentials.secret,
            remember_me,
            bot_verification_token: credentials
                .bot_verification_token
                .as_deref()
                .filter(|_| with_bot_token),
        };
        let request = ApiRequest::post(self.endpoints.login.clone()).with_json(&body)?;
        let response = self.pipeline.send(request).await.map_err(AuthError::from_login)?;
        Ok(response.json()?)
    }

    fn begin_auth(&self) {
        self.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });
    }

    fn fail_auth(&self, error: AuthError) -> AuthError {
        warn!(error = %error, "Authentication failed");
        self.state.send_modify(|state| {
            state.loading = false;
            state.error = Some(error.to_string());
        });
        error
    }

    async fn establish(&self, response: AuthResponse, scope: StorageScope) -> Result<UserProfile, AuthError> {
        if let Err(e) = self.store.save(&response.credentials(), scope) {
            return Err(self.fail_auth(AuthError::Storage(e.to_string())));
        }
        info!(user = %response.user.display_name(), %scope, "Signed in");

        let user = response.user;
        if let Err(e) = self.store.save_profile(&user) {
            warn!(error = %e, "Failed to cache profile");
        }
        self.state.send_modify(|state| state.user = Some(user));

        // Login responses may omit profile fields
        match self.reload_user().await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(self.fail_auth(AuthError::AuthorizationFailure)),
            Err(e) => Err(self.fail_auth(e)),
        }
    }

    // ===== Logout =====

    /// Sign out locally no matter what the server says.
    pub async fn logout(&self) {
        let mut request = ApiRequest::post(self.endpoints.logout.clone());
        // Never refresh just to say goodbye
        request.retried = true;
        if let Err(e) = self.pipeline.send(request).await {
            warn!(error = %e, "Remote logout failed, clearing local session anyway");
        }

        self.store.clear();
        self.state.send_replace(SessionState::default());
        info!("Signed out");
    }

    // ===== Profile =====

    /// Reload the profile. Any failure that survives the pipeline's
    /// refresh-and-retry ends the session.
    pub async fn fetch_user(&self) {
        // Failures are already reflected in the session state
        let _ = self.reload_user().await;
    }

    /// `Ok(None)` when logged out.
    async fn reload_user(&self) -> Result<Option<UserProfile>, AuthError> {
        if self.store.load().is_none() {
            debug!("No stored credentials, session is logged out");
            self.state.send_replace(SessionState::default());
            return Ok(None);
        }

        match self.pipeline.get_json::<UserProfile>(&self.endpoints.profile).await {
            Ok(user) => {
                self.set_user(user.clone());
                Ok(Some(user))
            }
            Err(e) => {
                let error = AuthError::from(e);
                if matches!(error, AuthError::SessionChanged) {
                    // Whoever replaced the session owns the state now
                    debug!("Session changed while loading profile");
                } else {
                    warn!(error = %error, "Failed to load profile, ending session");
                    self.expire_session();
                }
                Err(error)
            }
        }
    }

    /// Lightweight probe for route guards.
    pub async fn check_auth_status(&self) -> bool {
        if self.store.load().is_none() {
            return false;
        }

        match self.pipeline.get_json::<UserProfile>(&self.endpoints.profile).await {
            Ok(user) => {
                self.set_user(user);
                true
            }
            Err(e) => {
                let error = AuthError::from(e);
                if error.is_fatal() {
                    warn!(error = %error, "Auth probe failed, ending session");
                    self.expire_session();
                } else {
                    debug!(error = %error, "Auth probe inconclusive");
                }
                false
            }
        }
    }

    // ===== Derived subscription facts =====

    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.state
            .borrow()
            .user
            .as_ref()
            .map(UserProfile::subscription_status)
            .unwrap_or(SubscriptionStatus::Inactive)
    }

    pub fn has_active_subscription(&self) -> bool {
        self.subscription_status().is_active()
    }

    pub fn is_subscription_expiring_soon(&self) -> bool {
        self.subscription_status() == SubscriptionStatus::ExpiringSoon
    }

    pub fn remaining_subscription_days(&self) -> u32 {
        self.state
            .borrow()
            .user
            .as_ref()
            .map(UserProfile::remaining_subscription_days)
            .unwrap_or(0)
    }
}

/// Apply the logout cascade when the coordinator gives up on a refresh.
fn spawn_invalidation_listener(
    mut rx: broadcast::Receiver<SessionEvent>,
    state: Arc<watch::Sender<SessionState>>,
    store: CredentialStore,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Invalidated(reason)) => {
                    // A fresh login may already have replaced the cleared credentials
                    if store.load().is_none() {
                        info!(reason = %reason, "Session invalidated");
                        state.send_replace(SessionState::expired());
                    }
                }
                Ok(SessionEvent::ForcedRedirect(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event listener lagged");
                    if store.load().is_none() && state.borrow().user.is_some() {
                        state.send_replace(SessionState::expired());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
