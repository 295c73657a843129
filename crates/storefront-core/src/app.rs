//! Application composition root.
//!
//! `App` builds the session stack once (store, terminator, scheduler,
//! interceptor, clients) and exposes the operations a host shell needs.
//! Nothing in the stack is global; everything hangs off this value.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{
    ApiClient, ApiError, AuthEndpoints, AuthError, AuthInterceptor, AuthSession, HttpTransport,
    ReqwestTransport,
};
use crate::auth::clock::{self, Clock, SystemClock};
use crate::auth::guard::{self, GuardDecision, RouteAccess};
use crate::auth::scheduler::{RenewalOutcome, RenewalScheduler, RenewalTimer};
use crate::auth::session::{SessionEvent, SessionSnapshot, SessionStore};
use crate::auth::storage::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage};
use crate::auth::termination::{LogNotifier, Notifier, SessionTerminator, TerminationReason};
use crate::config::{Config, StorageKind};
use crate::models::{ProviderIdentity, RegisterRequest, UserProfile};

pub struct App {
    config: Config,
    clock: Arc<dyn Clock>,
    store: Arc<SessionStore>,
    auth: AuthEndpoints,
    terminator: Arc<SessionTerminator>,
    scheduler: Arc<RenewalScheduler>,
    api: ApiClient,
}

impl App {
    /// Wire the session stack. Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        storage: Arc<dyn CredentialStorage>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(
            storage,
            clock.clone(),
            config.expiry_skew(),
        ));
        let timer = Arc::new(RenewalTimer::default());
        let terminator = Arc::new(SessionTerminator::new(
            store.clone(),
            timer.clone(),
            notifier,
        ));
        let auth = AuthEndpoints::new(transport.clone());
        let scheduler = RenewalScheduler::new(
            store.clone(),
            auth.clone(),
            terminator.clone(),
            timer,
            config.renewal_policy(),
        );
        let interceptor = Arc::new(AuthInterceptor::new(
            transport,
            store.clone(),
            scheduler.clone(),
            terminator.clone(),
        ));

        Self {
            config,
            clock,
            store,
            auth,
            terminator,
            scheduler,
            api: ApiClient::new(interceptor),
        }
    }

    /// Production wiring: reqwest transport, configured storage, system clock,
    /// notices to the log.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::from_config_with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn from_config_with_notifier(config: Config, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            &config.api_base_url,
            config.request_timeout(),
        )?);
        let storage = Self::storage_for(&config)?;
        Ok(Self::new(
            config,
            transport,
            storage,
            notifier,
            Arc::new(SystemClock),
        ))
    }

    fn storage_for(config: &Config) -> Result<Arc<dyn CredentialStorage>> {
        Ok(match config.storage {
            StorageKind::File => Arc::new(FileStorage::new(config.cache_dir()?)),
            StorageKind::Keyring => Arc::new(KeyringStorage::new()),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RenewalScheduler> {
        &self.scheduler
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.subscribe()
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Pick up a persisted session. The scheduler arms on the resulting event.
    pub fn restore(&self) -> bool {
        self.store.restore()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        self.sign_in(self.auth.login(email, password)).await
    }

    /// Sign in with the result of an external identity-provider flow.
    pub async fn login_with_identity(&self, identity: &ProviderIdentity) -> Result<(), AuthError> {
        self.sign_in(self.auth.login_with_identity(identity)).await
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<(), AuthError> {
        let request = RegisterRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        self.sign_in(self.auth.register(&request)).await
    }

    async fn sign_in<F>(&self, call: F) -> Result<(), AuthError>
    where
        F: Future<Output = Result<AuthSession, AuthError>>,
    {
        let attempt = self.store.begin_login();
        let session = match call.await.and_then(|s| self.check_fresh(s)) {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Login failed");
                self.store.login_failed(attempt, e.user_message());
                return Err(e);
            }
        };

        let has_profile = session.user.is_some();
        if !self
            .store
            .login_succeeded(attempt, session.credential, session.user)
        {
            debug!("Login superseded by a newer one");
            return Ok(());
        }

        if !has_profile {
            if let Err(e) = self.fetch_profile().await {
                warn!(error = %e, "Failed to load profile after login");
            }
        }
        Ok(())
    }

    fn check_fresh(&self, session: AuthSession) -> Result<AuthSession, AuthError> {
        if clock::is_expired(
            Some(&session.credential),
            self.config.expiry_skew(),
            self.clock.now(),
        ) {
            return Err(AuthError::ExpiredCredential);
        }
        Ok(session)
    }

    /// Load the profile into the session.
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let profile = self.api.fetch_profile().await?;
        self.store.profile_loaded(profile.clone());
        Ok(profile)
    }

    /// End the session locally, then tell the server on a best-effort basis.
    pub async fn logout(&self) {
        let credential = self.store.credential();
        self.terminator
            .terminate(TerminationReason::UserLogout, true);

        if credential.is_some() {
            if let Err(e) = self.auth.logout(credential.as_ref()).await {
                warn!(error = %e, "Server logout failed");
            }
        }
        info!("Logged out");
    }

    /// Call when the host comes back to the foreground.
    pub async fn on_foreground(&self) -> Option<RenewalOutcome> {
        self.scheduler.on_foreground().await
    }

    pub fn authorize(&self, access: RouteAccess) -> GuardDecision {
        guard::authorize(
            &self.store.state(),
            access,
            self.clock.now(),
            self.config.expiry_skew(),
        )
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
