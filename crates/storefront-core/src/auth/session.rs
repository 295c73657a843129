//! Session store: the single writer of session state.
//!
//! Holds the current credential, the signed-in user, and the last error.
//! Every transition mirrors the credential into persistent storage and is
//! published on a broadcast channel so the renewal scheduler (and any UI)
//! can react without polling.
//!
//! A session epoch is bumped whenever a session ends or a new one starts.
//! Renewal completions carry the epoch they started under and are dropped if
//! it moved on, so a renewal that lands after logout can never bring the old
//! session back. Login attempts are numbered separately: starting a login
//! leaves the live session, and any renewal of it, untouched until the login
//! actually succeeds.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::{self, Clock};
use super::storage::{CredentialStorage, CREDENTIAL_KEY};
use super::termination::TerminationReason;
use super::token::Credential;
use crate::models::{Role, UserProfile};

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
    Renewing,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub credential: Option<Credential>,
    pub user: Option<UserProfile>,
    pub role: Role,
    pub last_error: Option<String>,
}

impl SessionState {
    /// A session is authenticated while it holds a credential, including
    /// while that credential is being renewed.
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
            && matches!(self.phase, SessionPhase::Authenticated | SessionPhase::Renewing)
    }
}

/// Serializable view of the session for UI layers. Never carries the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub is_authenticated: bool,
    pub user: Option<UserProfile>,
    pub role: Role,
    pub last_error: Option<String>,
    /// Credential expiry, seconds since the epoch.
    pub expires_at: Option<i64>,
}

/// Published on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn,
    Restored,
    LoginFailed { message: String },
    CredentialRenewed,
    RenewalFailed { message: String },
    ProfileLoaded,
    LoggedOut { reason: TerminationReason },
}

/// Identifies the session a renewal or request was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEpoch(u64);

/// Identifies one login attempt. A newer attempt or a logout supersedes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAttempt(u64);

#[derive(Default)]
struct Inner {
    state: SessionState,
    epoch: u64,
    login_seq: u64,
}

pub struct SessionStore {
    inner: RwLock<Inner>,
    storage: Arc<dyn CredentialStorage>,
    /// Serializes storage writes. Holds the credential last written, `None`
    /// until the first write.
    mirrored: Mutex<Option<Option<Credential>>>,
    events: broadcast::Sender<SessionEvent>,
    clock: Arc<dyn Clock>,
    skew: Duration,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn CredentialStorage>, clock: Arc<dyn Clock>, skew: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            storage,
            mirrored: Mutex::new(None),
            events,
            clock,
            skew,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }

    pub fn state(&self) -> SessionState {
        self.read().state.clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.read().state.credential.clone()
    }

    /// The current credential together with the session it belongs to.
    pub fn current(&self) -> (Option<Credential>, SessionEpoch) {
        let inner = self.read();
        (inner.state.credential.clone(), SessionEpoch(inner.epoch))
    }

    pub fn epoch(&self) -> SessionEpoch {
        SessionEpoch(self.read().epoch)
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().state.is_authenticated()
    }

    /// True when there is no credential or it is expired right now.
    pub fn credential_expired(&self) -> bool {
        clock::is_expired(self.credential().as_ref(), self.skew, self.clock.now())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.read();
        let state = &inner.state;
        SessionSnapshot {
            phase: state.phase,
            is_authenticated: state.is_authenticated(),
            user: state.user.clone(),
            role: state.role,
            last_error: state.last_error.clone(),
            expires_at: state
                .credential
                .as_ref()
                .and_then(Credential::expires_at)
                .map(|t| t.timestamp()),
        }
    }

    /// Bring persistent storage in line with the current credential.
    ///
    /// Runs after the state lock is released. The credential is re-read while
    /// holding the storage lock, so whichever transition writes last writes
    /// the latest state.
    fn sync_storage(&self) {
        let mut mirrored = self.mirrored.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.credential();
        if mirrored.as_ref() == Some(&current) {
            return;
        }

        let result = match &current {
            Some(credential) => self.storage.set(CREDENTIAL_KEY, credential.as_str()),
            None => self.storage.remove(CREDENTIAL_KEY),
        };
        match result {
            Ok(()) => *mirrored = Some(current),
            Err(e) => warn!(error = %e, "Failed to mirror credential to storage"),
        }
    }

    fn discard_persisted(&self) {
        let mut mirrored = self.mirrored.lock().unwrap_or_else(PoisonError::into_inner);
        match self.storage.remove(CREDENTIAL_KEY) {
            Ok(()) => *mirrored = Some(None),
            Err(e) => warn!(error = %e, "Failed to clear persisted credential"),
        }
    }

    /// Role from the profile when known, otherwise from the token's claim.
    fn role_for(credential: &Credential, user: Option<&UserProfile>) -> Role {
        if let Some(role) = user.and_then(|u| u.role) {
            return role;
        }
        credential
            .claims()
            .ok()
            .and_then(|c| c.role)
            .map(|r| Role::from_claim(&r))
            .unwrap_or(Role::Customer)
    }

    /// Hydrate from the persisted credential if it is still valid.
    ///
    /// Returns true when the session was restored. A persisted credential
    /// that has already expired is discarded.
    pub fn restore(&self) -> bool {
        if self.read().state.phase != SessionPhase::Anonymous {
            return false;
        }

        let stored = match self.storage.get(CREDENTIAL_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted credential");
                return false;
            }
        };
        let Some(token) = stored else {
            debug!("No persisted credential");
            return false;
        };

        let credential = Credential::new(token);
        if clock::is_expired(Some(&credential), self.skew, self.clock.now()) {
            info!("Persisted credential expired, discarding");
            self.discard_persisted();
            return false;
        }

        let mut inner = self.write();
        if inner.state.phase != SessionPhase::Anonymous {
            return false;
        }
        inner.epoch += 1;
        inner.state = SessionState {
            phase: SessionPhase::Authenticated,
            role: Self::role_for(&credential, None),
            credential: Some(credential),
            user: None,
            last_error: None,
        };
        drop(inner);

        info!("Session restored from persisted credential");
        self.publish(SessionEvent::Restored);
        true
    }

    /// Start a login attempt.
    ///
    /// A live session stays authenticated (and keeps renewing) until the
    /// attempt succeeds.
    pub fn begin_login(&self) -> LoginAttempt {
        let mut inner = self.write();
        inner.login_seq += 1;
        if !inner.state.is_authenticated() {
            inner.state.phase = SessionPhase::Authenticating;
        }
        inner.state.last_error = None;
        LoginAttempt(inner.login_seq)
    }

    /// Returns false if the login was superseded.
    pub fn login_succeeded(
        &self,
        attempt: LoginAttempt,
        credential: Credential,
        user: Option<UserProfile>,
    ) -> bool {
        let mut inner = self.write();
        if inner.login_seq != attempt.0 {
            debug!("Discarding superseded login");
            return false;
        }

        inner.login_seq += 1;
        inner.epoch += 1;
        inner.state = SessionState {
            phase: SessionPhase::Authenticated,
            role: Self::role_for(&credential, user.as_ref()),
            credential: Some(credential),
            user,
            last_error: None,
        };
        drop(inner);

        self.sync_storage();
        info!("Login successful");
        self.publish(SessionEvent::LoggedIn);
        true
    }

    pub fn login_failed(&self, attempt: LoginAttempt, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.write();
        if inner.login_seq != attempt.0 {
            return;
        }

        // A failed re-login leaves an existing session in place
        if inner.state.phase == SessionPhase::Authenticating {
            inner.state.phase = SessionPhase::Anonymous;
        }
        inner.state.last_error = Some(message.clone());
        drop(inner);

        self.publish(SessionEvent::LoginFailed { message });
    }

    pub fn begin_renewal(&self) -> SessionEpoch {
        let mut inner = self.write();
        if inner.state.phase == SessionPhase::Authenticated {
            inner.state.phase = SessionPhase::Renewing;
        }
        SessionEpoch(inner.epoch)
    }

    /// Enter `Renewing` only if `epoch` is still the live session.
    pub fn begin_renewal_for(&self, epoch: SessionEpoch) -> bool {
        let mut inner = self.write();
        if inner.epoch != epoch.0 {
            return false;
        }
        if inner.state.phase == SessionPhase::Authenticated {
            inner.state.phase = SessionPhase::Renewing;
        }
        true
    }

    /// Replace the credential. User and role are left alone.
    ///
    /// Returns false if the session ended while the renewal was in flight.
    pub fn renewal_succeeded(&self, epoch: SessionEpoch, credential: Credential) -> bool {
        let mut inner = self.write();
        if inner.epoch != epoch.0 {
            debug!("Discarding renewal for an ended session");
            return false;
        }

        if inner.state.user.is_none() {
            inner.state.role = Self::role_for(&credential, None);
        }
        inner.state.credential = Some(credential);
        if inner.state.phase == SessionPhase::Renewing {
            inner.state.phase = SessionPhase::Authenticated;
        }
        inner.state.last_error = None;
        drop(inner);

        self.sync_storage();
        debug!("Credential renewed");
        self.publish(SessionEvent::CredentialRenewed);
        true
    }

    /// Record a renewal failure that does not end the session.
    pub fn renewal_failed(&self, epoch: SessionEpoch, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.write();
        if inner.epoch != epoch.0 {
            return;
        }

        if inner.state.phase == SessionPhase::Renewing {
            inner.state.phase = SessionPhase::Authenticated;
        }
        inner.state.last_error = Some(message.clone());
        drop(inner);

        self.publish(SessionEvent::RenewalFailed { message });
    }

    pub fn profile_loaded(&self, user: UserProfile) -> bool {
        let mut inner = self.write();
        if !inner.state.is_authenticated() {
            return false;
        }

        if let Some(role) = user.role {
            inner.state.role = role;
        }
        inner.state.user = Some(user);
        drop(inner);

        self.publish(SessionEvent::ProfileLoaded);
        true
    }

    /// True while the session `epoch` was issued for is still the live one.
    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        self.read().epoch == epoch.0
    }

    /// Clear the persisted credential and reset to `Anonymous`.
    ///
    /// Idempotent. Returns true only when a live session was actually ended.
    /// A pending login attempt is abandoned too.
    pub fn end_session(&self, reason: TerminationReason) -> bool {
        self.end(None, reason)
    }

    /// Like [`end_session`](Self::end_session), but only if `epoch` is still
    /// the current session.
    pub fn end_session_for(&self, epoch: SessionEpoch, reason: TerminationReason) -> bool {
        self.end(Some(epoch), reason)
    }

    fn end(&self, epoch: Option<SessionEpoch>, reason: TerminationReason) -> bool {
        let mut inner = self.write();
        if epoch.is_some_and(|e| e.0 != inner.epoch) {
            return false;
        }
        let was_live =
            inner.state.credential.is_some() || inner.state.phase != SessionPhase::Anonymous;

        inner.state = SessionState::default();
        inner.epoch += 1;
        inner.login_seq += 1;
        drop(inner);

        self.sync_storage();
        if was_live {
            info!(reason = reason.code(), "Session ended");
            self.publish(SessionEvent::LoggedOut { reason });
        }
        was_live
    }
}
