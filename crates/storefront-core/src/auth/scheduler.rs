//! Proactive credential renewal.
//!
//! The scheduler keeps one cancellable timer that fires `lead` before the
//! credential expires and renews it. It listens to session events to re-arm
//! after login, restore, or renewal and to disarm on logout.
//!
//! Renewals are single-flight per session: at most one refresh call is
//! outstanding for the live session. The pending renewal is a shared future,
//! so the timer, a 401'd request, and a foreground check all observe the same
//! outcome instead of racing. A renewal left over from a session that has
//! since ended is never handed to the next session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock;
use super::session::{SessionEpoch, SessionEvent, SessionStore};
use super::termination::{SessionTerminator, TerminationReason};
use super::token::Credential;
use crate::api::{ApiError, AuthEndpoints};

/// Renew this long before the credential expires.
pub const DEFAULT_RENEWAL_LEAD: Duration = Duration::from_secs(120);

/// Wait this long before retrying a timer renewal that failed transiently.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenewalError {
    /// Network, 5xx, or rate limiting. The session is kept.
    #[error("Renewal failed, will retry: {0}")]
    Transient(String),

    /// The server refused to renew; the session has been terminated.
    #[error("Renewal rejected: {reason}")]
    Rejected { reason: TerminationReason },

    /// The session ended while the renewal was in flight.
    #[error("Session ended during renewal")]
    SessionEnded,
}

pub type RenewalOutcome = Result<Credential, RenewalError>;

type SharedRenewal = Shared<BoxFuture<'static, RenewalOutcome>>;

#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    pub lead: Duration,
    pub retry_delay: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            lead: DEFAULT_RENEWAL_LEAD,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Handle to the single pending renewal timer.
///
/// Shared between the scheduler and the terminator so termination can
/// disarm synchronously.
#[derive(Debug, Default)]
pub struct RenewalTimer {
    slot: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl RenewalTimer {
    fn slot(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new timer token, cancelling the previous one.
    pub fn replace(&self, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.slot().replace((id, token)) {
            previous.cancel();
        }
        id
    }

    pub fn cancel(&self) {
        if let Some((_, token)) = self.slot().take() {
            token.cancel();
        }
    }

    /// Forget timer `id` once it has fired, unless it was already replaced.
    fn clear(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|(_, token)| !token.is_cancelled())
    }
}

pub struct RenewalScheduler {
    store: Arc<SessionStore>,
    auth: AuthEndpoints,
    terminator: Arc<SessionTerminator>,
    timer: Arc<RenewalTimer>,
    in_flight: Mutex<Option<InFlight>>,
    next_renewal: AtomicU64,
    policy: RenewalPolicy,
    shutdown: CancellationToken,
    this: Weak<RenewalScheduler>,
}

/// The pending renewal and the session it was started for.
struct InFlight {
    id: u64,
    epoch: SessionEpoch,
    renewal: SharedRenewal,
}

/// Clears the in-flight slot when the renewal task finishes, however it ends.
struct InFlightGuard {
    scheduler: Arc<RenewalScheduler>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slot = self.scheduler.in_flight();
        if slot.as_ref().is_some_and(|pending| pending.id == self.id) {
            *slot = None;
        }
    }
}

impl RenewalScheduler {
    /// Build the scheduler and start listening to session events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: Arc<SessionStore>,
        auth: AuthEndpoints,
        terminator: Arc<SessionTerminator>,
        timer: Arc<RenewalTimer>,
        policy: RenewalPolicy,
    ) -> Arc<Self> {
        let events = store.subscribe();
        let scheduler = Arc::new_cyclic(|this| Self {
            store,
            auth,
            terminator,
            timer,
            in_flight: Mutex::new(None),
            next_renewal: AtomicU64::new(0),
            policy,
            shutdown: CancellationToken::new(),
            this: this.clone(),
        });
        Self::spawn_listener(
            Arc::downgrade(&scheduler),
            events,
            scheduler.shutdown.clone(),
        );
        scheduler
    }

    fn spawn_listener(
        this: Weak<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(scheduler) = this.upgrade() else {
                    break;
                };

                match event {
                    Ok(SessionEvent::LoggedIn | SessionEvent::Restored | SessionEvent::CredentialRenewed) => {
                        // A queued event may trail a logout
                        if scheduler.store.is_authenticated() {
                            scheduler.arm();
                        }
                    }
                    Ok(SessionEvent::LoggedOut { .. }) => scheduler.disarm(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Renewal listener lagged, resyncing");
                        if scheduler.store.is_authenticated() {
                            scheduler.arm();
                        } else {
                            scheduler.disarm();
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Renewal listener stopped");
        });
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)schedule the renewal timer for the current credential.
    ///
    /// An absent or expired credential is renewed right away; otherwise the
    /// timer fires `lead` before expiry.
    pub fn arm(&self) {
        let credential = self.store.credential();
        let now = self.store.clock().now();
        let delay = if clock::is_expired(credential.as_ref(), self.store.skew(), now) {
            Duration::ZERO
        } else {
            clock::time_until_expiry(credential.as_ref(), now).saturating_sub(self.policy.lead)
        };
        debug!(delay_secs = delay.as_secs(), "Arming renewal timer");
        self.schedule(delay);
    }

    pub fn disarm(&self) {
        self.timer.cancel();
        debug!("Renewal timer disarmed");
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn is_renewing(&self) -> bool {
        self.in_flight().is_some()
    }

    fn schedule(&self, delay: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let token = self.shutdown.child_token();
        let id = self.timer.replace(token.clone());
        let this = self.this.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(scheduler) = this.upgrade() else {
                return;
            };

            debug!("Renewal timer fired");
            let outcome = scheduler.join_renewal().await;
            scheduler.timer.clear(id);

            // Success re-arms through the CredentialRenewed event
            if token.is_cancelled() || !scheduler.store.is_authenticated() {
                return;
            }
            match outcome {
                Err(RenewalError::Transient(_)) => {
                    debug!(
                        retry_secs = scheduler.policy.retry_delay.as_secs(),
                        "Scheduling renewal retry"
                    );
                    scheduler.schedule(scheduler.policy.retry_delay);
                }
                // A newer session exists and nobody re-armed for it yet
                Err(RenewalError::SessionEnded) => scheduler.arm(),
                _ => {}
            }
        });
    }

    /// The renewal in flight for the live session, if any.
    fn pending(&self, slot: &Option<InFlight>) -> Option<SharedRenewal> {
        slot.as_ref()
            .filter(|pending| self.store.is_current(pending.epoch))
            .map(|pending| pending.renewal.clone())
    }

    /// Start a renewal unless one is already in flight for this session.
    ///
    /// Returns `None` without doing anything when a renewal is pending.
    pub async fn renew_now(&self) -> Option<RenewalOutcome> {
        let renewal = {
            let mut slot = self.in_flight();
            if self.pending(&slot).is_some() {
                debug!("Renewal already in flight");
                return None;
            }
            self.start(&mut slot)
        };
        Some(renewal.await)
    }

    /// Wait for the live session's pending renewal, starting one if none is
    /// in flight.
    pub async fn join_renewal(&self) -> RenewalOutcome {
        let renewal = {
            let mut slot = self.in_flight();
            match self.pending(&slot) {
                Some(pending) => pending,
                None => self.start(&mut slot),
            }
        };
        renewal.await
    }

    /// Renew if the app comes back to the foreground holding an expired
    /// credential. Covers sleeps the timer could not see.
    pub async fn on_foreground(&self) -> Option<RenewalOutcome> {
        if self.store.credential().is_none() || !self.store.credential_expired() {
            return None;
        }
        debug!("Foregrounded with an expired credential");
        self.renew_now().await
    }

    /// Stop listening for events and cancel any pending timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.timer.cancel();
    }

    fn start(&self, slot: &mut Option<InFlight>) -> SharedRenewal {
        let id = self.next_renewal.fetch_add(1, Ordering::Relaxed);
        let (current, epoch) = self.store.current();
        let renewal = match self.this.upgrade() {
            Some(scheduler) => tokio::spawn(async move {
                let _guard = InFlightGuard {
                    scheduler: scheduler.clone(),
                    id,
                };
                scheduler.perform_renewal(current, epoch).await
            })
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(RenewalError::Transient(format!("renewal task failed: {}", e)))
                })
            })
            .boxed()
            .shared(),
            None => future::ready(Err(RenewalError::SessionEnded)).boxed().shared(),
        };
        *slot = Some(InFlight {
            id,
            epoch,
            renewal: renewal.clone(),
        });
        renewal
    }

    async fn perform_renewal(
        &self,
        current: Option<Credential>,
        epoch: SessionEpoch,
    ) -> RenewalOutcome {
        if !self.store.begin_renewal_for(epoch) {
            return Err(RenewalError::SessionEnded);
        }
        info!("Renewing credential");

        match self.auth.refresh(current.as_ref()).await {
            Ok(credential) => self.accept(epoch, credential),
            Err(e) => Err(self.reject(epoch, e)),
        }
    }

    fn accept(&self, epoch: SessionEpoch, credential: Credential) -> RenewalOutcome {
        if !self.store.is_current(epoch) {
            debug!("Session ended while renewing");
            return Err(RenewalError::SessionEnded);
        }

        let now = self.store.clock().now();
        if clock::is_expired(Some(&credential), self.store.skew(), now) {
            warn!("Renewed credential is already expired");
            let reason = TerminationReason::TokenInvalid;
            self.terminator.terminate_for(epoch, reason.clone(), true);
            return Err(RenewalError::Rejected { reason });
        }

        if !self.store.renewal_succeeded(epoch, credential.clone()) {
            return Err(RenewalError::SessionEnded);
        }
        Ok(credential)
    }

    fn reject(&self, epoch: SessionEpoch, error: ApiError) -> RenewalError {
        match termination_reason_for(&error) {
            Some(reason) => {
                warn!(error = %error, reason = reason.code(), "Renewal rejected");
                self.terminator.terminate_for(epoch, reason.clone(), true);
                RenewalError::Rejected { reason }
            }
            None => {
                warn!(error = %error, "Renewal failed, keeping session");
                self.store.renewal_failed(epoch, error.to_string());
                RenewalError::Transient(error.to_string())
            }
        }
    }
}

/// How a failed refresh ends the session. `None` means it doesn't.
fn termination_reason_for(error: &ApiError) -> Option<TerminationReason> {
    match error {
        ApiError::AccountSuspended(_) => return Some(TerminationReason::AccountSuspended),
        _ if error.should_logout() => return Some(TerminationReason::SessionExpired),
        _ => {}
    }
    match error {
        ApiError::AuthExpired { .. }
        | ApiError::MalformedCredential(_)
        | ApiError::Forbidden(_)
        | ApiError::BadRequest(_)
        | ApiError::NotFound(_) => Some(TerminationReason::RefreshFailed),
        _ => None,
    }
}
