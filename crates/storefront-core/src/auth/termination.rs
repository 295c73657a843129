//! Session termination: the one way a session ends.
//!
//! Every unrecoverable failure, and user-initiated logout, funnels through
//! [`SessionTerminator::terminate`]. It disarms the renewal timer, clears the
//! persisted credential, resets the store, and optionally tells the user why.
//! All of it happens synchronously so no request can pick up the old
//! credential afterwards.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::scheduler::RenewalTimer;
use super::session::{SessionEpoch, SessionStore};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    SessionExpired,
    RefreshFailed,
    TokenInvalid,
    AccountSuspended,
    UserLogout,
    Other(String),
}

impl TerminationReason {
    pub fn parse(code: &str) -> Self {
        match code {
            "session_expired" => TerminationReason::SessionExpired,
            "refresh_failed" => TerminationReason::RefreshFailed,
            "token_invalid" => TerminationReason::TokenInvalid,
            "account_suspended" => TerminationReason::AccountSuspended,
            "user_logout" => TerminationReason::UserLogout,
            other => TerminationReason::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            TerminationReason::SessionExpired => "session_expired",
            TerminationReason::RefreshFailed => "refresh_failed",
            TerminationReason::TokenInvalid => "token_invalid",
            TerminationReason::AccountSuspended => "account_suspended",
            TerminationReason::UserLogout => "user_logout",
            TerminationReason::Other(code) => code,
        }
    }

    /// User-facing text for this reason.
    pub fn message(&self) -> &'static str {
        match self {
            TerminationReason::SessionExpired => "Your session has expired. Please log in again.",
            TerminationReason::RefreshFailed => {
                "We couldn't keep you signed in. Please log in again."
            }
            TerminationReason::TokenInvalid => {
                "Your session is no longer valid. Please log in again."
            }
            TerminationReason::AccountSuspended => {
                "Your account has been suspended. Please contact support."
            }
            TerminationReason::UserLogout => "You have signed out.",
            TerminationReason::Other(_) => "You have been logged out.",
        }
    }

    pub fn level(&self) -> NoticeLevel {
        match self {
            TerminationReason::UserLogout | TerminationReason::Other(_) => NoticeLevel::Info,
            TerminationReason::AccountSuspended => NoticeLevel::Error,
            _ => NoticeLevel::Warning,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for TerminationReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Fire-and-forget sink for user-facing messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Writes notices to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => info!(notice = message),
            NoticeLevel::Warning => warn!(notice = message),
            NoticeLevel::Error => error!(notice = message),
        }
    }
}

/// Forwards notices over a channel to whatever renders them.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        // Receiver gone means nobody is rendering; drop the notice
        let _ = self.tx.send(Notice {
            level,
            message: message.to_string(),
        });
    }
}

pub struct SessionTerminator {
    store: Arc<SessionStore>,
    timer: Arc<RenewalTimer>,
    notifier: Arc<dyn Notifier>,
}

impl SessionTerminator {
    pub fn new(store: Arc<SessionStore>, timer: Arc<RenewalTimer>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            timer,
            notifier,
        }
    }

    /// End the current session. Safe to call repeatedly or when already
    /// logged out; only the call that actually ends a session notifies.
    ///
    /// Returns true if a live session was ended.
    pub fn terminate(&self, reason: TerminationReason, notify: bool) -> bool {
        self.timer.cancel();
        let ended = self.store.end_session(reason.clone());
        self.finish(ended, &reason, notify);
        ended
    }

    /// End the session identified by `epoch`. A no-op if that session is
    /// already gone, so a late failure cannot end a newer session.
    pub fn terminate_for(&self, epoch: SessionEpoch, reason: TerminationReason, notify: bool) -> bool {
        if !self.store.is_current(epoch) {
            return false;
        }
        self.timer.cancel();
        let ended = self.store.end_session_for(epoch, reason.clone());
        self.finish(ended, &reason, notify);
        ended
    }

    fn finish(&self, ended: bool, reason: &TerminationReason, notify: bool) {
        if ended && notify {
            self.notifier.notify(reason.level(), reason.message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::DEFAULT_EXPIRY_SKEW;
    use crate::auth::storage::{CredentialStorage, MemoryStorage, CREDENTIAL_KEY};
    use crate::test_support::{mint_token_at, FixedClock, RecordingNotifier, T0};
    use crate::auth::session::SessionPhase;
    use std::sync::Barrier;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        store: Arc<SessionStore>,
        storage: Arc<MemoryStorage>,
        timer: Arc<RenewalTimer>,
        notifier: Arc<RecordingNotifier>,
        terminator: Arc<SessionTerminator>,
    }

    fn logged_in() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(
            storage.clone(),
            Arc::new(FixedClock::at(T0)),
            DEFAULT_EXPIRY_SKEW,
        ));
        let attempt = store.begin_login();
        store.login_succeeded(attempt, mint_token_at(T0, 300, None), None);

        let timer = Arc::new(RenewalTimer::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let terminator = Arc::new(SessionTerminator::new(
            store.clone(),
            timer.clone(),
            notifier.clone(),
        ));
        Fixture {
            store,
            storage,
            timer,
            notifier,
            terminator,
        }
    }

    #[test]
    fn test_reason_codes_round_trip_and_messages_are_distinct() {
        let reasons = [
            TerminationReason::SessionExpired,
            TerminationReason::RefreshFailed,
            TerminationReason::TokenInvalid,
            TerminationReason::AccountSuspended,
            TerminationReason::UserLogout,
        ];
        for reason in &reasons {
            assert_eq!(&TerminationReason::parse(reason.code()), reason);
        }

        let mut messages: Vec<_> = reasons.iter().map(|r| r.message()).collect();
        messages.push(TerminationReason::parse("mystery").message());
        let count = messages.len();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), count);

        assert_eq!(
            TerminationReason::Other("mystery".into()).message(),
            "You have been logged out."
        );
    }

    #[test]
    fn test_terminate_clears_everything_and_notifies_once() {
        let f = logged_in();
        let token = CancellationToken::new();
        f.timer.replace(token.clone());

        assert!(f.terminator.terminate(TerminationReason::AccountSuspended, true));
        assert!(!f.terminator.terminate(TerminationReason::AccountSuspended, true));

        assert!(token.is_cancelled());
        assert!(!f.timer.is_armed());
        assert!(!f.store.is_authenticated());
        assert_eq!(f.storage.get(CREDENTIAL_KEY).expect("get"), None);
        assert_eq!(
            f.notifier.notices(),
            vec![Notice {
                level: NoticeLevel::Error,
                message: TerminationReason::AccountSuspended.message().to_string(),
            }]
        );
    }

    #[test]
    fn test_terminate_without_notify_is_silent() {
        let f = logged_in();
        assert!(f.terminator.terminate(TerminationReason::UserLogout, false));
        assert!(f.notifier.notices().is_empty());
    }

    #[test]
    fn test_terminate_when_anonymous_is_noop() {
        let f = logged_in();
        f.store.end_session(TerminationReason::UserLogout);
        assert!(!f.terminator.terminate(TerminationReason::SessionExpired, true));
        assert!(f.notifier.notices().is_empty());
    }

    #[test]
    fn test_terminate_for_stale_epoch_leaves_new_session() {
        let f = logged_in();
        let stale = f.store.begin_renewal();
        f.terminator.terminate(TerminationReason::UserLogout, false);

        let attempt = f.store.begin_login();
        f.store.login_succeeded(attempt, mint_token_at(T0, 300, None), None);

        assert!(!f.terminator.terminate_for(stale, TerminationReason::TokenInvalid, true));
        assert!(f.store.is_authenticated());
        assert!(f.notifier.notices().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_terminations_end_session_once() {
        for _ in 0..50 {
            let f = logged_in();
            let barrier = Arc::new(Barrier::new(2));
            let racer = |reason: TerminationReason| {
                let terminator = f.terminator.clone();
                let barrier = barrier.clone();
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    terminator.terminate(reason, true)
                })
            };

            let (a, b) = tokio::join!(
                racer(TerminationReason::SessionExpired),
                racer(TerminationReason::AccountSuspended)
            );
            let ended = [a.expect("join"), b.expect("join")];
            assert_eq!(ended.iter().filter(|e| **e).count(), 1);
            assert_eq!(f.notifier.notices().len(), 1);
            assert_eq!(f.store.state().phase, SessionPhase::Anonymous);
            assert_eq!(f.storage.get(CREDENTIAL_KEY).expect("get"), None);
        }
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(NoticeLevel::Warning, "heads up");
        let notice = rx.recv().await.expect("notice");
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert_eq!(notice.message, "heads up");

        drop(rx);
        notifier.notify(NoticeLevel::Info, "nobody listening");
    }
}
