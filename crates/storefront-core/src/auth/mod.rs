//! Authentication module for managing the client-side session.
//!
//! This module provides:
//! - `Credential` / `Clock`: the bearer token and its expiry arithmetic
//! - `SessionStore`: the single writer of session state, publishing events
//! - `RenewalScheduler`: proactive, single-flight credential renewal
//! - `SessionTerminator`: the one idempotent path out of a session
//! - `CredentialStorage`: persistence backends (file, keyring, memory)
//! - `authorize`: the route access predicate
//!
//! Credentials are renewed two minutes before they expire.

pub mod clock;
pub mod guard;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod termination;
pub mod token;

pub use clock::{Clock, SystemClock};
pub use guard::{authorize, GuardDecision, RouteAccess};
pub use scheduler::{RenewalError, RenewalOutcome, RenewalPolicy, RenewalScheduler, RenewalTimer};
pub use session::{SessionEvent, SessionPhase, SessionSnapshot, SessionState, SessionStore};
pub use storage::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage};
pub use termination::{
    ChannelNotifier, LogNotifier, Notice, NoticeLevel, Notifier, SessionTerminator,
    TerminationReason,
};
pub use token::{Claims, Credential, TokenError};
