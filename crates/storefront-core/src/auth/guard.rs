//! Route authorization predicate.
//!
//! Decides whether a session may see a route. Rendering the redirect is
//! the host's job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clock;
use super::session::SessionState;
use crate::models::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum RouteAccess {
    /// Anyone.
    Public,
    /// Only signed-out visitors (login, register).
    GuestOnly,
    Authenticated,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    Allow,
    RedirectToLogin,
    RedirectHome,
    Forbidden,
}

/// A session whose credential has expired counts as signed out.
pub fn authorize(
    state: &SessionState,
    access: RouteAccess,
    now: DateTime<Utc>,
    skew: Duration,
) -> GuardDecision {
    let signed_in =
        state.is_authenticated() && !clock::is_expired(state.credential.as_ref(), skew, now);

    match access {
        RouteAccess::Public => GuardDecision::Allow,
        RouteAccess::GuestOnly if signed_in => GuardDecision::RedirectHome,
        RouteAccess::GuestOnly => GuardDecision::Allow,
        RouteAccess::Authenticated if signed_in => GuardDecision::Allow,
        RouteAccess::Authenticated => GuardDecision::RedirectToLogin,
        RouteAccess::Admin if !signed_in => GuardDecision::RedirectToLogin,
        RouteAccess::Admin if state.role == Role::Admin => GuardDecision::Allow,
        RouteAccess::Admin => GuardDecision::Forbidden,
    }
}
