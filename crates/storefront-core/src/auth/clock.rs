//! Credential expiry arithmetic.
//!
//! Pure functions over a credential and an instant. Anything that cannot be
//! decoded counts as expired, which pushes the session toward renewal or
//! logout instead of trusting a broken token.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::token::Credential;

/// Renew this long before the token actually expires.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Source of wall-clock time for everything that reasons about expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// True when the credential is absent, undecodable, or expires before
/// `now + skew`.
pub fn is_expired(credential: Option<&Credential>, skew: Duration, now: DateTime<Utc>) -> bool {
    let Some(expires_at) = credential.and_then(Credential::expires_at) else {
        return true;
    };
    let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
    expires_at < now + skew
}

/// Time left before expiry; zero when absent, malformed, or already expired.
pub fn time_until_expiry(credential: Option<&Credential>, now: DateTime<Utc>) -> Duration {
    let Some(expires_at) = credential.and_then(Credential::expires_at) else {
        return Duration::ZERO;
    };
    let remaining_ms = expires_at.timestamp_millis() - now.timestamp_millis();
    Duration::from_millis(remaining_ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mint_token, T0};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_expired_when_expiry_in_past_or_now() {
        let now = at(T0);
        for exp in [T0 - 3600, T0 - 1, T0] {
            let token = mint_token(exp, None);
            assert!(is_expired(Some(&token), DEFAULT_EXPIRY_SKEW, now), "exp={}", exp);
        }
    }

    #[test]
    fn test_not_expired_beyond_skew() {
        let now = at(T0);
        for exp in [T0 + 31, T0 + 300, T0 + 86_400] {
            let token = mint_token(exp, None);
            assert!(!is_expired(Some(&token), DEFAULT_EXPIRY_SKEW, now), "exp={}", exp);
        }
    }

    #[test]
    fn test_within_skew_counts_as_expired() {
        let token = mint_token(T0 + 29, None);
        assert!(is_expired(Some(&token), DEFAULT_EXPIRY_SKEW, at(T0)));
        assert!(!is_expired(Some(&token), Duration::ZERO, at(T0)));
    }

    #[test]
    fn test_absent_and_malformed_are_expired() {
        assert!(is_expired(None, DEFAULT_EXPIRY_SKEW, at(T0)));
        let garbage = Credential::new("definitely.not.ajwt");
        assert!(is_expired(Some(&garbage), DEFAULT_EXPIRY_SKEW, at(T0)));
        let no_exp = Credential::new(format!(
            "h.{}.s",
            base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                br#"{"sub":"x"}"#
            )
        ));
        assert!(is_expired(Some(&no_exp), DEFAULT_EXPIRY_SKEW, at(T0)));
    }

    #[test]
    fn test_time_until_expiry() {
        let token = mint_token(T0 + 300, None);
        assert_eq!(time_until_expiry(Some(&token), at(T0)), Duration::from_secs(300));
        assert_eq!(
            time_until_expiry(Some(&token), at(T0) + chrono::Duration::milliseconds(1500)),
            Duration::from_millis(298_500)
        );
        assert_eq!(time_until_expiry(Some(&token), at(T0 + 301)), Duration::ZERO);
        assert_eq!(time_until_expiry(None, at(T0)), Duration::ZERO);
        assert_eq!(
            time_until_expiry(Some(&Credential::new("junk")), at(T0)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_time_until_expiry_never_increases() {
        let token = mint_token(T0 + 120, None);
        let mut previous = Duration::MAX;
        for step in 0..40 {
            let remaining = time_until_expiry(Some(&token), at(T0 + step * 5));
            assert!(remaining <= previous);
            previous = remaining;
        }
        assert_eq!(previous, Duration::ZERO);
    }
}
