//! Shared fixtures for unit tests: token minting, clocks, a scripted
//! transport, and a fully wired session stack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::StatusCode;
use serde_json::json;

use crate::api::{ApiError, ApiRequest, ApiResponse, AuthEndpoints, AuthInterceptor, HttpTransport};
use crate::auth::clock::{Clock, DEFAULT_EXPIRY_SKEW};
use crate::auth::scheduler::{RenewalPolicy, RenewalScheduler, RenewalTimer};
use crate::auth::session::SessionStore;
use crate::auth::storage::MemoryStorage;
use crate::auth::termination::{Notice, NoticeLevel, Notifier, SessionTerminator};
use crate::auth::token::Credential;

/// Reference instant for tests, seconds since the epoch.
pub const T0: i64 = 1_700_000_000;

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

/// An unsigned JWT for `user-1` expiring at `exp`.
pub fn mint_token(exp: i64, role: Option<&str>) -> Credential {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let mut claims = json!({"sub": "user-1", "exp": exp});
    if let Some(role) = role {
        claims["role"] = json!(role);
    }
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    Credential::new(format!("{}.{}.signature", header, payload))
}

/// A token issued at `now` that lives for `ttl_secs`.
pub fn mint_token_at(now: i64, ttl_secs: i64, role: Option<&str>) -> Credential {
    mint_token(now + ttl_secs, role)
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn at(secs: i64) -> Self {
        Self(timestamp(secs))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Wall clock that advances with tokio's (possibly paused) time.
#[derive(Debug, Clone)]
pub struct PausedClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl PausedClock {
    pub fn start(secs: i64) -> Self {
        Self {
            origin: timestamp(secs),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .expect("elapsed fits in chrono::Duration");
        self.origin + elapsed
    }
}

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync>;

#[derive(Clone)]
struct Route {
    handler: Handler,
    delay: Duration,
}

/// Transport answering from per-path handlers. Unrouted paths get a 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(&self, path: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        self.route_with_delay(path, Duration::ZERO, handler);
    }

    /// Answer after `delay`, measured in tokio time.
    pub fn route_with_delay<F>(&self, path: &str, delay: Duration, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        self.routes.lock().expect("routes lock").insert(
            path.to_string(),
            Route {
                handler: Arc::new(handler),
                delay,
            },
        );
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }
}

impl HttpTransport for FakeTransport {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let key = request.path.split('?').next().unwrap_or(&request.path);
        let route = self.routes.lock().expect("routes lock").get(key).cloned();

        async move {
            let Some(route) = route else {
                return Ok(ApiResponse::new(StatusCode::NOT_FOUND, r#"{"message":"no route"}"#));
            };
            if !route.delay.is_zero() {
                tokio::time::sleep(route.delay).await;
            }
            (route.handler)(request)
        }
        .boxed()
    }
}

pub fn json_response(status: StatusCode, body: &serde_json::Value) -> ApiResponse {
    ApiResponse::new(status, body.to_string())
}

/// Refresh handler issuing a new token valid for `ttl_secs` from `clock`'s now.
pub fn refresh_handler(
    clock: PausedClock,
    ttl_secs: i64,
) -> impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static {
    move |_: &ApiRequest| {
        let token = mint_token(clock.now().timestamp() + ttl_secs, Some("customer"));
        Ok(json_response(
            StatusCode::OK,
            &json!({"success": true, "accessToken": token.as_str()}),
        ))
    }
}

/// 401 unless the request carries `accepted` as its bearer.
pub fn protected_handler(
    accepted: impl Fn() -> Option<Credential> + Send + Sync + 'static,
) -> impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static {
    move |request: &ApiRequest| match (accepted(), &request.bearer) {
        (Some(good), Some(sent)) if good == *sent => {
            Ok(json_response(StatusCode::OK, &json!({"ok": true})))
        }
        _ => Ok(json_response(
            StatusCode::UNAUTHORIZED,
            &json!({"code": "TOKEN_EXPIRED", "message": "jwt expired"}),
        )),
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().expect("notices lock").clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.notices().into_iter().map(|n| n.message).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        self.notices.lock().expect("notices lock").push(Notice {
            level,
            message: message.to_string(),
        });
    }
}

/// Let spawned tasks (event listener, timers at zero delay) run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// The session stack wired together over a [`FakeTransport`].
pub struct Harness {
    pub clock: PausedClock,
    pub transport: Arc<FakeTransport>,
    pub storage: Arc<MemoryStorage>,
    pub store: Arc<SessionStore>,
    pub timer: Arc<RenewalTimer>,
    pub notifier: Arc<RecordingNotifier>,
    pub terminator: Arc<SessionTerminator>,
    pub scheduler: Arc<RenewalScheduler>,
}

impl Harness {
    /// Must run inside a tokio runtime.
    pub fn new() -> Self {
        let clock = PausedClock::start(T0);
        let transport = Arc::new(FakeTransport::new());
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(
            storage.clone(),
            Arc::new(clock.clone()),
            DEFAULT_EXPIRY_SKEW,
        ));
        let timer = Arc::new(RenewalTimer::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let terminator = Arc::new(SessionTerminator::new(
            store.clone(),
            timer.clone(),
            notifier.clone(),
        ));
        let scheduler = RenewalScheduler::new(
            store.clone(),
            AuthEndpoints::new(transport.clone()),
            terminator.clone(),
            timer.clone(),
            RenewalPolicy::default(),
        );
        Self {
            clock,
            transport,
            storage,
            store,
            timer,
            notifier,
            terminator,
            scheduler,
        }
    }

    /// Log in with a token valid for `ttl_secs` from now.
    pub fn login(&self, ttl_secs: i64) -> Credential {
        let token = mint_token(self.clock.now().timestamp() + ttl_secs, Some("customer"));
        let attempt = self.store.begin_login();
        self.store.login_succeeded(attempt, token.clone(), None);
        token
    }

    pub fn interceptor(&self) -> AuthInterceptor {
        AuthInterceptor::new(
            self.transport.clone(),
            self.store.clone(),
            self.scheduler.clone(),
            self.terminator.clone(),
        )
    }
}
