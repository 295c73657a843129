//! Calls to the `/auth/*` endpoints.
//!
//! These go straight to the transport. They never pass through the
//! interceptor, so a failing refresh can't trigger another refresh.

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use super::transport::{
    ApiRequest, ApiResponse, HttpTransport, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, REGISTER_PATH,
};
use super::ApiError;
use crate::auth::termination::TerminationReason;
use crate::auth::token::{Credential, TokenError};
use crate::models::{AuthResponse, LoginRequest, ProviderIdentity, RefreshResponse, RegisterRequest, UserProfile};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account suspended: {0}")]
    AccountSuspended(String),

    #[error("Account already exists: {0}")]
    AlreadyRegistered(String),

    #[error("Server returned a malformed credential: {0}")]
    MalformedCredential(#[from] TokenError),

    #[error("Credential returned by the server is already expired")]
    ExpiredCredential,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AuthError {
    /// Text suitable for showing next to a login form.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Invalid email or password".to_string(),
            AuthError::AccountSuspended(_) => {
                TerminationReason::AccountSuspended.message().to_string()
            }
            AuthError::AlreadyRegistered(_) => {
                "An account with this email already exists".to_string()
            }
            AuthError::Api(ApiError::Network(msg)) if msg.to_lowercase().contains("timed out") => {
                "Connection timed out. Please try again.".to_string()
            }
            AuthError::Api(ApiError::Network(_)) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::Api(ApiError::RateLimited) => {
                "Too many attempts. Please wait a moment and try again.".to_string()
            }
            other => format!("Login failed: {}", other),
        }
    }
}

/// A freshly issued credential, plus the user if the server sent one along.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub credential: Credential,
    pub user: Option<UserProfile>,
}

#[derive(Clone)]
pub struct AuthEndpoints {
    transport: Arc<dyn HttpTransport>,
}

impl AuthEndpoints {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let body = LoginRequest::Password {
            email: email.to_string(),
            password: password.to_string(),
        };
        self.authenticate(ApiRequest::post(LOGIN_PATH).json(&body)?).await
    }

    /// Sign in with the result of a federated identity-provider flow.
    pub async fn login_with_identity(
        &self,
        identity: &ProviderIdentity,
    ) -> Result<AuthSession, AuthError> {
        let body = LoginRequest::Provider(identity.clone());
        self.authenticate(ApiRequest::post(LOGIN_PATH).json(&body)?).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthSession, AuthError> {
        self.authenticate(ApiRequest::post(REGISTER_PATH).json(request)?).await
    }

    async fn authenticate(&self, request: ApiRequest) -> Result<AuthSession, AuthError> {
        debug!(path = %request.path, "Authenticating");
        let response = self.transport.send(&request).await?;
        let response = Self::check_auth_response(response)?;

        let auth: AuthResponse = response.json()?;
        let credential = Credential::new(auth.access_token);
        credential.claims()?;

        Ok(AuthSession {
            credential,
            user: auth.user,
        })
    }

    fn check_auth_response(response: ApiResponse) -> Result<ApiResponse, AuthError> {
        match response.status {
            StatusCode::UNAUTHORIZED => Err(AuthError::InvalidCredentials),
            StatusCode::CONFLICT => Err(AuthError::AlreadyRegistered(
                response.error().to_string(),
            )),
            _ => match response.check() {
                Ok(response) => Ok(response),
                Err(ApiError::AccountSuspended(msg)) => Err(AuthError::AccountSuspended(msg)),
                Err(e) => Err(AuthError::Api(e)),
            },
        }
    }

    /// Exchange the current session for a fresh credential.
    ///
    /// The refresh cookie rides along in the transport's cookie store; the
    /// current credential, if any, is sent as the bearer.
    pub async fn refresh(&self, current: Option<&Credential>) -> Result<Credential, ApiError> {
        let request = ApiRequest::post(REFRESH_PATH).bearer(current.cloned());
        let response = self.transport.send(&request).await?.check()?;
        let body: RefreshResponse = response.json()?;

        if !body.success {
            return Err(ApiError::AuthExpired {
                code: None,
                should_logout: false,
                message: "Refresh was not accepted".to_string(),
            });
        }

        body.access_token
            .filter(|token| !token.is_empty())
            .map(Credential::new)
            .ok_or_else(|| {
                ApiError::MalformedCredential("refresh response carried no access token".to_string())
            })
    }

    /// Tell the server the session is over so it can revoke the refresh cookie.
    pub async fn logout(&self, current: Option<&Credential>) -> Result<(), ApiError> {
        let request = ApiRequest::post(LOGOUT_PATH).bearer(current.cloned());
        self.transport.send(&request).await?.check()?;
        Ok(())
    }
}
