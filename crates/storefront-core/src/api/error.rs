use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Machine-readable error codes the backend puts in auth failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorCode {
    TokenExpired,
    TokenInvalid,
    TokenMissing,
    AccountSuspended,
    Other(String),
}

impl AuthErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "TOKEN_EXPIRED" => AuthErrorCode::TokenExpired,
            "TOKEN_INVALID" => AuthErrorCode::TokenInvalid,
            "TOKEN_MISSING" => AuthErrorCode::TokenMissing,
            "ACCOUNT_SUSPENDED" => AuthErrorCode::AccountSuspended,
            other => AuthErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AuthErrorCode::TokenExpired => "TOKEN_EXPIRED",
            AuthErrorCode::TokenInvalid => "TOKEN_INVALID",
            AuthErrorCode::TokenMissing => "TOKEN_MISSING",
            AuthErrorCode::AccountSuspended => "ACCOUNT_SUSPENDED",
            AuthErrorCode::Other(code) => code,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Unauthorized ({}): {message}", .code.as_ref().map(AuthErrorCode::as_str).unwrap_or("no code"))]
    AuthExpired {
        code: Option<AuthErrorCode>,
        should_logout: bool,
        message: String,
    },

    #[error("Account suspended: {0}")]
    AccountSuspended(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Malformed credential: {0}")]
    MalformedCredential(String),
}

/// Error envelope returned by the backend: `{code, message, shouldLogout}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "error")]
    message: Option<String>,
    #[serde(default)]
    should_logout: bool,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let code = parsed.code.as_deref().map(AuthErrorCode::parse);
        let message = parsed
            .message
            .unwrap_or_else(|| Self::truncate_body(body));

        match status.as_u16() {
            401 => ApiError::AuthExpired {
                code,
                should_logout: parsed.should_logout,
                message,
            },
            403 if code == Some(AuthErrorCode::AccountSuspended) => {
                ApiError::AccountSuspended(message)
            }
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            400..=499 => ApiError::BadRequest(format!("Status {}: {}", status, message)),
            500..=599 => ApiError::Server {
                status: status.as_u16(),
                message,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Transport failures, 5xx and rate limiting can succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_) | ApiError::Server { .. } | ApiError::RateLimited
        )
    }

    /// 401s and undecodable credentials both send the session toward renewal.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            ApiError::AuthExpired { .. } | ApiError::MalformedCredential(_)
        )
    }

    /// The backend told us the session cannot be recovered.
    pub fn should_logout(&self) -> bool {
        matches!(
            self,
            ApiError::AuthExpired {
                should_logout: true,
                ..
            } | ApiError::AccountSuspended(_)
        )
    }

    pub fn auth_code(&self) -> Option<&AuthErrorCode> {
        match self {
            ApiError::AuthExpired { code, .. } => code.as_ref(),
            ApiError::AccountSuspended(_) => Some(&AuthErrorCode::AccountSuspended),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else if e.is_timeout() {
            ApiError::Network(format!("Request timed out: {}", e))
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
