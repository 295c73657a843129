//! HTTP API module for the storefront backend.
//!
//! This module provides:
//! - `HttpTransport`: the seam requests leave the process through
//! - `AuthEndpoints`: login, registration, refresh and logout calls
//! - `AuthInterceptor`: attaches the credential and renews on 401
//! - `ApiClient`: data calls routed through the interceptor

pub mod auth;
pub mod client;
pub mod error;
pub mod interceptor;
pub mod transport;

pub use auth::{AuthEndpoints, AuthError, AuthSession};
pub use client::ApiClient;
pub use error::{ApiError, AuthErrorCode};
pub use interceptor::AuthInterceptor;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
