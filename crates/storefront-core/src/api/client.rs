//! Data API client.
//!
//! Everything here goes through the [`AuthInterceptor`], so callers never
//! see a 401 that a renewal could have fixed.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::interceptor::AuthInterceptor;
use super::transport::{ApiRequest, ApiResponse, PROFILE_PATH};
use super::ApiError;
use crate::models::{ProfileEnvelope, UserProfile};

/// API client for the storefront backend.
///
/// Clone is cheap - the interceptor is shared behind an `Arc`.
#[derive(Clone)]
pub struct ApiClient {
    interceptor: Arc<AuthInterceptor>,
}

impl ApiClient {
    pub fn new(interceptor: Arc<AuthInterceptor>) -> Self {
        Self { interceptor }
    }

    /// Send a raw request with the session credential attached.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.interceptor.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!(path = path, "GET");
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(path = path, "POST");
        self.execute(ApiRequest::post(path).json(body)?).await?.json()
    }

    /// Fetch the signed-in user's profile.
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let envelope: ProfileEnvelope = self.get_json(PROFILE_PATH).await?;
        Ok(envelope.into_profile())
    }
}
