//! Transparent credential renewal for API requests.
//!
//! Every request goes out with the current credential. A 401 from a
//! non-auth endpoint triggers one renewal (shared with anyone else waiting on
//! it) and a single replay. A second 401 on the replay ends the session, as
//! does a 403 that says the account is suspended.

use std::sync::Arc;

use tracing::{debug, warn};

use super::transport::{is_auth_endpoint, ApiRequest, ApiResponse, HttpTransport};
use super::ApiError;
use crate::auth::scheduler::RenewalScheduler;
use crate::auth::session::SessionStore;
use crate::auth::termination::{SessionTerminator, TerminationReason};

pub struct AuthInterceptor {
    transport: Arc<dyn HttpTransport>,
    store: Arc<SessionStore>,
    scheduler: Arc<RenewalScheduler>,
    terminator: Arc<SessionTerminator>,
}

impl AuthInterceptor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<SessionStore>,
        scheduler: Arc<RenewalScheduler>,
        terminator: Arc<SessionTerminator>,
    ) -> Self {
        Self {
            transport,
            store,
            scheduler,
            terminator,
        }
    }

    /// Send `request`, renewing and replaying once on a 401.
    ///
    /// Non-success responses come back as errors. When renewal can't rescue
    /// the request the caller sees the original 401, never the renewal error.
    /// Only the session the request started under can be ended by it.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let (credential, epoch) = self.store.current();
        request.bearer = credential;
        let mut first_rejection: Option<ApiError> = None;

        loop {
            let response = self.transport.send(&request).await?;
            if response.is_success() {
                return Ok(response);
            }

            let error = response.error();
            if let ApiError::AccountSuspended(_) = error {
                warn!(path = %request.path, "Account suspended");
                self.terminator
                    .terminate_for(epoch, TerminationReason::AccountSuspended, true);
                return Err(error);
            }
            if !error.is_unauthorized() || is_auth_endpoint(&request.path) {
                return Err(error);
            }
            // A guest has nothing to renew
            if request.bearer.is_none() && self.store.credential().is_none() {
                return Err(error);
            }

            if request.retried {
                warn!(path = %request.path, "Request rejected again after renewal");
                self.terminator
                    .terminate_for(epoch, TerminationReason::SessionExpired, true);
                return Err(first_rejection.unwrap_or(error));
            }
            request.retried = true;

            // Another caller may have renewed while this request was out
            let current = self.store.credential();
            let fresh = if current.is_some() && current != request.bearer {
                debug!(path = %request.path, "Credential already renewed, replaying");
                current
            } else {
                debug!(path = %request.path, "Unauthorized, waiting for renewal");
                match self.scheduler.join_renewal().await {
                    Ok(credential) => Some(credential),
                    Err(e) => {
                        debug!(path = %request.path, error = %e, "Renewal did not rescue request");
                        return Err(error);
                    }
                }
            };

            request.bearer = fresh;
            first_rejection = Some(error);
        }
    }
}
