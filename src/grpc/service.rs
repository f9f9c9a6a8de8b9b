//! AuthGuard service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::authguard::v1::{
    auth_guard_server::AuthGuard, CheckRequest, CheckResponse, Outcome, Reason,
};

use crate::error::AuthGuardError;
use crate::ratelimit::{CheckResult, Clock, DenialReason, RateLimiterEngine};

/// Implementation of the AuthGuard gRPC interface.
pub struct AuthGuardServiceImpl {
    /// The engine making decisions
    engine: Arc<RateLimiterEngine>,
    /// Server-side time source
    clock: Arc<dyn Clock>,
    /// Whether `CheckRequest.now` is honored
    accept_client_time: bool,
}

impl AuthGuardServiceImpl {
    /// Create a new service that always evaluates at server time.
    pub fn new(engine: Arc<RateLimiterEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            accept_client_time: false,
        }
    }

    pub fn accept_client_time(mut self, accept: bool) -> Self {
        self.accept_client_time = accept;
        self
    }

    fn evaluation_time(&self, requested: Option<i64>) -> i64 {
        match requested {
            Some(now) if self.accept_client_time => now,
            Some(now) => {
                warn!(requested = now, "Ignoring caller-supplied time");
                self.clock.now()
            }
            None => self.clock.now(),
        }
    }
}

impl From<CheckResult> for CheckResponse {
    fn from(result: CheckResult) -> Self {
        match result {
            CheckResult::Allowed => CheckResponse {
                outcome: Outcome::Allowed.into(),
                reason: Reason::Unspecified.into(),
                retry_after_seconds: None,
            },
            CheckResult::Denied {
                reason,
                retry_after_seconds,
            } => {
                let reason = match reason {
                    DenialReason::RateLimitExceeded => Reason::RateLimitExceeded,
                    DenialReason::Locked => Reason::Locked,
                    DenialReason::ServiceUnavailable => Reason::ServiceUnavailable,
                };
                CheckResponse {
                    outcome: Outcome::Denied.into(),
                    reason: reason.into(),
                    retry_after_seconds,
                }
            }
        }
    }
}

#[tonic::async_trait]
impl AuthGuard for AuthGuardServiceImpl {
    /// Decide whether an authentication attempt may proceed.
    ///
    /// Denials are ordinary responses; only unusable identifiers produce an
    /// `INVALID_ARGUMENT` status.
    #[instrument(skip(self, request), fields(has_now = request.get_ref().now.is_some()))]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();
        let now = self.evaluation_time(req.now);

        let result = match self.engine.check_at(&req.email, &req.ip, now).await {
            Ok(result) => result,
            Err(AuthGuardError::InvalidIdentifier(e)) => {
                warn!(error = %e, "Rejected check with invalid identifier");
                return Err(Status::invalid_argument(e.to_string()));
            }
            Err(e) => return Err(Status::internal(e.to_string())),
        };

        debug!(result = ?result, "Check completed");
        Ok(Response::new(result.into()))
    }
}
