//! Error taxonomy shared by every control-plane component
//!
//! Callers match on [`ErrorCode`] to decide retry vs. surface. The enum is
//! closed and has no success variant: success travels as `Status::ok()`
//! (`code == None`), so APIs that require a failure code (dispatcher fatal,
//! stream closure) cannot be handed "success" by construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure codes carried in wire responses and surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum ErrorCode {
    /// Link between proxy and runtime broke mid-request; safe to retry.
    #[error("request between runtime and bus failed")]
    RequestBetweenRuntimeBus,

    /// Frontend connection to the proxy dropped; safe to retry.
    #[error("frontend connection to bus disconnected")]
    DisconnectFrontendBus,

    /// Control-stream call failed before a reply arrived; safe to retry.
    #[error("stream call error")]
    StreamCall,

    /// The target instance exited; the caller must re-create or re-route.
    #[error("instance exited")]
    InstanceExited,

    /// No route to the target instance exists on this node.
    #[error("instance not found")]
    InstanceNotFound,

    /// Admission control rejected the invoke (memory or token bucket).
    #[error("invoke rate limited")]
    InvokeRateLimited,

    /// Scheduler plugin set is misconfigured (missing prefilter / filters).
    #[error("schedule plugin configuration invalid")]
    SchedulePluginConfig,

    /// No feasible resource unit passed the filter pipeline.
    #[error("resource not enough")]
    ResourceNotEnough,

    /// Code-package download or extraction failed after bounded retries.
    #[error("user code load failed")]
    UserCodeLoad,

    /// Frame signature verification failed.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Malformed or missing request field.
    #[error("invalid parameter")]
    ParamInvalid,

    /// Internal messaging failure between control-plane components.
    #[error("inner communication error")]
    InnerCommunication,

    /// Catch-all internal failure.
    #[error("inner system error")]
    InnerSystemError,
}

impl ErrorCode {
    /// Whether a client may safely retry the failed request.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RequestBetweenRuntimeBus | Self::DisconnectFrontendBus | Self::StreamCall
        )
    }

    /// Maps retryable link codes onto [`ErrorCode::InstanceExited`].
    ///
    /// A fatal instance must never surface a retryable code: the caller
    /// would spin against a runtime that is gone instead of re-creating it.
    #[must_use]
    pub fn coerce_fatal(self) -> Self {
        match self {
            Self::RequestBetweenRuntimeBus | Self::StreamCall | Self::InnerCommunication => {
                Self::InstanceExited
            }
            other => other,
        }
    }
}

/// Code-plus-reason pair carried in every wire response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// `None` means success.
    pub code: Option<ErrorCode>,
    /// Free-text reason suitable for logging; empty on success.
    pub message: String,
}

impl Status {
    /// A successful status with no message.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failed status with the given code and reason.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code.is_none()
    }

    #[must_use]
    pub fn is_err(&self) -> bool {
        self.code.is_some()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            None => write!(f, "ok"),
            Some(code) => write!(f, "{code}: {}", self.message),
        }
    }
}

impl From<ErrorCode> for Status {
    fn from(code: ErrorCode) -> Self {
        Self::error(code, code.to_string())
    }
}
