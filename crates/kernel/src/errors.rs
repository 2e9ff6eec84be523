//! Kernel-wide error kinds.
//!
//! Errors cross service boundaries as events (`service/status`), not as
//! exceptions; `KernelError` is the single typed representation used when a
//! component needs to construct or match on one of those events, and at the
//! few call sites (bus registration, config loading) where a hard `Result`
//! return is still appropriate.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum KernelError {
    #[error("handler registration rejected: {0}")]
    HandlerInvalid(String),

    #[error("handler for topic '{topic}' errored: {message}")]
    HandlerError { topic: String, message: String },

    #[error("handler for topic '{topic}' timed out after {elapsed_ms}ms")]
    HandlerTimeout { topic: String, elapsed_ms: u64 },

    #[error("service '{service}' failed to start: {message}")]
    ServiceStartFailure { service: String, message: String },

    #[error("service '{service}' did not stop within {timeout_secs}s")]
    ServiceStopTimeout { service: String, timeout_secs: u64 },

    #[error("mode transition {old} -> {new} failed and was rolled back: {reason}")]
    TransitionFailed {
        old: String,
        new: String,
        reason: String,
    },

    #[error("plan step {step_id} in plan {plan_id} failed: {reason}")]
    PlanStepFailure {
        plan_id: String,
        step_id: String,
        reason: String,
    },

    #[error("plan step {step_id} in plan {plan_id} timed out")]
    PlanStepTimeout { plan_id: String, step_id: String },

    #[error("cache miss for key '{0}'")]
    CacheMiss(String),

    #[error("cache error for key '{key}': {message}")]
    CacheError { key: String, message: String },

    #[error("unknown command: '{0}'")]
    DispatchUnknownCommand(String),

    #[error("invalid command payload: {0}")]
    DispatchInvalidPayload(String),

    #[error("external provider '{provider}' returned an error: {message}")]
    ExternalProviderError { provider: String, message: String },
}

impl KernelError {
    /// The stable short name used as the `kind` field of a `service/status` event.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::HandlerInvalid(_) => "HandlerInvalid",
            KernelError::HandlerError { .. } => "HandlerError",
            KernelError::HandlerTimeout { .. } => "HandlerTimeout",
            KernelError::ServiceStartFailure { .. } => "ServiceStartFailure",
            KernelError::ServiceStopTimeout { .. } => "ServiceStopTimeout",
            KernelError::TransitionFailed { .. } => "TransitionFailed",
            KernelError::PlanStepFailure { .. } => "PlanStepFailure",
            KernelError::PlanStepTimeout { .. } => "PlanStepTimeout",
            KernelError::CacheMiss(_) => "CacheMiss",
            KernelError::CacheError { .. } => "CacheError",
            KernelError::DispatchUnknownCommand(_) => "DispatchUnknownCommand",
            KernelError::DispatchInvalidPayload(_) => "DispatchInvalidPayload",
            KernelError::ExternalProviderError { .. } => "ExternalProviderError",
        }
    }
}
