use rsd_core::{LifecycleError, ProviderId, RequestId, RequestStatus, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("request {0} not found")]
    RequestNotFound(RequestId),
    #[error("provider {0} not found")]
    ProviderNotFound(ProviderId),
    #[error("provider {0} cannot take requests right now")]
    ProviderUnavailable(ProviderId),
    #[error("request {0} changed underneath this update")]
    Conflict(RequestId),
    #[error("request {request_id} is {status}; only finished requests settle")]
    NotFinished {
        request_id: RequestId,
        status: RequestStatus,
    },
    #[error("settlement of {request_id} violated an invariant: {reason}")]
    Invariant { request_id: RequestId, reason: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// How callers at the edge should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Invariant,
    Dependency,
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::Lifecycle(LifecycleError::NonPositiveValue) => ErrorClass::Validation,
            Self::Lifecycle(_) => ErrorClass::Conflict,
            Self::RequestNotFound(_) | Self::ProviderNotFound(_) => ErrorClass::NotFound,
            Self::ProviderUnavailable(_) | Self::Conflict(_) | Self::NotFinished { .. } => {
                ErrorClass::Conflict
            }
            Self::Invariant { .. } => ErrorClass::Invariant,
            Self::Store(_) => ErrorClass::Dependency,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(err) => err.reason(),
            Self::Lifecycle(err) => err.reason(),
            Self::RequestNotFound(_) => "request_not_found",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Conflict(_) => "concurrent_update",
            Self::NotFinished { .. } => "not_finished",
            Self::Invariant { .. } => "invariant_violation",
            Self::Store(_) => "store_failure",
        }
    }
}
