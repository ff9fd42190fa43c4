use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, surfaced to clients as `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    RateLimited,
    Transient,
    ResourceLimit,
    PermissionDenied,
    Unavailable,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::ResourceLimit => "resource_limit",
            Self::PermissionDenied => "permission_denied",
            Self::Unavailable => "unavailable",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }
}

/// Error returned by project-session operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Transient(_) => ErrorKind::Transient,
            Self::ResourceLimit(_) => ErrorKind::ResourceLimit,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
