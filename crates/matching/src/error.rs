//! Error taxonomy of the matching service
//!
//! Every error returned by the engine carries one of a closed set of
//! [`ErrorKind`]s. The kind decides which failure counter is incremented and
//! which status a transport should report.

use crate::domain::DomainError;
use crate::metrics::Counter;
use crate::persistence::StoreError;

/// Closed classification of matching failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, not retried
    BadRequest,
    /// Unknown domain, workflow, or query
    EntityNotExists,
    /// Domain is not active in this cluster; caller should redirect
    DomainNotActive,
    /// Host rate limit exceeded; caller should back off
    ServiceBusy,
    /// Resource quota breached
    LimitExceeded,
    /// The worker answered a query with a failure
    QueryFailed,
    /// Persistence or unexpected failure; caller may retry
    InternalService,
}

impl ErrorKind {
    /// Failure counter incremented when an error of this kind is returned
    pub fn counter(self) -> Counter {
        match self {
            Self::BadRequest => Counter::ErrBadRequest,
            Self::EntityNotExists => Counter::ErrEntityNotExists,
            Self::DomainNotActive => Counter::ErrDomainNotActive,
            Self::ServiceBusy => Counter::ErrServiceBusy,
            Self::LimitExceeded => Counter::ErrLimitExceeded,
            Self::QueryFailed => Counter::ErrQueryFailed,
            Self::InternalService => Counter::Failures,
        }
    }

    /// HTTP-style status a transport adapter should answer with
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::EntityNotExists => 404,
            Self::DomainNotActive => 421,
            Self::ServiceBusy => 503,
            Self::LimitExceeded => 429,
            Self::QueryFailed => 422,
            Self::InternalService => 500,
        }
    }

    /// Whether a caller may retry the same request
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ServiceBusy | Self::InternalService)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest => write!(f, "bad_request"),
            Self::EntityNotExists => write!(f, "entity_not_exists"),
            Self::DomainNotActive => write!(f, "domain_not_active"),
            Self::ServiceBusy => write!(f, "service_busy"),
            Self::LimitExceeded => write!(f, "limit_exceeded"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::InternalService => write!(f, "internal_service"),
        }
    }
}

/// Errors returned by the matching engine and handler
#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("entity not exists: {0}")]
    EntityNotExists(String),

    #[error("domain {domain} is not active in this cluster")]
    DomainNotActive { domain: String },

    #[error("service busy: {0}")]
    ServiceBusy(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("internal service error: {0}")]
    InternalService(String),

    /// Store error on the write or ack path
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The task list manager was unloaded while the call was using it
    #[error("task list {0} was unloaded")]
    TaskListUnloaded(String),

    /// The engine is stopping
    #[error("matching engine is shutting down")]
    ShuttingDown,
}

impl MatchingError {
    /// Rate limit refusal of the matching host
    pub fn host_throttled() -> Self {
        Self::ServiceBusy("matching host rps exceeded".into())
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::EntityNotExists(_) => ErrorKind::EntityNotExists,
            Self::DomainNotActive { .. } => ErrorKind::DomainNotActive,
            Self::ServiceBusy(_) => ErrorKind::ServiceBusy,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Self::QueryFailed(_) => ErrorKind::QueryFailed,
            Self::InternalService(_)
            | Self::Store(_)
            | Self::TaskListUnloaded(_)
            | Self::ShuttingDown => ErrorKind::InternalService,
        }
    }

    /// Collapse engine-internal variants into `InternalService`
    ///
    /// After normalization the variant always names its kind directly.
    pub fn normalize(self) -> Self {
        match self {
            Self::Store(_) | Self::TaskListUnloaded(_) | Self::ShuttingDown => {
                Self::InternalService(self.to_string())
            }
            other => other,
        }
    }
}

impl From<DomainError> for MatchingError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound(id) => Self::EntityNotExists(format!("domain {id} not found")),
            DomainError::Deleted(id) => Self::EntityNotExists(format!("domain {id} is deleted")),
            DomainError::Lookup(msg) => Self::InternalService(msg),
        }
    }
}
