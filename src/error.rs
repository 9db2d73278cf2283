use thiserror::Error;

use crate::feed::FeedSubscriptionId;

/// Failure reported by the feed engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("feed engine is not connected")]
    NotConnected,

    #[error("unknown feed subscription {0}")]
    UnknownSubscription(FeedSubscriptionId),

    #[error("feed engine rejected request: {0}")]
    Rejected(String),

    #[error("feed engine fault: {0}")]
    Fault(String),
}

/// Errors returned synchronously by `Connection` and the objects it creates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("connection is closed")]
    NotConnected,

    #[error("feed error: {0}")]
    Feed(#[from] FeedError),
}

/// Failure channel of a period request future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("request was cancelled")]
    Cancelled,

    #[error("connection failure: {0}")]
    ConnectionFailure(String),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
pub type RequestResult<T> = Result<T, RequestError>;

pub(crate) fn invalid_argument(msg: impl Into<String>) -> ConnectionError {
    ConnectionError::InvalidArgument(msg.into())
}
