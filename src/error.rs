//! Client error types.
use std::time::Duration;

use thiserror::Error;

use crate::{
    connection::DiscoveryError,
    protocol::{FrameError, TcpCommand, TransportError},
    settings::SettingsError,
    subscription::SubscriptionDropReason,
};

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to callers.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("malformed frame: {0}")]
    MalformedFrame(FrameError),

    #[error("unexpected command {actual:#04x}, expected {expected:?}")]
    UnexpectedCommand {
        expected: Option<TcpCommand>,
        actual: u8,
    },

    #[error("{command} timed out after {timeout:?}")]
    OperationTimedOut { command: TcpCommand, timeout: Duration },

    #[error("{command} reached its retry limit of {retries}")]
    RetriesLimitReached { command: TcpCommand, retries: u32 },

    #[error("operation queue is full ({limit} pending operations)")]
    MaxQueueSizeLimitReached { limit: usize },

    #[error("no heartbeat reply within {0:?}")]
    HeartbeatTimedOut(Duration),

    #[error("node is not the leader, redirect to {0}")]
    NotMaster(String),

    #[error("server is not ready")]
    NotReady,

    #[error("server is too busy")]
    TooBusy,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("could not establish a connection after {attempts} attempts")]
    CannotEstablishConnection { attempts: u32 },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("stream '{0}' is deleted")]
    StreamDeleted(String),

    #[error("wrong expected version for '{stream}': expected {expected}, current {current:?}")]
    WrongExpectedVersion {
        stream: String,
        expected: i64,
        current: Option<i64>,
    },

    #[error("expected version {0} does not fit the wire format")]
    ExpectedVersionOutOfRange(u64),

    #[error("invalid transaction {0}")]
    InvalidTransaction(i64),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("subscription group '{group}' on '{stream}' already exists")]
    SubscriptionGroupExists { stream: String, group: String },

    #[error("subscription group '{group}' on '{stream}' does not exist")]
    SubscriptionGroupNotFound { stream: String, group: String },

    #[error("subscription dropped: {0:?}")]
    SubscriptionDropped(SubscriptionDropReason),

    #[error("event handler failed: {0}")]
    EventHandler(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("endpoint discovery failed: {0}")]
    Discovery(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Frame(e) if e.is_malformed() => ClientError::MalformedFrame(e),
            e => ClientError::Transport(e.to_string()),
        }
    }
}

impl From<DiscoveryError> for ClientError {
    fn from(value: DiscoveryError) -> Self {
        ClientError::Discovery(value.to_string())
    }
}

impl From<SettingsError> for ClientError {
    fn from(value: SettingsError) -> Self {
        ClientError::InvalidSettings(value.to_string())
    }
}
