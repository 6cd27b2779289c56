use std::borrow::Cow;

/// Machine-readable error codes carried by `CALLERROR` and `TOPICERROR`
/// frames.
pub mod codes {
    /// No registered pattern matches the topic URI.
    pub const UNKNOWN_TOPIC: &str = "unknown_topic";
    /// No procedure is registered under the called name.
    pub const UNKNOWN_PROCEDURE: &str = "unknown_procedure";
    /// The call arguments could not be decoded into the handler's params.
    pub const INVALID_PARAMS: &str = "invalid_params";
    /// A handler refused the operation.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// A handler failed or panicked.
    pub const HANDLER_FAILURE: &str = "handler_failure";
    /// The handler did not finish within the configured timeout.
    pub const TIMEOUT: &str = "timeout";
}

/// Errors that can occur when registering topics, procedures or periodic
/// tasks on a broker builder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// A procedure name was registered twice.
    #[error("procedure `{0}` is already registered")]
    DuplicateProcedure(String),
    /// A topic pattern could not be parsed.
    #[error("invalid topic pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// A configured ping service names a probe that was never registered.
    #[error("no probe registered for ping service `{0}`")]
    UnknownProbe(String),
    /// A periodic task interval is zero, negative, not finite, or longer
    /// than [`MAX_DURATION`](crate::config::MAX_DURATION).
    #[error("periodic task `{0}` has an invalid interval")]
    InvalidInterval(String),
}

/// Errors produced by topic dispatch. These become `TOPICERROR` frames for
/// connection-originated operations, or [`PushError::Rejected`] for pushers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// No registered pattern matches the topic URI.
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    /// The topic handler vetoed the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(Cow<'static, str>),
    /// The topic handler failed.
    #[error("handler failure: {0}")]
    HandlerFailure(Cow<'static, str>),
}

impl TopicError {
    /// Convenience constructor for handler vetoes.
    pub fn unauthorized(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Unauthorized(reason.into())
    }

    /// Convenience constructor for handler failures.
    pub fn handler_failure(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::HandlerFailure(reason.into())
    }

    /// The wire error code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownTopic(_) => codes::UNKNOWN_TOPIC,
            Self::Unauthorized(_) => codes::UNAUTHORIZED,
            Self::HandlerFailure(_) => codes::HANDLER_FAILURE,
        }
    }
}

/// Errors produced by client storage drivers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The storage backend could not be reached or failed the operation.
    #[error("client storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors produced when pushing a message into the broker from outside the
/// connection set.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The broker event loop has shut down.
    #[error("broker is not running")]
    BrokerClosed,
    /// The topic handler refused the publish.
    #[error(transparent)]
    Rejected(#[from] TopicError),
    /// The pusher's outbound buffer is full, the message was dropped.
    #[error("pusher buffer is full")]
    BufferFull,
    /// The privileged-peer link is down.
    #[error("pusher disconnected: {0}")]
    Disconnected(#[from] tokio_tungstenite::tungstenite::Error),
    /// The pushed message could not be serialized or deserialized.
    #[error("invalid push message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}

/// Error returned by a periodic task run. Logged at the scheduler boundary.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PeriodicError(Cow<'static, str>);

impl PeriodicError {
    /// Create a new periodic error.
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self(message.into())
    }
}

impl From<PushError> for PeriodicError {
    fn from(err: PushError) -> Self {
        Self::new(err.to_string())
    }
}
