use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Type alias for identifying connections.
///
/// Connection ids double as the WAMP session id sent in the `WELCOME` frame,
/// and are the values clients put in `PUBLISH` exclude/eligible lists.
pub type ConnectionId = u64;

/// Correlation id of a `CALL` frame.
///
/// The id is opaque to the broker. It may be any JSON string or number, and
/// is echoed back unchanged in the matching `CALLRESULT` or `CALLERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Value);

impl CallId {
    /// Wrap a JSON value as a call id. Returns `None` unless the value is a
    /// string or a number.
    pub fn new(value: Value) -> Option<Self> {
        matches!(value, Value::String(_) | Value::Number(_)).then_some(Self(value))
    }

    /// Get the underlying JSON value.
    pub const fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id.into())
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

/// Who a topic operation originates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A live connection, optionally carrying its authenticated principal.
    Connection {
        /// The calling connection.
        id: ConnectionId,
        /// The principal established at handshake, if any.
        principal: Option<String>,
    },
    /// A pusher outside the connection set.
    External,
}

impl Caller {
    /// The calling connection id, if any.
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connection { id, .. } => Some(*id),
            Self::External => None,
        }
    }

    /// The principal of the caller, if any.
    pub fn principal(&self) -> Option<&str> {
        match self {
            Self::Connection { principal, .. } => principal.as_deref(),
            Self::External => None,
        }
    }
}
