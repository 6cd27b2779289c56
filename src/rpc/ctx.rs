use crate::{
    error::codes,
    primitives::{CallId, ConnectionId},
    types::OutboundFrame,
    BrokerHandle,
};
use serde_json::Value;
use std::borrow::Cow;

/// The context of an RPC call.
///
/// Handlers receive a snapshot of the calling connection's identity and
/// session record, taken when the `CALL` frame was routed, together with a
/// [`BrokerHandle`] that can be used to publish events from the handler.
#[derive(Debug, Clone)]
pub struct RpcCtx {
    pub(crate) conn_id: ConnectionId,
    pub(crate) principal: Option<String>,
    pub(crate) origin: Option<String>,
    pub(crate) session: Option<Value>,
    pub(crate) broker: BrokerHandle,
}

impl RpcCtx {
    /// The calling connection.
    pub const fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// The principal established at handshake, if any.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// The `Origin` header presented at handshake, if any.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The connection's session record. `None` if the record has expired or
    /// client storage was unavailable.
    pub const fn session(&self) -> Option<&Value> {
        self.session.as_ref()
    }

    /// A handle to the broker, for publishing from the handler.
    pub const fn broker(&self) -> &BrokerHandle {
        &self.broker
    }
}

/// An error returned by an RPC handler. Sent to the caller as a `CALLERROR`
/// frame.
///
/// ```
/// use wsbroker::rpc::RpcError;
///
/// let err = RpcError::new("quota_exceeded", "too many requests")
///     .with_details(serde_json::json!({ "retry_after": 30 }));
/// assert_eq!(err.code(), "quota_exceeded");
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: Cow<'static, str>,
    message: Cow<'static, str>,
    details: Option<Value>,
}

impl RpcError {
    /// Create an error with an application-defined code.
    pub fn new(code: impl Into<Cow<'static, str>>, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The handler refused the call.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::UNAUTHORIZED, message)
    }

    /// The handler failed.
    pub fn handler_failure(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::HANDLER_FAILURE, message)
    }

    /// The call arguments did not match the handler's parameters.
    pub fn invalid_params(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub(crate) fn unknown_procedure(procedure: &str) -> Self {
        Self::new(
            codes::UNKNOWN_PROCEDURE,
            format!("no procedure registered as `{procedure}`"),
        )
    }

    pub(crate) fn timeout() -> Self {
        Self::new(codes::TIMEOUT, "procedure did not complete in time")
    }

    /// The error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error details, if any.
    pub const fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    pub(crate) fn into_frame(self, call_id: CallId) -> OutboundFrame {
        OutboundFrame::CallError {
            call_id,
            code: self.code.into_owned(),
            message: self.message.into_owned(),
            details: self.details,
        }
    }
}
