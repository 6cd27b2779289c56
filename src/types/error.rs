use crate::types::MessageType;

/// Error when decoding an inbound frame.
///
/// Any of these closes the offending connection with a protocol-error close
/// code. Other connections are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Invalid UTF-8
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] core::str::Utf8Error),

    /// Invalid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The frame is valid JSON, but not an array.
    #[error("Frame is not a JSON array.")]
    NotAnArray,

    /// The frame is an empty array.
    #[error("Frame is empty.")]
    Empty,

    /// The first element of the frame is not an unsigned integer.
    #[error("Frame type is not an unsigned integer.")]
    InvalidType,

    /// The frame type is not part of the protocol.
    #[error("Unknown frame type: {0}")]
    UnknownType(u64),

    /// The frame type is valid, but only the server may send it.
    #[error("Frame type {0:?} may only be sent by the server.")]
    ServerOnly(MessageType),

    /// A required field is absent.
    #[error("{kind:?} frame is missing field `{field}`.")]
    MissingField {
        /// The frame being decoded.
        kind: MessageType,
        /// The missing field.
        field: &'static str,
    },

    /// A field has the wrong JSON type.
    #[error("{kind:?} frame has an invalid `{field}` field.")]
    InvalidField {
        /// The frame being decoded.
        kind: MessageType,
        /// The offending field.
        field: &'static str,
    },

    /// URI is too large
    ///
    /// The limit is 512 bytes, which comfortably holds any topic or
    /// procedure URI a client should be sending.
    #[error("URI is too large, limit of 512 bytes. Got: {0}")]
    UriTooLarge(usize),
}
