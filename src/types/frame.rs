use crate::{
    primitives::{CallId, ConnectionId},
    types::{ProtocolError, URI_LEN_LIMIT},
};
use serde::{ser::SerializeSeq, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;

/// WAMP protocol version announced in the `WELCOME` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// The type code in the first position of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// `[0, sessionId, protocolVersion, serverIdent]`
    Welcome = 0,
    /// `[1, prefix, uri]`
    Prefix = 1,
    /// `[2, callId, procedure, arg...]`
    Call = 2,
    /// `[3, callId, result]`
    CallResult = 3,
    /// `[4, callId, errorCode, errorMessage(, details)]`
    CallError = 4,
    /// `[5, topicUri]`
    Subscribe = 5,
    /// `[6, topicUri]`
    Unsubscribe = 6,
    /// `[7, topicUri, payload(, exclude(, eligible))]`
    Publish = 7,
    /// `[8, topicUri, payload]`
    Event = 8,
    /// `[9, topicUri, errorCode, errorMessage]`
    TopicError = 9,
}

impl MessageType {
    /// Frames that only the server may send.
    pub const fn is_server_only(self) -> bool {
        matches!(
            self,
            Self::Welcome | Self::CallResult | Self::CallError | Self::Event | Self::TopicError
        )
    }
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Welcome,
            1 => Self::Prefix,
            2 => Self::Call,
            3 => Self::CallResult,
            4 => Self::CallError,
            5 => Self::Subscribe,
            6 => Self::Unsubscribe,
            7 => Self::Publish,
            8 => Self::Event,
            9 => Self::TopicError,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

/// Which subscribers a publish skips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Exclude {
    /// Deliver to every subscriber.
    #[default]
    Nobody,
    /// Skip the publishing connection.
    Me,
    /// Skip the listed connections.
    List(Vec<ConnectionId>),
}

impl Exclude {
    /// Check whether `candidate` is excluded from a publish made by
    /// `publisher`.
    pub fn excludes(&self, publisher: Option<ConnectionId>, candidate: ConnectionId) -> bool {
        match self {
            Self::Nobody => false,
            Self::Me => publisher == Some(candidate),
            Self::List(ids) => ids.contains(&candidate),
        }
    }
}

impl From<Vec<ConnectionId>> for Exclude {
    fn from(ids: Vec<ConnectionId>) -> Self {
        if ids.is_empty() {
            Self::Nobody
        } else {
            Self::List(ids)
        }
    }
}

/// A frame sent by a client to the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Register a CURIE prefix for this connection.
    Prefix {
        /// The short prefix, e.g. `chat`.
        prefix: String,
        /// The URI it expands to.
        uri: String,
    },
    /// Invoke a procedure.
    Call {
        /// Correlation id, echoed in the response.
        call_id: CallId,
        /// Procedure URI.
        procedure: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// Subscribe to a topic.
    Subscribe {
        /// Topic URI.
        topic: String,
    },
    /// Unsubscribe from a topic.
    Unsubscribe {
        /// Topic URI.
        topic: String,
    },
    /// Publish to a topic.
    Publish {
        /// Topic URI.
        topic: String,
        /// Event payload.
        payload: Value,
        /// Subscribers to skip.
        exclude: Exclude,
        /// If present, only these subscribers receive the event.
        eligible: Option<Vec<ConnectionId>>,
    },
}

impl InboundFrame {
    /// Decode a frame from raw JSON text.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = core::str::from_utf8(bytes)?;
        let Value::Array(items) = serde_json::from_str::<Value>(text)? else {
            return Err(ProtocolError::NotAnArray);
        };
        let mut items = items.into_iter();

        let kind = items
            .next()
            .ok_or(ProtocolError::Empty)?
            .as_u64()
            .ok_or(ProtocolError::InvalidType)?;
        let kind = MessageType::try_from(kind)?;

        let mut fields = Fields { kind, items };
        Ok(match kind {
            MessageType::Prefix => Self::Prefix {
                prefix: fields.string("prefix")?,
                uri: fields.uri("uri")?,
            },
            MessageType::Call => {
                let call_id =
                    CallId::new(fields.value("callId")?).ok_or(ProtocolError::InvalidField {
                        kind,
                        field: "callId",
                    })?;
                Self::Call {
                    call_id,
                    procedure: fields.uri("procedure")?,
                    args: fields.items.collect(),
                }
            }
            MessageType::Subscribe => Self::Subscribe {
                topic: fields.uri("topicUri")?,
            },
            MessageType::Unsubscribe => Self::Unsubscribe {
                topic: fields.uri("topicUri")?,
            },
            MessageType::Publish => {
                let topic = fields.uri("topicUri")?;
                let payload = fields.value("payload")?;
                let exclude = match fields.items.next() {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => Exclude::Nobody,
                    Some(Value::Bool(true)) => Exclude::Me,
                    Some(value) => fields.ids(value, "exclude")?.into(),
                };
                let eligible = match fields.items.next() {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(fields.ids(value, "eligible")?),
                };
                Self::Publish {
                    topic,
                    payload,
                    exclude,
                    eligible,
                }
            }
            server_only => return Err(ProtocolError::ServerOnly(server_only)),
        })
    }

    /// The type code of this frame.
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::Prefix { .. } => MessageType::Prefix,
            Self::Call { .. } => MessageType::Call,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Unsubscribe { .. } => MessageType::Unsubscribe,
            Self::Publish { .. } => MessageType::Publish,
        }
    }
}

/// Cursor over the remaining elements of a frame being decoded.
struct Fields {
    kind: MessageType,
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn value(&mut self, field: &'static str) -> Result<Value, ProtocolError> {
        self.items.next().ok_or(ProtocolError::MissingField {
            kind: self.kind,
            field,
        })
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        match self.value(field)? {
            Value::String(s) => Ok(s),
            _ => Err(ProtocolError::InvalidField {
                kind: self.kind,
                field,
            }),
        }
    }

    fn uri(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let uri = self.string(field)?;
        if uri.len() > URI_LEN_LIMIT {
            return Err(ProtocolError::UriTooLarge(uri.len()));
        }
        Ok(uri)
    }

    fn ids(&self, value: Value, field: &'static str) -> Result<Vec<ConnectionId>, ProtocolError> {
        let invalid = || ProtocolError::InvalidField {
            kind: self.kind,
            field,
        };
        let Value::Array(ids) = value else {
            return Err(invalid());
        };
        ids.iter()
            .map(|id| id.as_u64().ok_or_else(invalid))
            .collect()
    }
}

impl Serialize for InboundFrame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(&self.kind())?;
        match self {
            Self::Prefix { prefix, uri } => {
                seq.serialize_element(prefix)?;
                seq.serialize_element(uri)?;
            }
            Self::Call {
                call_id,
                procedure,
                args,
            } => {
                seq.serialize_element(call_id)?;
                seq.serialize_element(procedure)?;
                for arg in args {
                    seq.serialize_element(arg)?;
                }
            }
            Self::Subscribe { topic } | Self::Unsubscribe { topic } => {
                seq.serialize_element(topic)?;
            }
            Self::Publish {
                topic,
                payload,
                exclude,
                eligible,
            } => {
                seq.serialize_element(topic)?;
                seq.serialize_element(payload)?;
                if *exclude != Exclude::Nobody || eligible.is_some() {
                    match exclude {
                        Exclude::Nobody => seq.serialize_element(&false)?,
                        Exclude::Me => seq.serialize_element(&true)?,
                        Exclude::List(ids) => seq.serialize_element(ids)?,
                    }
                }
                if let Some(eligible) = eligible {
                    seq.serialize_element(eligible)?;
                }
            }
        }
        seq.end()
    }
}

/// A frame sent by the broker to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Sent once, when the connection opens.
    Welcome {
        /// The connection id.
        session_id: ConnectionId,
        /// Server identification string.
        server_ident: String,
    },
    /// Successful procedure result.
    CallResult {
        /// Correlation id from the `CALL`.
        call_id: CallId,
        /// Return value.
        result: Value,
    },
    /// Failed procedure call.
    CallError {
        /// Correlation id from the `CALL`.
        call_id: CallId,
        /// Machine-readable error code, e.g. `unknown_procedure`.
        code: String,
        /// Human-readable description.
        message: String,
        /// Optional structured details.
        details: Option<Value>,
    },
    /// A published event.
    Event {
        /// Topic URI.
        topic: String,
        /// Event payload.
        payload: Value,
    },
    /// A subscribe or publish was refused.
    TopicError {
        /// Topic URI.
        topic: String,
        /// Machine-readable error code, e.g. `unknown_topic`.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl OutboundFrame {
    /// The type code of this frame.
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::Welcome { .. } => MessageType::Welcome,
            Self::CallResult { .. } => MessageType::CallResult,
            Self::CallError { .. } => MessageType::CallError,
            Self::Event { .. } => MessageType::Event,
            Self::TopicError { .. } => MessageType::TopicError,
        }
    }

    /// Serialize the frame to shareable JSON text. Serialization failures are
    /// logged and yield `None`.
    pub(crate) fn encode(&self) -> Option<Arc<str>> {
        serde_json::to_string(self)
            .map(Into::into)
            .inspect_err(|err| tracing::debug!(%err, kind = ?self.kind(), "failed to serialize frame"))
            .ok()
    }
}

impl Serialize for OutboundFrame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(&self.kind())?;
        match self {
            Self::Welcome {
                session_id,
                server_ident,
            } => {
                seq.serialize_element(session_id)?;
                seq.serialize_element(&PROTOCOL_VERSION)?;
                seq.serialize_element(server_ident)?;
            }
            Self::CallResult { call_id, result } => {
                seq.serialize_element(call_id)?;
                seq.serialize_element(result)?;
            }
            Self::CallError {
                call_id,
                code,
                message,
                details,
            } => {
                seq.serialize_element(call_id)?;
                seq.serialize_element(code)?;
                seq.serialize_element(message)?;
                if let Some(details) = details {
                    seq.serialize_element(details)?;
                }
            }
            Self::Event { topic, payload } => {
                seq.serialize_element(topic)?;
                seq.serialize_element(payload)?;
            }
            Self::TopicError {
                topic,
                code,
                message,
            } => {
                seq.serialize_element(topic)?;
                seq.serialize_element(code)?;
                seq.serialize_element(message)?;
            }
        }
        seq.end()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn decode(s: &str) -> Result<InboundFrame, ProtocolError> {
        InboundFrame::decode(s.as_bytes())
    }

    #[test]
    fn decodes_call_with_trailing_args() {
        let frame = decode(r#"[2, 7, "echo", "x", {"y": 1}]"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Call {
                call_id: CallId::from(7),
                procedure: "echo".into(),
                args: vec![json!("x"), json!({"y": 1})],
            }
        );
    }

    #[test]
    fn decodes_publish_variants() {
        let plain = decode(r#"[7, "/room/5", {"msg": "hi"}]"#).unwrap();
        assert!(matches!(
            plain,
            InboundFrame::Publish { exclude: Exclude::Nobody, eligible: None, .. }
        ));

        let me = decode(r#"[7, "/room/5", 1, true]"#).unwrap();
        assert!(matches!(me, InboundFrame::Publish { exclude: Exclude::Me, .. }));

        let lists = decode(r#"[7, "/room/5", 1, [3, 4], [5]]"#).unwrap();
        assert_eq!(
            lists,
            InboundFrame::Publish {
                topic: "/room/5".into(),
                payload: json!(1),
                exclude: Exclude::List(vec![3, 4]),
                eligible: Some(vec![5]),
            }
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(decode("{}"), Err(ProtocolError::NotAnArray)));
        assert!(matches!(decode("[]"), Err(ProtocolError::Empty)));
        assert!(matches!(decode("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode(r#"["5"]"#), Err(ProtocolError::InvalidType)));
        assert!(matches!(decode("[42]"), Err(ProtocolError::UnknownType(42))));
        assert!(matches!(
            decode(r#"[8, "/t", 1]"#),
            Err(ProtocolError::ServerOnly(MessageType::Event))
        ));
        assert!(matches!(
            decode("[5]"),
            Err(ProtocolError::MissingField { field: "topicUri", .. })
        ));
        assert!(matches!(
            decode(r#"[2, null, "echo"]"#),
            Err(ProtocolError::InvalidField { field: "callId", .. })
        ));
        assert!(matches!(
            decode(r#"[7, "/t", 1, ["a"]]"#),
            Err(ProtocolError::InvalidField { field: "exclude", .. })
        ));

        let long = format!(r#"[5, "{}"]"#, "a".repeat(URI_LEN_LIMIT + 1));
        assert!(matches!(decode(&long), Err(ProtocolError::UriTooLarge(_))));
    }

    #[test]
    fn encodes_outbound_frames() {
        let result = OutboundFrame::CallResult {
            call_id: CallId::from(7),
            result: json!("x"),
        };
        assert_eq!(&*result.encode().unwrap(), r#"[3,7,"x"]"#);

        let error = OutboundFrame::CallError {
            call_id: CallId::from("a"),
            code: "unknown_procedure".into(),
            message: "no such procedure".into(),
            details: None,
        };
        assert_eq!(
            &*error.encode().unwrap(),
            r#"[4,"a","unknown_procedure","no such procedure"]"#
        );

        let welcome = OutboundFrame::Welcome {
            session_id: 3,
            server_ident: "wsbroker".into(),
        };
        assert_eq!(&*welcome.encode().unwrap(), r#"[0,3,1,"wsbroker"]"#);
    }

    #[test]
    fn publish_encoding_decodes_back() {
        let frame = InboundFrame::Publish {
            topic: "/room/1".into(),
            payload: json!({"a": 1}),
            exclude: Exclude::Nobody,
            eligible: Some(vec![2]),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(text, r#"[7,"/room/1",{"a":1},false,[2]]"#);
        assert_eq!(decode(&text).unwrap(), frame);
    }
}
