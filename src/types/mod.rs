//! Wire types: the WAMP v1 style `[type, ...fields]` frames exchanged with
//! clients.

mod frame;
pub use frame::{Exclude, InboundFrame, MessageType, OutboundFrame, PROTOCOL_VERSION};

mod error;
pub use error::ProtocolError;

pub(crate) const URI_LEN_LIMIT: usize = 512;
