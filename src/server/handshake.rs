use crate::origins::OriginRegistry;
use std::net::SocketAddr;

/// Principal assigned to connections presenting the configured peer token.
pub const INTERNAL_PRINCIPAL: &str = "internal";

/// What the broker learned about a connection during the WebSocket
/// handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// The `Origin` header, if sent.
    pub origin: Option<String>,
    /// The remote socket address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// The authenticated principal, if any.
    pub principal: Option<String>,
}

/// Reasons a handshake is refused. Rejected handshakes are answered with an
/// HTTP error and never reach the open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeRejection {
    /// The origin is not on the allow-list.
    #[error("origin not allowed")]
    OriginNotAllowed,
}

impl HandshakeRejection {
    /// The HTTP status code sent for this rejection.
    pub const fn status(self) -> u16 {
        match self {
            Self::OriginNotAllowed => 403,
        }
    }

    /// Metric label for this rejection.
    pub(crate) const fn label(self) -> &'static str {
        match self {
            Self::OriginNotAllowed => "origin",
        }
    }
}

/// Admission rules applied to every WebSocket handshake.
///
/// A request carrying `Authorization: Bearer <peer token>` is the trusted
/// pusher peer. It is admitted with the [`INTERNAL_PRINCIPAL`] regardless of
/// origin. Everyone else is subject to the origin allow-list when origin
/// checking is enabled.
#[derive(Debug, Clone, Default)]
pub struct HandshakePolicy {
    origins: OriginRegistry,
    origin_check: bool,
    peer_token: Option<String>,
}

impl HandshakePolicy {
    /// Create a policy.
    pub fn new(origins: OriginRegistry, origin_check: bool, peer_token: Option<String>) -> Self {
        Self {
            origins,
            origin_check,
            peer_token: peer_token.filter(|token| !token.is_empty()),
        }
    }

    /// The origin allow-list.
    pub const fn origins(&self) -> &OriginRegistry {
        &self.origins
    }

    /// Decide whether to admit a handshake, given its `Origin` and
    /// `Authorization` header values.
    pub fn authorize(
        &self,
        origin: Option<&str>,
        authorization: Option<&str>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Handshake, HandshakeRejection> {
        let trusted = match (&self.peer_token, authorization) {
            (Some(token), Some(header)) => header
                .strip_prefix("Bearer ")
                .is_some_and(|presented| presented.trim() == token),
            _ => false,
        };

        if !trusted && self.origin_check && !self.origins.is_allowed(origin) {
            return Err(HandshakeRejection::OriginNotAllowed);
        }

        Ok(Handshake {
            origin: origin.map(ToOwned::to_owned),
            remote_addr,
            principal: trusted.then(|| INTERNAL_PRINCIPAL.to_owned()),
        })
    }
}
