//! Serving the broker over WebSocket connections.
//!
//! ## Overview
//!
//! A [`Broker`] is built with a [`BrokerBuilder`], which collects topic
//! handlers, procedures and periodic tasks. Once started, all broker state
//! is owned by a single event loop task. Everything else talks to it through
//! a [`BrokerHandle`]: connection tasks, pushers, RPC handlers and periodic
//! tasks alike.
//!
//! ## Usage
//!
//! Typically users call [`Broker::serve`], which listens on the configured
//! host and port. Alternatively, any [`Connect`] implementor can be passed to
//! [`Connect::serve`], or attached to an already running broker with
//! [`Connect::attach`]. With the `"axum"` feature, [`broker_websocket`]
//! serves the broker from an [`axum`] route instead.
//!
//! ```no_run
//! use wsbroker::{topic::PassThrough, Broker, BrokerConfig};
//!
//! # async fn _main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::from_path("broker.json")?;
//! let shutdown = Broker::builder(config)
//!     .topic("/chat/{room}", PassThrough)?
//!     .build()?
//!     .serve()
//!     .await?;
//! // The broker stops when the shutdown guard is dropped.
//! shutdown.cancelled().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Handshake
//!
//! Every upgrade request passes through the [`HandshakePolicy`]. When origin
//! checking is on, an `Origin` header outside the allowed set is refused with
//! HTTP 403 before the connection is ever opened. A request carrying the
//! configured peer token as a bearer credential is the trusted internal
//! peer: it skips the origin check and is known by [`INTERNAL_PRINCIPAL`].
//!
//! Handshakes run on their own tasks, not in the accept loop. A client that
//! does not finish its upgrade within `server.handshake_timeout` is dropped.
//!
//! ## Connection tasks
//!
//! Each connection has two tasks: a `RouteTask` and a `WriteTask`. The
//! `RouteTask` reads and decodes inbound frames, and forwards them to the
//! event loop. A frame that fails to decode closes the connection with a
//! protocol error. The `WriteTask` drains the connection's outbound buffer
//! into the socket.
//!
//! ## Backpressure
//!
//! The outbound buffer is bounded, per connection. The event loop never
//! waits on it: an event for a client whose buffer is full is dropped for
//! that client only, and logged. RPC results are sent from the call's own
//! task, and do wait for room.
//!
//! [`axum`]: https://docs.rs/axum/latest/axum/index.html

mod broker;
pub use broker::{Broker, BrokerBuilder};

mod handle;
pub use handle::{BrokerHandle, BrokerStats, ConnectionInfo};

mod handshake;
pub use handshake::{Handshake, HandshakePolicy, HandshakeRejection, INTERNAL_PRINCIPAL};

mod shared;

mod shutdown;
pub use shutdown::ServerShutdown;

mod r#trait;
pub use r#trait::{Connect, FrameSink, FrameStream, Listener};

mod ws;
pub use ws::WsFrameStream;

#[cfg(feature = "axum")]
mod axum;
#[cfg(feature = "axum")]
pub use axum::{broker_websocket, AxumWsCfg};
