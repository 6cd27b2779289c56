//! wsbroker: a real-time publish/subscribe and RPC broker over WebSockets.
//!
//! Clients connect over WebSocket and speak a WAMP v1 style protocol: JSON
//! arrays whose first element is a numeric message type. They subscribe to
//! and publish on topics addressed by URI, and call named procedures that
//! are answered asynchronously. Applications register topic handlers and
//! procedures on a [`BrokerBuilder`], and run the resulting [`Broker`].
//!
//! ## Basic usage
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use wsbroker::{
//!     rpc::{RpcCtx, RpcError},
//!     topic::PassThrough,
//!     Broker, BrokerConfig, PushMessage,
//! };
//!
//! # async fn _main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::builder(BrokerConfig::default())
//!     // Every URI under `/chat/` is a room. Publishes are relayed as-is.
//!     .topic("/chat/{room}", PassThrough)?
//!     // Procedures take a context and their decoded argument list.
//!     .rpc("add", |_ctx: RpcCtx, (a, b): (i64, i64)| async move {
//!         Ok::<_, RpcError>(a + b)
//!     })?
//!     .rpc("whoami", |ctx: RpcCtx, _: Vec<Value>| async move {
//!         Ok::<_, RpcError>(json!({ "id": ctx.conn_id(), "origin": ctx.origin() }))
//!     })?
//!     .build()?;
//!
//! // Listen on the configured host and port. The broker stops when the
//! // shutdown guard is dropped.
//! let shutdown = broker.serve().await?;
//!
//! // Server code can push events to subscribers at any time.
//! shutdown
//!     .broker()
//!     .publish(PushMessage::new("/chat/lobby", json!({ "text": "hello" })))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Topics
//!
//! Topic handlers implement [`TopicHandler`], and may veto subscriptions and
//! publishes, or rewrite payloads before fan-out. See the [`topic`] module.
//!
//! ## Procedures
//!
//! Procedure handlers are async closures. Each call runs on its own task,
//! bounded by `server.rpc_timeout`. See the [`rpc`] module.
//!
//! ## Pushing from outside
//!
//! Messages can be injected by server-side code through a [`BrokerHandle`],
//! over a loopback WebSocket link with [`PeerPusher`], or from a message
//! queue with [`QueueConsumer`]. See the [`pusher`] module.
//!
//! ## Serving with axum
//!
//! With the `"axum"` feature (on by default), the broker can be mounted on
//! an [`axum::Router`] route. See [`server::broker_websocket`].
//!
//! [`TopicHandler`]: topic::TopicHandler
//! [`PeerPusher`]: pusher::PeerPusher
//! [`QueueConsumer`]: pusher::QueueConsumer
//! [`axum::Router`]: https://docs.rs/axum/latest/axum/routing/struct.Router.html

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod config;
pub use config::{BrokerConfig, ConfigError};

mod error;
pub use error::{codes, PeriodicError, PushError, RegistrationError, StorageError, TopicError};

mod metrics;

mod origins;
pub use origins::OriginRegistry;

pub mod periodic;

mod primitives;
pub use primitives::{CallId, Caller, ConnectionId};

pub mod pusher;
pub use pusher::{PushMessage, Pusher};

pub mod rpc;

pub mod server;
pub use server::{
    Broker, BrokerBuilder, BrokerHandle, BrokerStats, ConnectionInfo, ServerShutdown,
};

pub mod storage;

mod tasks;

pub mod topic;

pub mod types;

/// Re-export of the `serde_json` crate, for building payloads.
pub use serde_json;
