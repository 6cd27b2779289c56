//! RPC-style call dispatch.
//!
//! Clients invoke procedures with `CALL` frames. Procedures are registered by
//! exact name as async closures taking an [`RpcCtx`] and parameters decoded
//! from the call's argument list. Each call runs on its own task, bounded by
//! the configured timeout, and is answered with exactly one `CALLRESULT` or
//! `CALLERROR` carrying the caller's correlation id.

mod ctx;
pub use ctx::{RpcCtx, RpcError};

mod dispatcher;
pub(crate) use dispatcher::RpcDispatcher;

mod registry;
pub use registry::RpcRegistry;
