//! Topic-based publish/subscribe dispatch.
//!
//! Topics are addressed by URI. Applications register [`TopicHandler`]s
//! against [`TopicPattern`]s such as `/room/{id}`. The first pattern (in
//! registration order) matching a URI handles it, and sees the placeholder
//! values through [`TopicParams`].
//!
//! A concrete URI becomes a live topic instance when its first subscriber
//! joins, and is discarded when its last subscriber leaves. Publishing to a
//! URI without subscribers, or one that matches no pattern, delivers nothing.

mod dispatcher;
pub use dispatcher::{Fanout, Subscriber, TopicDispatcher};

mod handler;
pub use handler::{PassThrough, TopicHandler, TopicRequest};

mod pattern;
pub use pattern::{TopicParams, TopicPattern};

mod registry;
pub use registry::TopicRegistry;
