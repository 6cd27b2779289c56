use crate::{error::TopicError, primitives::Caller, topic::TopicParams};
use serde_json::Value;

/// The context of a topic hook invocation.
#[derive(Debug, Clone, Copy)]
pub struct TopicRequest<'a> {
    /// The concrete topic URI.
    pub topic: &'a str,
    /// The pattern the URI matched.
    pub pattern: &'a str,
    /// Placeholder values extracted from the URI.
    pub params: &'a TopicParams,
    /// Who is subscribing, unsubscribing or publishing.
    pub caller: &'a Caller,
}

/// Application logic bound to a topic pattern.
///
/// Hooks run synchronously on the broker event loop and must return
/// promptly. Work that needs I/O should be handed to a task, and its result
/// published back through a [`BrokerHandle`].
///
/// Every hook has a permissive default, so a handler only overrides what it
/// needs. A panicking hook is caught and reported as a handler failure.
///
/// ```
/// use serde_json::Value;
/// use wsbroker::{TopicError, topic::{TopicHandler, TopicRequest}};
///
/// /// Only authenticated principals may publish into rooms.
/// struct Rooms;
///
/// impl TopicHandler for Rooms {
///     fn on_publish(&self, req: &TopicRequest<'_>, payload: Value) -> Result<Value, TopicError> {
///         if req.caller.principal().is_none() && req.caller.connection_id().is_some() {
///             return Err(TopicError::unauthorized("anonymous publish"));
///         }
///         Ok(payload)
///     }
/// }
/// ```
///
/// [`BrokerHandle`]: crate::BrokerHandle
pub trait TopicHandler: Send + Sync + 'static {
    /// Called after a connection joins the topic. Returning an error undoes
    /// the subscription.
    fn on_subscribe(&self, _req: &TopicRequest<'_>) -> Result<(), TopicError> {
        Ok(())
    }

    /// Called after a connection leaves the topic, including on disconnect.
    fn on_unsubscribe(&self, _req: &TopicRequest<'_>) {}

    /// Called before an event is fanned out. The returned value is what
    /// subscribers receive. Returning an error vetoes the publish.
    fn on_publish(&self, _req: &TopicRequest<'_>, payload: Value) -> Result<Value, TopicError> {
        Ok(payload)
    }
}

/// A topic handler that accepts every operation unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl TopicHandler for PassThrough {}
