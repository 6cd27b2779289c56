use crate::{
    error::TopicError,
    primitives::{Caller, ConnectionId},
    topic::{TopicParams, TopicRegistry, TopicRequest},
    types::{Exclude, OutboundFrame},
};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error};

/// A connection's side of topic membership.
///
/// The dispatcher keeps this set and its own subscriber sets in step: every
/// topic listed here has a live instance containing this connection, and
/// nothing else does.
#[derive(Debug)]
pub struct Subscriber {
    id: ConnectionId,
    caller: Caller,
    topics: HashSet<String>,
}

impl Subscriber {
    /// Create an unsubscribed member for a connection.
    pub fn new(id: ConnectionId, principal: Option<String>) -> Self {
        Self {
            id,
            caller: Caller::Connection { id, principal },
            topics: HashSet::new(),
        }
    }

    /// The connection id.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection as a topic caller.
    pub const fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Topics this connection is subscribed to.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    /// True if subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }
}

/// The result of a publish: one serialized `EVENT` frame and the connections
/// it goes to.
#[derive(Debug, Clone)]
pub struct Fanout {
    /// The serialized `EVENT` frame, shared by all recipients.
    pub text: Arc<str>,
    /// Connections that receive the frame. Each appears once.
    pub recipients: Vec<ConnectionId>,
    /// The pattern the topic matched.
    pub pattern: Arc<str>,
}

#[derive(Debug)]
struct TopicInstance {
    route: usize,
    params: TopicParams,
    subscribers: HashSet<ConnectionId>,
}

/// Routes subscribe, unsubscribe and publish traffic to topic handlers, and
/// tracks which connections are in which topic instance.
///
/// A topic instance exists exactly as long as it has subscribers.
#[derive(Debug, Default)]
pub struct TopicDispatcher {
    registry: TopicRegistry,
    instances: HashMap<String, TopicInstance>,
}

impl TopicDispatcher {
    /// Create a dispatcher over a fully populated registry.
    pub fn new(registry: TopicRegistry) -> Self {
        Self {
            registry,
            instances: HashMap::new(),
        }
    }

    /// Add `member` to `topic`.
    ///
    /// Returns `Ok(false)` if the member was already subscribed, in which case
    /// the handler is not invoked again. A veto from the handler removes the
    /// member again before returning the error.
    pub fn subscribe(&mut self, member: &mut Subscriber, topic: &str) -> Result<bool, TopicError> {
        if member.is_subscribed(topic) {
            return Ok(false);
        }

        let (route, params) = self
            .registry
            .resolve(topic)
            .ok_or_else(|| TopicError::UnknownTopic(topic.to_owned()))?;
        let id = member.id();

        let instance = self
            .instances
            .entry(topic.to_owned())
            .or_insert_with(|| TopicInstance {
                route,
                params,
                subscribers: HashSet::new(),
            });
        instance.subscribers.insert(id);
        member.topics.insert(topic.to_owned());

        let route = self.registry.route(instance.route);
        let req = TopicRequest {
            topic,
            pattern: route.pattern.as_str(),
            params: &instance.params,
            caller: &member.caller,
        };
        if let Err(err) = guarded("on_subscribe", topic, || route.handler.on_subscribe(&req)) {
            debug!(%err, topic, conn_id = id, "subscription refused");
            self.detach(id, topic);
            member.topics.remove(topic);
            return Err(err);
        }

        crate::metrics::record_subscription(route.pattern.as_str());
        Ok(true)
    }

    /// Remove `member` from `topic`. Returns `false` if it was not
    /// subscribed.
    pub fn unsubscribe(&mut self, member: &mut Subscriber, topic: &str) -> bool {
        if !member.topics.remove(topic) {
            return false;
        }
        self.leave(member, topic);
        true
    }

    /// Remove `member` from every topic it is subscribed to.
    pub fn unsubscribe_all(&mut self, member: &mut Subscriber) {
        let topics = std::mem::take(&mut member.topics);
        for topic in &topics {
            self.leave(member, topic);
        }
    }

    /// Run the publish hook and compute the fan-out for an event.
    ///
    /// Publishing to a URI that matches no pattern, or to a topic without
    /// subscribers, yields `Ok(None)`.
    pub fn publish(
        &self,
        caller: &Caller,
        topic: &str,
        payload: Value,
        exclude: &Exclude,
        eligible: Option<&[ConnectionId]>,
    ) -> Result<Option<Fanout>, TopicError> {
        let instance = self.instances.get(topic);
        let (route, params) = match instance {
            Some(instance) => (instance.route, instance.params.clone()),
            None => match self.registry.resolve(topic) {
                Some(resolved) => resolved,
                None => {
                    debug!(topic, "publish to a topic with no registered pattern");
                    return Ok(None);
                }
            },
        };

        let route = self.registry.route(route);
        let req = TopicRequest {
            topic,
            pattern: route.pattern.as_str(),
            params: &params,
            caller,
        };
        let payload = guarded("on_publish", topic, || route.handler.on_publish(&req, payload))?;
        crate::metrics::record_publish(route.pattern.as_str());

        let Some(instance) = instance else {
            return Ok(None);
        };

        let publisher = caller.connection_id();
        let recipients: Vec<_> = instance
            .subscribers
            .iter()
            .copied()
            .filter(|id| !exclude.excludes(publisher, *id))
            .filter(|id| eligible.map_or(true, |eligible| eligible.contains(id)))
            .collect();
        if recipients.is_empty() {
            return Ok(None);
        }

        let text = OutboundFrame::Event {
            topic: topic.to_owned(),
            payload,
        }
        .encode()
        .ok_or_else(|| TopicError::handler_failure("event payload is not serializable"))?;

        Ok(Some(Fanout {
            text,
            recipients,
            pattern: route.pattern.as_str().into(),
        }))
    }

    /// Number of live topic instances.
    pub fn topic_count(&self) -> usize {
        self.instances.len()
    }

    /// Number of subscribers of a topic instance.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.instances
            .get(topic)
            .map_or(0, |instance| instance.subscribers.len())
    }

    /// Remove a connection from an instance, dropping the instance once
    /// empty.
    fn detach(&mut self, id: ConnectionId, topic: &str) -> Option<TopicInstance> {
        let instance = self.instances.get_mut(topic)?;
        instance.subscribers.remove(&id);
        if instance.subscribers.is_empty() {
            return self.instances.remove(topic);
        }
        None
    }

    fn leave(&mut self, member: &Subscriber, topic: &str) {
        let id = member.id();
        let Some(instance) = self.instances.get(topic) else {
            return;
        };
        let (route, params) = (instance.route, instance.params.clone());
        self.detach(id, topic);

        let route = self.registry.route(route);
        let req = TopicRequest {
            topic,
            pattern: route.pattern.as_str(),
            params: &params,
            caller: &member.caller,
        };
        let _ = guarded("on_unsubscribe", topic, || {
            route.handler.on_unsubscribe(&req);
            Ok(())
        });
        crate::metrics::record_unsubscription(route.pattern.as_str());
    }
}

/// Run a topic hook, converting a panic into a handler failure.
fn guarded<T>(
    hook: &'static str,
    topic: &str,
    f: impl FnOnce() -> Result<T, TopicError>,
) -> Result<T, TopicError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(hook, topic, "topic handler panicked");
        Err(TopicError::handler_failure(format!("{hook} panicked")))
    })
}
