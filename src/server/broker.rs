use crate::{
    config::BrokerConfig,
    error::{RegistrationError, TopicError},
    origins::OriginRegistry,
    periodic::{self, HealthCheck, PeriodicTask, Probe, Scheduler},
    primitives::{Caller, ConnectionId},
    rpc::{RpcCtx, RpcDispatcher, RpcError, RpcRegistry},
    server::{
        handle::{CloseReason, Command, Outbound, Shared},
        BrokerStats, Connect, ConnectionInfo, Handshake, HandshakePolicy, ServerShutdown,
    },
    storage::{ClientDriver, ClientStorage},
    tasks::TaskSet,
    topic::{Fanout, Subscriber, TopicDispatcher, TopicHandler, TopicRegistry},
    types::{Exclude, InboundFrame, OutboundFrame},
    BrokerHandle,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, instrument, trace, warn};

/// Collects topics, procedures, periodic tasks and probes, and builds a
/// [`Broker`].
///
/// Registration happens here, before the broker starts. Once built, the
/// registries are immutable.
///
/// ```
/// use serde_json::Value;
/// use wsbroker::{rpc::{RpcCtx, RpcError}, topic::PassThrough, Broker, BrokerConfig};
///
/// # fn main() -> Result<(), wsbroker::RegistrationError> {
/// let broker = Broker::builder(BrokerConfig::default())
///     .topic("/room/{id}", PassThrough)?
///     .rpc("echo", |_ctx: RpcCtx, args: Vec<Value>| async move { Ok::<_, RpcError>(args) })?
///     .origin("https://app.example")
///     .build()?;
/// # let _ = broker;
/// # Ok(())
/// # }
/// ```
pub struct BrokerBuilder {
    config: BrokerConfig,
    topics: TopicRegistry,
    rpc: RpcRegistry,
    periodic: Vec<PeriodicTask>,
    probes: HashMap<String, Arc<dyn Probe>>,
    origins: OriginRegistry,
    driver: Option<Box<dyn ClientDriver>>,
}

impl fmt::Debug for BrokerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerBuilder")
            .field("config", &self.config)
            .field("topics", &self.topics.len())
            .field("procedures", &self.rpc.len())
            .field("periodic", &self.periodic)
            .field("probes", &self.probes.keys().collect::<Vec<_>>())
            .field("origins", &self.origins)
            .finish_non_exhaustive()
    }
}

impl BrokerBuilder {
    fn new(config: BrokerConfig) -> Self {
        let origins = config.origins.iter().cloned().collect();
        Self {
            config,
            topics: TopicRegistry::new(),
            rpc: RpcRegistry::new(),
            periodic: Vec::new(),
            probes: HashMap::new(),
            origins,
            driver: None,
        }
    }

    /// Register a topic handler. Patterns are matched in registration
    /// order.
    pub fn topic(mut self, pattern: &str, handler: impl TopicHandler) -> Result<Self, RegistrationError> {
        self.topics.register(pattern, handler)?;
        Ok(self)
    }

    /// Register a procedure.
    pub fn rpc<F, Fut, P, T>(
        mut self,
        procedure: impl Into<String>,
        handler: F,
    ) -> Result<Self, RegistrationError>
    where
        F: Fn(RpcCtx, P) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.rpc.register(procedure, handler)?;
        Ok(self)
    }

    /// Register a periodic task.
    pub fn periodic(mut self, task: PeriodicTask) -> Self {
        self.periodic.push(task);
        self
    }

    /// Register a probe, to be run by the `ping.services` entry of the same
    /// name.
    pub fn probe(mut self, name: impl Into<String>, probe: impl Probe) -> Self {
        self.probes.insert(name.into(), Arc::new(probe));
        self
    }

    /// Allow an origin, in addition to those in the configuration.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origins.add_origin(origin);
        self
    }

    /// Store session records with `driver`, instead of in memory.
    pub fn storage_driver(mut self, driver: impl ClientDriver) -> Self {
        self.driver = Some(Box::new(driver));
        self
    }

    /// Build the broker.
    ///
    /// Adds the keepalive task if `server.keepalive_ping` is set, the stats
    /// reporter if `server.stats_report` is set, and a
    /// health check for each `ping.services` entry. Fails if a service names
    /// a probe that was never registered.
    pub fn build(self) -> Result<Broker, RegistrationError> {
        let Self {
            config,
            topics,
            rpc,
            mut periodic,
            probes,
            origins,
            driver,
        } = self;
        let server = &config.server;

        if server.keepalive_ping {
            periodic.push(periodic::keepalive(server.keepalive_interval)?);
        }
        if server.stats_report {
            periodic.push(periodic::stats_report(server.stats_interval)?);
        }
        for service in &config.ping.services {
            let probe = probes
                .get(&service.name)
                .cloned()
                .ok_or_else(|| RegistrationError::UnknownProbe(service.name.clone()))?;
            let check = HealthCheck::new(service.name.as_str(), probe, service.failure_threshold);
            periodic.push(check.into_task(service.interval)?);
        }

        let storage_config = &config.client.storage;
        let storage = match driver {
            Some(driver) => ClientStorage::new(driver, storage_config.prefix.clone(), storage_config.ttl),
            None => ClientStorage::in_memory(storage_config.prefix.clone(), storage_config.ttl),
        };

        let policy = HandshakePolicy::new(origins, server.origin_check, server.peer_token.clone());
        let shared = Shared::new(
            policy,
            server.handshake_timeout,
            server.outbound_buffer,
            TaskSet::default(),
        );
        let (tx, rx) = mpsc::channel(server.command_buffer.max(1));
        let handle = BrokerHandle::new(tx, Arc::new(shared));

        let addr = server.socket_addr();
        let event_loop = EventLoop {
            commands: rx,
            connections: HashMap::new(),
            topics: TopicDispatcher::new(topics),
            rpc: RpcDispatcher::new(rpc, server.rpc_timeout),
            storage,
            periodic,
            tick_interval: server.tick_interval,
            server_ident: server.server_ident.clone(),
            broker: handle.clone(),
        };

        Ok(Broker {
            addr: addr.map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err)),
            handle,
            event_loop,
        })
    }
}

/// A configured broker, ready to start.
///
/// [`Broker::start`] spawns the event loop, after which connections can be
/// attached with a [`Connect`] object or the axum handler.
/// [`Broker::serve`] does both, listening on the configured address.
pub struct Broker {
    addr: io::Result<SocketAddr>,
    handle: BrokerHandle,
    event_loop: EventLoop,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("addr", &self.addr)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Start building a broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// A handle to the broker. Commands sent before [`Self::start`] are
    /// queued.
    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Spawn the event loop, returning its shutdown guard.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub fn start(self) -> ServerShutdown {
        let tasks = self.handle.shared().tasks.clone();
        let event_loop = self.event_loop;
        tasks.spawn_graceful(|token| event_loop.run(token));
        ServerShutdown::new(tasks, self.handle)
    }

    /// Start the broker, and accept WebSocket connections on the configured
    /// `server.host` and `server.port`.
    pub async fn serve(self) -> io::Result<ServerShutdown> {
        let addr = match &self.addr {
            Ok(addr) => *addr,
            Err(err) => return Err(io::Error::new(err.kind(), err.to_string())),
        };
        addr.serve(self).await
    }
}

/// A live connection, as the event loop sees it.
#[derive(Debug)]
struct Connection {
    member: Subscriber,
    origin: Option<String>,
    remote_addr: Option<SocketAddr>,
    prefixes: HashMap<String, String>,
    outbound: mpsc::Sender<Outbound>,
    tasks: TaskSet,
    calls: TaskSet,
}

impl Connection {
    /// Expand a `prefix:rest` CURIE registered with `PREFIX`. Anything else
    /// is returned unchanged.
    fn expand(&self, uri: String) -> String {
        if let Some((prefix, rest)) = uri.split_once(':') {
            if let Some(base) = self.prefixes.get(prefix) {
                return format!("{base}{rest}");
            }
        }
        uri
    }

    /// Queue a frame without waiting. Returns false if it was dropped.
    fn send(&self, frame: &OutboundFrame) -> bool {
        frame
            .encode()
            .is_some_and(|text| self.queue(Outbound::Text(text)))
    }

    fn queue(&self, item: Outbound) -> bool {
        match self.outbound.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = self.member.id(), "outbound buffer full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn info(&self) -> ConnectionInfo {
        let mut topics: Vec<String> = self.member.topics().map(ToOwned::to_owned).collect();
        topics.sort_unstable();
        ConnectionInfo {
            id: self.member.id(),
            principal: self.member.caller().principal().map(ToOwned::to_owned),
            origin: self.origin.clone(),
            remote_addr: self.remote_addr,
            topics,
        }
    }

    fn topic_error(&self, topic: String, err: &TopicError) {
        crate::metrics::record_topic_error(err.code());
        self.send(&OutboundFrame::TopicError {
            topic,
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }
}

/// The single task owning all broker state.
struct EventLoop {
    commands: mpsc::Receiver<Command>,
    connections: HashMap<ConnectionId, Connection>,
    topics: TopicDispatcher,
    rpc: RpcDispatcher,
    storage: ClientStorage,
    periodic: Vec<PeriodicTask>,
    tick_interval: Duration,
    server_ident: String,
    broker: BrokerHandle,
}

impl EventLoop {
    #[instrument(name = "EventLoop", skip_all)]
    async fn run(mut self, token: CancellationToken) {
        let mut scheduler = Scheduler::new(std::mem::take(&mut self.periodic), Instant::now());
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(periodic_tasks = scheduler.len(), "event loop started");

        loop {
            select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Shutdown signal received");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command);
                }
                now = tick.tick() => {
                    let pruned = self.storage.prune();
                    if pruned > 0 {
                        trace!(pruned, "expired session records evicted");
                    }
                    scheduler.tick(now, &self.broker, &self.broker.shared().tasks);
                }
            }
        }

        let open: Vec<_> = self.connections.keys().copied().collect();
        for conn_id in open {
            self.close(conn_id, CloseReason::Shutdown);
        }
        debug!("event loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Open {
                conn_id,
                handshake,
                outbound,
                tasks,
            } => self.open(conn_id, handshake, outbound, tasks),
            Command::Frame { conn_id, frame } => self.route(conn_id, frame),
            Command::Close { conn_id, reason } => self.close(conn_id, reason),
            Command::Push { msg, reply } => {
                let exclude = Exclude::from(msg.exclude);
                let result = self
                    .topics
                    .publish(&Caller::External, &msg.topic, msg.payload, &exclude, msg.eligible.as_deref())
                    .map(|fanout| fanout.map_or(0, |fanout| self.fan_out(fanout)));
                if let Err(err) = &result {
                    debug!(topic = %msg.topic, %err, "push rejected");
                    crate::metrics::record_topic_error(err.code());
                }
                let _ = reply.send(result);
            }
            Command::Keepalive => {
                for conn in self.connections.values() {
                    conn.queue(Outbound::Ping);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(BrokerStats {
                    connections: self.connections.len(),
                    topics: self.topics.topic_count(),
                });
            }
            Command::Disconnect { conn_id } => self.close(conn_id, CloseReason::Forced),
            Command::Connections { principal, reply } => {
                let mut found: Vec<_> = self
                    .connections
                    .values()
                    .filter(|conn| {
                        principal.is_none()
                            || conn.member.caller().principal() == principal.as_deref()
                    })
                    .map(Connection::info)
                    .collect();
                found.sort_unstable_by_key(|info| info.id);
                let _ = reply.send(found);
            }
        }
    }

    fn open(
        &mut self,
        conn_id: ConnectionId,
        handshake: Handshake,
        outbound: mpsc::Sender<Outbound>,
        tasks: TaskSet,
    ) {
        let Handshake {
            origin,
            remote_addr,
            principal,
        } = handshake;

        let record = json!({
            "origin": origin,
            "principal": principal,
            "remote_addr": remote_addr.map(|addr| addr.to_string()),
        });
        if let Err(err) = self.storage.put(conn_id, record) {
            warn!(conn_id, %err, "failed to store session");
            crate::metrics::record_storage_error("put");
        }

        let conn = Connection {
            member: Subscriber::new(conn_id, principal),
            origin,
            remote_addr,
            prefixes: HashMap::new(),
            outbound,
            calls: tasks.child(),
            tasks,
        };
        conn.send(&OutboundFrame::Welcome {
            session_id: conn_id,
            server_ident: self.server_ident.clone(),
        });
        debug!(conn_id, ?remote_addr, origin = ?conn.origin, "connection opened");
        crate::metrics::record_connection_opened();
        self.connections.insert(conn_id, conn);
    }

    fn route(&mut self, conn_id: ConnectionId, frame: InboundFrame) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            trace!(conn_id, "frame for a closed connection");
            return;
        };
        if let Err(err) = self.storage.refresh(conn_id) {
            warn!(conn_id, %err, "failed to refresh session");
            crate::metrics::record_storage_error("refresh");
        }

        match frame {
            InboundFrame::Prefix { prefix, uri } => {
                trace!(conn_id, %prefix, %uri, "prefix registered");
                conn.prefixes.insert(prefix, uri);
            }
            InboundFrame::Call {
                call_id,
                procedure,
                args,
            } => {
                let procedure = conn.expand(procedure);
                let session = self.storage.get(conn_id).unwrap_or_else(|err| {
                    warn!(conn_id, %err, "failed to read session");
                    crate::metrics::record_storage_error("get");
                    None
                });
                let ctx = RpcCtx {
                    conn_id,
                    principal: conn.member.caller().principal().map(ToOwned::to_owned),
                    origin: conn.origin.clone(),
                    session,
                    broker: self.broker.clone(),
                };
                let response = self.rpc.call(ctx, call_id, procedure, args);
                let outbound = conn.outbound.clone();
                conn.calls.spawn(async move {
                    let frame = response.await;
                    if let Some(text) = frame.encode() {
                        let _ = outbound.send(Outbound::Text(text)).await;
                    }
                });
            }
            InboundFrame::Subscribe { topic } => {
                let topic = conn.expand(topic);
                match self.topics.subscribe(&mut conn.member, &topic) {
                    Ok(joined) => trace!(conn_id, %topic, joined, "subscribe"),
                    Err(err) => {
                        debug!(conn_id, %topic, %err, "subscribe refused");
                        conn.topic_error(topic, &err);
                    }
                }
            }
            InboundFrame::Unsubscribe { topic } => {
                let topic = conn.expand(topic);
                let left = self.topics.unsubscribe(&mut conn.member, &topic);
                trace!(conn_id, %topic, left, "unsubscribe");
            }
            InboundFrame::Publish {
                topic,
                payload,
                exclude,
                eligible,
            } => {
                let topic = conn.expand(topic);
                let span = debug_span!("publish", conn_id, %topic);
                let _guard = span.enter();
                match self
                    .topics
                    .publish(conn.member.caller(), &topic, payload, &exclude, eligible.as_deref())
                {
                    Ok(Some(fanout)) => {
                        let delivered = self.fan_out(fanout);
                        trace!(delivered, "published");
                    }
                    Ok(None) => trace!("nothing to deliver"),
                    Err(err) => {
                        debug!(%err, "publish refused");
                        if let Some(conn) = self.connections.get(&conn_id) {
                            conn.topic_error(topic, &err);
                        }
                    }
                }
            }
        }
    }

    /// Queue an event for each recipient, returning how many accepted it. A
    /// recipient whose buffer is full misses the event.
    fn fan_out(&self, fanout: Fanout) -> usize {
        let Fanout {
            text,
            recipients,
            pattern,
        } = fanout;

        let mut delivered = 0;
        for id in &recipients {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            if conn.queue(Outbound::Text(text.clone())) {
                delivered += 1;
            }
        }
        crate::metrics::record_fanout(&pattern, delivered, recipients.len() - delivered);
        delivered
    }

    fn close(&mut self, conn_id: ConnectionId, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(&conn_id) else {
            return;
        };

        self.topics.unsubscribe_all(&mut conn.member);
        if let Err(err) = self.storage.remove(conn_id) {
            warn!(conn_id, %err, "failed to remove session");
            crate::metrics::record_storage_error("remove");
        }
        conn.calls.cancel();

        let closing = reason
            .close_frame()
            .is_some_and(|frame| conn.outbound.try_send(frame).is_ok());
        if !closing {
            conn.tasks.cancel();
        }

        match &reason {
            CloseReason::Protocol(err) => debug!(conn_id, %err, "connection closed"),
            _ => debug!(conn_id, reason = reason.label(), "connection closed"),
        }
        crate::metrics::record_connection_closed(reason.label());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{pusher::PushMessage, topic::PassThrough};
    use serde_json::Value;

    fn config() -> BrokerConfig {
        BrokerConfig::default()
    }

    #[test]
    fn unknown_probes_fail_the_build() {
        let mut config = config();
        config.ping.services.push(crate::config::PingService {
            name: "db".into(),
            interval: Duration::from_secs(1),
            failure_threshold: 3,
        });

        let err = Broker::builder(config.clone()).build().unwrap_err();
        assert_eq!(err, RegistrationError::UnknownProbe("db".into()));

        let probe = || async { Ok::<_, crate::PeriodicError>(()) };
        assert!(Broker::builder(config).probe("db", probe).build().is_ok());
    }

    #[test]
    fn duplicate_procedures_fail_registration() {
        let echo = |_: RpcCtx, args: Vec<Value>| async move { Ok::<_, RpcError>(args) };
        let err = Broker::builder(config())
            .rpc("echo", echo)
            .and_then(|b| b.rpc("echo", echo))
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateProcedure("echo".into()));
    }

    #[test]
    fn curies_expand_with_registered_prefixes() {
        let (outbound, _rx) = mpsc::channel(1);
        let mut conn = Connection {
            member: Subscriber::new(1, None),
            origin: None,
            remote_addr: None,
            prefixes: HashMap::new(),
            outbound,
            tasks: TaskSet::default(),
            calls: TaskSet::default(),
        };
        conn.prefixes.insert("chat".into(), "/chat/".into());

        assert_eq!(conn.expand("chat:lobby".into()), "/chat/lobby");
        assert_eq!(conn.expand("other:lobby".into()), "other:lobby");
        assert_eq!(conn.expand("/plain".into()), "/plain");
    }

    #[test]
    fn builtin_tasks_follow_the_config() {
        let names = |config: BrokerConfig| -> Vec<String> {
            let broker = Broker::builder(config).build().unwrap();
            broker.event_loop.periodic.iter().map(|t| t.name().to_owned()).collect()
        };
        assert!(names(config()).is_empty());

        let mut config = config();
        config.server.keepalive_ping = true;
        config.server.stats_report = true;
        assert_eq!(names(config), [periodic::KEEPALIVE_TASK, periodic::STATS_TASK]);
    }

    #[tokio::test]
    async fn pushes_reach_the_loop() {
        let shutdown = Broker::builder(config())
            .topic("/news", PassThrough)
            .unwrap()
            .build()
            .unwrap()
            .start();
        let broker = shutdown.broker();

        // no subscribers, nothing delivered
        assert_eq!(broker.publish(PushMessage::new("/news", json!("hi"))).await.unwrap(), 0);
        assert_eq!(broker.publish(PushMessage::new("/nowhere", json!(1))).await.unwrap(), 0);
        assert_eq!(broker.stats().await.unwrap(), BrokerStats::default());
        assert!(broker.connections().await.unwrap().is_empty());

        shutdown.shutdown().await;
        broker.closed().await;
        assert!(broker.is_closed());
    }
}
