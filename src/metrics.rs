use metrics::{counter, gauge, Counter, Gauge};
use std::sync::LazyLock;

/// Metric name for tracking open connections.
pub(crate) const ACTIVE_CONNECTIONS: &str = "wsbroker.connections.active";
pub(crate) const ACTIVE_CONNECTIONS_HELP: &str = "Number of connections currently open";

/// Metric name for counting closed connections.
pub(crate) const CLOSED_CONNECTIONS: &str = "wsbroker.connections.closed";
pub(crate) const CLOSED_CONNECTIONS_HELP: &str =
    "Number of connections closed, labelled by the reason they were closed";

/// Metric name for counting rejected handshakes.
pub(crate) const HANDSHAKE_REJECTIONS: &str = "wsbroker.connections.handshake_rejections";
pub(crate) const HANDSHAKE_REJECTIONS_HELP: &str =
    "Number of WebSocket handshakes rejected before the connection opened";

// Metric for counting protocol errors.
pub(crate) const PROTOCOL_ERRORS: &str = "wsbroker.connections.protocol_errors";
pub(crate) const PROTOCOL_ERRORS_HELP: &str =
    "Number of malformed frames received. Each one closes its connection.";

/// Metric name for tracking topic subscriptions.
pub(crate) const SUBSCRIPTIONS: &str = "wsbroker.topics.subscriptions";
pub(crate) const SUBSCRIPTIONS_HELP: &str = "Number of live subscriptions per topic pattern";

/// Metric name for tracking live topic instances.
pub(crate) const LIVE_TOPICS: &str = "wsbroker.topics.live";
pub(crate) const LIVE_TOPICS_HELP: &str =
    "Number of topic instances with at least one subscriber, as of the last stats report";

/// Metric name for counting accepted publishes.
pub(crate) const PUBLISHES: &str = "wsbroker.topics.publishes";
pub(crate) const PUBLISHES_HELP: &str =
    "Number of publishes accepted by topic handlers. Not all publishes reach a subscriber.";

/// Metric name for counting delivered events.
pub(crate) const EVENTS_DELIVERED: &str = "wsbroker.topics.events_delivered";
pub(crate) const EVENTS_DELIVERED_HELP: &str = "Number of EVENT frames queued for subscribers";

// Metric name for counting events dropped for slow subscribers.
pub(crate) const EVENTS_DROPPED: &str = "wsbroker.topics.events_dropped";
pub(crate) const EVENTS_DROPPED_HELP: &str =
    "Number of EVENT frames dropped because a subscriber's outbound buffer was full";

/// Metric name for counting topic errors sent to clients or pushers.
pub(crate) const TOPIC_ERRORS: &str = "wsbroker.topics.errors";
pub(crate) const TOPIC_ERRORS_HELP: &str = "Number of refused subscribe or publish operations";

/// Metric name for counting RPC calls.
pub(crate) const RPC_CALLS: &str = "wsbroker.rpc.calls";
pub(crate) const RPC_CALLS_HELP: &str = "Number of CALL frames dispatched to a procedure";

/// Metric name for counting failed RPC calls.
pub(crate) const RPC_ERRORS: &str = "wsbroker.rpc.errors";
pub(crate) const RPC_ERRORS_HELP: &str =
    "Number of calls answered with CALLERROR, labelled by error code";

/// Metric for tracking in-flight calls.
pub(crate) const RPC_ACTIVE_CALLS: &str = "wsbroker.rpc.active_calls";
pub(crate) const RPC_ACTIVE_CALLS_HELP: &str = "Number of calls currently being handled";

/// Metric name for counting periodic task runs.
pub(crate) const PERIODIC_RUNS: &str = "wsbroker.periodic.runs";
pub(crate) const PERIODIC_RUNS_HELP: &str = "Number of periodic task runs, labelled by outcome";

// Metric name for counting skipped periodic runs.
pub(crate) const PERIODIC_SKIPPED: &str = "wsbroker.periodic.skipped";
pub(crate) const PERIODIC_SKIPPED_HELP: &str =
    "Number of periodic runs skipped because the previous run was still going";

/// Metric name for counting storage failures.
pub(crate) const STORAGE_ERRORS: &str = "wsbroker.storage.errors";
pub(crate) const STORAGE_ERRORS_HELP: &str = "Number of failed client storage operations";

/// Metric name for counting pushed messages.
pub(crate) const PUSHES: &str = "wsbroker.pusher.messages";
pub(crate) const PUSHES_HELP: &str =
    "Number of messages handled by pushers, labelled by strategy and outcome";

static DESCRIBE: LazyLock<()> = LazyLock::new(|| {
    metrics::describe_gauge!(
        ACTIVE_CONNECTIONS,
        metrics::Unit::Count,
        ACTIVE_CONNECTIONS_HELP
    );
    metrics::describe_counter!(
        CLOSED_CONNECTIONS,
        metrics::Unit::Count,
        CLOSED_CONNECTIONS_HELP
    );
    metrics::describe_counter!(
        HANDSHAKE_REJECTIONS,
        metrics::Unit::Count,
        HANDSHAKE_REJECTIONS_HELP
    );
    metrics::describe_counter!(PROTOCOL_ERRORS, metrics::Unit::Count, PROTOCOL_ERRORS_HELP);
    metrics::describe_gauge!(SUBSCRIPTIONS, metrics::Unit::Count, SUBSCRIPTIONS_HELP);
    metrics::describe_gauge!(LIVE_TOPICS, metrics::Unit::Count, LIVE_TOPICS_HELP);
    metrics::describe_counter!(PUBLISHES, metrics::Unit::Count, PUBLISHES_HELP);
    metrics::describe_counter!(
        EVENTS_DELIVERED,
        metrics::Unit::Count,
        EVENTS_DELIVERED_HELP
    );
    metrics::describe_counter!(EVENTS_DROPPED, metrics::Unit::Count, EVENTS_DROPPED_HELP);
    metrics::describe_counter!(TOPIC_ERRORS, metrics::Unit::Count, TOPIC_ERRORS_HELP);
    metrics::describe_counter!(RPC_CALLS, metrics::Unit::Count, RPC_CALLS_HELP);
    metrics::describe_counter!(RPC_ERRORS, metrics::Unit::Count, RPC_ERRORS_HELP);
    metrics::describe_gauge!(
        RPC_ACTIVE_CALLS,
        metrics::Unit::Count,
        RPC_ACTIVE_CALLS_HELP
    );
    metrics::describe_counter!(PERIODIC_RUNS, metrics::Unit::Count, PERIODIC_RUNS_HELP);
    metrics::describe_counter!(
        PERIODIC_SKIPPED,
        metrics::Unit::Count,
        PERIODIC_SKIPPED_HELP
    );
    metrics::describe_counter!(STORAGE_ERRORS, metrics::Unit::Count, STORAGE_ERRORS_HELP);
    metrics::describe_counter!(PUSHES, metrics::Unit::Count, PUSHES_HELP);
});

/// Get or register the open connections gauge.
pub(crate) fn active_connections() -> Gauge {
    let _ = &DESCRIBE;
    gauge!(ACTIVE_CONNECTIONS)
}

/// Record a connection reaching the open state.
pub(crate) fn record_connection_opened() {
    active_connections().increment(1);
}

/// Record a connection leaving the open state.
pub(crate) fn record_connection_closed(reason: &'static str) {
    active_connections().decrement(1);
    let _ = &DESCRIBE;
    counter!(CLOSED_CONNECTIONS, "reason" => reason).increment(1);
}

/// Record a rejected handshake.
pub(crate) fn record_handshake_rejected(reason: &'static str) {
    let _ = &DESCRIBE;
    counter!(HANDSHAKE_REJECTIONS, "reason" => reason).increment(1);
}

/// Record a malformed inbound frame.
pub(crate) fn record_protocol_error() {
    let _ = &DESCRIBE;
    counter!(PROTOCOL_ERRORS).increment(1);
}

/// Get or register the subscriptions gauge for a topic pattern.
pub(crate) fn subscriptions(pattern: &str) -> Gauge {
    let _ = &DESCRIBE;
    gauge!(SUBSCRIPTIONS, "pattern" => pattern.to_string())
}

/// Record a new subscription.
pub(crate) fn record_subscription(pattern: &str) {
    subscriptions(pattern).increment(1);
}

/// Record a removed subscription.
pub(crate) fn record_unsubscription(pattern: &str) {
    subscriptions(pattern).decrement(1);
}

/// Record a stats report. The connections gauge is kept live elsewhere,
/// and is resynchronised here.
pub(crate) fn record_stats(stats: &crate::BrokerStats) {
    active_connections().set(stats.connections as f64);
    let _ = &DESCRIBE;
    gauge!(LIVE_TOPICS).set(stats.topics as f64);
}

/// Record a publish accepted by a topic handler.
pub(crate) fn record_publish(pattern: &str) {
    let _ = &DESCRIBE;
    counter!(PUBLISHES, "pattern" => pattern.to_string()).increment(1);
}

/// Get or register a counter for events delivered on a topic pattern.
pub(crate) fn events_delivered(pattern: &str) -> Counter {
    let _ = &DESCRIBE;
    counter!(EVENTS_DELIVERED, "pattern" => pattern.to_string())
}

/// Get or register a counter for events dropped on a topic pattern.
pub(crate) fn events_dropped(pattern: &str) -> Counter {
    let _ = &DESCRIBE;
    counter!(EVENTS_DROPPED, "pattern" => pattern.to_string())
}

/// Record the outcome of one fan-out.
pub(crate) fn record_fanout(pattern: &str, delivered: usize, dropped: usize) {
    events_delivered(pattern).increment(delivered as u64);
    if dropped > 0 {
        events_dropped(pattern).increment(dropped as u64);
    }
}

/// Record a refused subscribe or publish.
pub(crate) fn record_topic_error(code: &'static str) {
    let _ = &DESCRIBE;
    counter!(TOPIC_ERRORS, "code" => code).increment(1);
}

/// Get or register the in-flight calls gauge for a procedure.
pub(crate) fn active_calls(procedure: &str) -> Gauge {
    let _ = &DESCRIBE;
    gauge!(RPC_ACTIVE_CALLS, "procedure" => procedure.to_string())
}

/// Record a call starting.
pub(crate) fn record_call(procedure: &str) {
    let _ = &DESCRIBE;
    counter!(RPC_CALLS, "procedure" => procedure.to_string()).increment(1);
    active_calls(procedure).increment(1);
}

/// Record a call finishing, with the error code if it failed.
pub(crate) fn record_call_completed(procedure: &str, error_code: Option<&str>) {
    active_calls(procedure).decrement(1);
    if let Some(code) = error_code {
        record_call_error(procedure, code);
    }
}

/// Record a call answered with an error.
pub(crate) fn record_call_error(procedure: &str, code: &str) {
    let _ = &DESCRIBE;
    counter!(
        RPC_ERRORS,
        "procedure" => procedure.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a finished periodic run.
pub(crate) fn record_periodic_run(task: &str, outcome: &'static str) {
    let _ = &DESCRIBE;
    counter!(PERIODIC_RUNS, "task" => task.to_string(), "outcome" => outcome).increment(1);
}

/// Record a skipped periodic run.
pub(crate) fn record_periodic_skipped(task: &str) {
    let _ = &DESCRIBE;
    counter!(PERIODIC_SKIPPED, "task" => task.to_string()).increment(1);
}

/// Record a failed storage operation.
pub(crate) fn record_storage_error(operation: &'static str) {
    let _ = &DESCRIBE;
    counter!(STORAGE_ERRORS, "operation" => operation).increment(1);
}

/// Record a message handled by a pusher.
pub(crate) fn record_push(strategy: &'static str, outcome: &'static str) {
    let _ = &DESCRIBE;
    counter!(PUSHES, "strategy" => strategy, "outcome" => outcome).increment(1);
}
