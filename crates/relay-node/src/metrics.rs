//! Metrics instrumentation for the node core.
//!
//! Uses the `metrics` facade; the embedding layer decides where the numbers
//! go (e.g. by installing a Prometheus exporter).

use metrics::{counter, gauge};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CLIENTS_TOTAL: &str = "relay_clients_total";
    pub const CLIENTS_ACTIVE: &str = "relay_clients_active";
    pub const PUBLICATIONS_TOTAL: &str = "relay_publications_total";
    pub const PUBLICATIONS_BYTES: &str = "relay_publications_bytes";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const CHANNELS_ACTIVE: &str = "relay_channels_active";
    pub const RECOVERIES_TOTAL: &str = "relay_recoveries_total";
    pub const QUEUE_OVERFLOWS_TOTAL: &str = "relay_queue_overflows_total";
    pub const PRESENCE_EVICTED_TOTAL: &str = "relay_presence_evicted_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CLIENTS_TOTAL,
        "Total number of clients connected since node start"
    );
    metrics::describe_gauge!(names::CLIENTS_ACTIVE, "Current number of connected clients");
    metrics::describe_counter!(names::PUBLICATIONS_TOTAL, "Total number of publications");
    metrics::describe_counter!(names::PUBLICATIONS_BYTES, "Total payload bytes published");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Publications pushed at local subscribers, by result"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Current number of channels with local subscribers"
    );
    metrics::describe_counter!(
        names::RECOVERIES_TOTAL,
        "Recovery attempts on subscribe, by outcome"
    );
    metrics::describe_counter!(
        names::QUEUE_OVERFLOWS_TOTAL,
        "Subscribers disconnected for overflowing their delivery queue"
    );
    metrics::describe_counter!(
        names::PRESENCE_EVICTED_TOTAL,
        "Presence entries evicted by the liveness sweep"
    );

    info!("Metrics initialized");
}

/// Record a new client connection.
pub fn record_connection() {
    counter!(names::CLIENTS_TOTAL).increment(1);
    gauge!(names::CLIENTS_ACTIVE).increment(1.0);
}

/// Record a client disconnection.
pub fn record_disconnection() {
    gauge!(names::CLIENTS_ACTIVE).decrement(1.0);
}

/// Record an accepted publication.
pub fn record_publication(bytes: usize) {
    counter!(names::PUBLICATIONS_TOTAL).increment(1);
    counter!(names::PUBLICATIONS_BYTES).increment(bytes as u64);
}

/// Record a local delivery attempt.
pub fn record_delivery(result: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "result" => result).increment(1);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record a recovery attempt.
pub fn record_recovery(recovered: bool) {
    let outcome = if recovered { "recovered" } else { "fresh" };
    counter!(names::RECOVERIES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a forced disconnect caused by queue overflow.
pub fn record_queue_overflow() {
    counter!(names::QUEUE_OVERFLOWS_TOTAL).increment(1);
}

/// Record presence entries evicted by the sweep.
pub fn record_presence_evicted(count: usize) {
    counter!(names::PRESENCE_EVICTED_TOTAL).increment(count as u64);
}

/// Update the active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_do_not_panic_without_a_recorder() {
        init_metrics();
        record_connection();
        record_publication(64);
        record_delivery("delivered");
        record_recovery(true);
        record_disconnection();
    }
}
