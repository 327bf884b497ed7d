use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

// Create a new registry named `pm2io`
lazy_static! {
    pub static ref PM2IO_REGISTRY: Registry =
        Registry::new_custom(Some("pm2io".to_string()), None).unwrap();
}

// Register metrics with the `pm2io` registry
lazy_static! {
    pub static ref TRANSPORT_CONNECTED: IntGauge = register_int_gauge_with_registry!(
        "transport_connected",
        "Whether the collector stream is currently usable (1) or not (0)",
        PM2IO_REGISTRY
    )
    .unwrap();
    pub static ref TRANSPORT_CONNECTIONS_ESTABLISHED: IntCounter =
        register_int_counter_with_registry!(
            "transport_connections_established_total",
            "Number of successful stream handshakes",
            PM2IO_REGISTRY
        )
        .unwrap();
    pub static ref TRANSPORT_RECONNECTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "transport_reconnects_total",
        "Reconnections started, by the failure that caused them",
        &["reason"],
        PM2IO_REGISTRY
    )
    .unwrap();
    pub static ref TRANSPORT_CONNECT_FAILURES: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "transport_connect_failures_total",
            "Failed connect attempts, by phase",
            &["phase"],
            PM2IO_REGISTRY
        )
        .unwrap();
    pub static ref TRANSPORT_FRAMES_SENT: IntCounter = register_int_counter_with_registry!(
        "transport_frames_sent_total",
        "Frames written to the collector stream",
        PM2IO_REGISTRY
    )
    .unwrap();
    pub static ref TRANSPORT_FRAMES_DROPPED: IntCounter = register_int_counter_with_registry!(
        "transport_frames_dropped_total",
        "Frames dropped because no connection was usable",
        PM2IO_REGISTRY
    )
    .unwrap();
    pub static ref TRANSPORT_WRITE_FAILURES: IntCounter = register_int_counter_with_registry!(
        "transport_write_failures_total",
        "Writes that failed or timed out on an open stream",
        PM2IO_REGISTRY
    )
    .unwrap();
    pub static ref TRANSPORT_FRAMES_RECEIVED: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "transport_frames_received_total",
            "Inbound frames, by channel",
            &["channel"],
            PM2IO_REGISTRY
        )
        .unwrap();
    pub static ref TRANSPORT_MALFORMED_FRAMES: IntCounter = register_int_counter_with_registry!(
        "transport_malformed_frames_total",
        "Inbound frames that could not be decoded",
        PM2IO_REGISTRY
    )
    .unwrap();
    pub static ref ACTIONS_INVOKED: IntCounterVec = register_int_counter_vec_with_registry!(
        "actions_invoked_total",
        "Remote action invocations, by outcome",
        &["outcome"],
        PM2IO_REGISTRY
    )
    .unwrap();
}

/// Text exposition of every agent metric
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&PM2IO_REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
