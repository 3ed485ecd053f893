//! Telemetry counters, all in the default registry under the `catalyst`
//! namespace and exposed in text format on the metrics listener.

use lazy_static::lazy_static;
use prometheus::{
    Counter, IntCounter, IntCounterVec, IntGauge, Opts, register_counter, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("catalyst").subsystem(subsystem)
}

lazy_static! {
    pub static ref PROTOCOL_REQUESTS: IntCounterVec = register_int_counter_vec!(
        opts("protocol", "request", "Number of requests handled."),
        &["protocol"]
    )
    .expect("register catalyst_protocol_request");
    pub static ref PROTOCOL_STATUS: IntCounterVec = register_int_counter_vec!(
        opts("protocol", "status_code", "Number of requests answered with an error status."),
        &["protocol", "status"]
    )
    .expect("register catalyst_protocol_status_code");
    pub static ref PROTOCOL_DATAPOINTS: IntCounterVec = register_int_counter_vec!(
        opts("protocol", "datapoints", "Number of processed datapoints."),
        &["protocol"]
    )
    .expect("register catalyst_protocol_datapoints");
    pub static ref GRAPHITE_TCP_REQUESTS: IntCounter = register_int_counter!(opts(
        "graphite_tcp",
        "requests_total",
        "Number of TCP connections handled."
    ))
    .expect("register catalyst_graphite_tcp_requests_total");
    pub static ref GRAPHITE_TCP_OK: IntCounter = register_int_counter!(opts(
        "graphite_tcp",
        "requests_success",
        "Number of TCP connections fully processed."
    ))
    .expect("register catalyst_graphite_tcp_requests_success");
    pub static ref GRAPHITE_TCP_ERRORS: IntCounter = register_int_counter!(opts(
        "graphite_tcp",
        "requests_errors",
        "Number of TCP connections dropped on error."
    ))
    .expect("register catalyst_graphite_tcp_requests_errors");
    pub static ref GRAPHITE_TCP_NOAUTH: IntCounter = register_int_counter!(opts(
        "graphite_tcp",
        "requests_noauth",
        "Number of TCP connections without a token line."
    ))
    .expect("register catalyst_graphite_tcp_requests_noauth");
    pub static ref GRAPHITE_TCP_DATAPOINTS: IntCounter = register_int_counter!(opts(
        "graphite_tcp",
        "requests_datapoints",
        "Number of datapoints received over TCP."
    ))
    .expect("register catalyst_graphite_tcp_requests_datapoints");
    pub static ref GRAPHITE_TCP_ELAPSED: Counter = register_counter!(opts(
        "graphite_tcp",
        "requests_elapsed_time",
        "Seconds spent serving TCP connections."
    ))
    .expect("register catalyst_graphite_tcp_requests_elapsed_time");
    pub static ref ERROR_MADS: IntCounterVec = register_int_counter_vec!(
        opts("error", "mads", "Monthly Active Data Streams limit errors."),
        &["app"]
    )
    .expect("register catalyst_error_mads");
    pub static ref ERROR_DDP: IntCounterVec = register_int_counter_vec!(
        opts("error", "ddp", "Daily Data Points limit errors."),
        &["app"]
    )
    .expect("register catalyst_error_ddp");
    pub static ref ERROR_BROKEN_PIPE: IntCounter = register_int_counter!(opts(
        "error",
        "broken_pipe",
        "Broken pipes seen while writing to the sink."
    ))
    .expect("register catalyst_error_broken_pipe");
    pub static ref ERROR_CONNRESET: IntCounter = register_int_counter!(opts(
        "error",
        "connreset",
        "Connections reset by the sink."
    ))
    .expect("register catalyst_error_connreset");
    pub static ref BANNISH_CURRENT: IntGauge = register_int_gauge!(opts(
        "bannish",
        "current",
        "Number of tokens currently banned."
    ))
    .expect("register catalyst_bannish_current");
    pub static ref BANNISH_REQUESTS: IntCounterVec = register_int_counter_vec!(
        opts("bannish", "request", "Number of requests carrying a banned token."),
        &["token"]
    )
    .expect("register catalyst_bannish_request");
}

/// Touch every metric so the exposition is complete from the first scrape.
pub fn register() {
    lazy_static::initialize(&PROTOCOL_REQUESTS);
    lazy_static::initialize(&PROTOCOL_STATUS);
    lazy_static::initialize(&PROTOCOL_DATAPOINTS);
    lazy_static::initialize(&GRAPHITE_TCP_REQUESTS);
    lazy_static::initialize(&GRAPHITE_TCP_OK);
    lazy_static::initialize(&GRAPHITE_TCP_ERRORS);
    lazy_static::initialize(&GRAPHITE_TCP_NOAUTH);
    lazy_static::initialize(&GRAPHITE_TCP_DATAPOINTS);
    lazy_static::initialize(&GRAPHITE_TCP_ELAPSED);
    lazy_static::initialize(&ERROR_MADS);
    lazy_static::initialize(&ERROR_DDP);
    lazy_static::initialize(&ERROR_BROKEN_PIPE);
    lazy_static::initialize(&ERROR_CONNRESET);
    lazy_static::initialize(&BANNISH_CURRENT);
    lazy_static::initialize(&BANNISH_REQUESTS);
}
