use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
    // Request cache outcomes: hit, miss, bypass, error, skip
    pub static ref REQUEST_CACHE_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("request_cache_events", "The number of request cache lookups by outcome"),
        &["event"]
    ).unwrap();
    // Circuit breaker state changes
    pub static ref CIRCUIT_BREAKER_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("circuit_breaker_transitions", "The number of circuit breaker state changes"),
        &["state"]
    ).unwrap();
    // Warm cache lookups: fresh, stale, absent
    pub static ref WARM_CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("warm_cache_lookups", "The number of warm cache lookups by result"),
        &["result"]
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REQUEST_CACHE_EVENTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CIRCUIT_BREAKER_TRANSITIONS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(WARM_CACHE_LOOKUPS.clone()))
        .unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

/// Count a request cache outcome
pub fn record_cache_event(event: &str) {
    REQUEST_CACHE_EVENTS.with_label_values(&[event]).inc();
}

/// Count a circuit breaker state change
pub fn record_breaker_transition(state: &str) {
    CIRCUIT_BREAKER_TRANSITIONS.with_label_values(&[state]).inc();
}

/// Count a warm cache lookup
pub fn record_warm_lookup(result: &str) {
    WARM_CACHE_LOOKUPS.with_label_values(&[result]).inc();
}
