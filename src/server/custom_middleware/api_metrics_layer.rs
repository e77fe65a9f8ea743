use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram_vec, register_int_counter_vec, HistogramVec,
    IntCounterVec,
};

static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_requests_total",
        "Handled HTTP requests",
        &["method", "status"]
    )
    .unwrap()
});

static LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency",
        &["method"],
        exponential_buckets(0.001, 2.0, 14).unwrap()
    )
    .unwrap()
});

pub async fn middleware(request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let timer = LATENCY.with_label_values(&[&method]).start_timer();

    let response = next.run(request).await;

    timer.observe_duration();
    REQUESTS
        .with_label_values(&[&method, response.status().as_str()])
        .inc();

    response
}
