use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, http::header, response::IntoResponse, routing::get};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Time until the response head is ready, by status class",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["status_class"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Image cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_COMMIT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_commit_total", "Staged entries committed")
        .expect("create cache_commit_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_commit_total");
    counter
});

static CACHE_DISCARD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_discard_total", "Staged entries discarded by reason");
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_discard_total");
    vec
});

static CACHE_READ_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_read_errors_total", "Corrupt or unreadable entries")
        .expect("create cache_read_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_read_errors_total");
    counter
});

static CACHE_CLEANUP_DIRS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_cleanup_dirs_total",
        "Abandoned staging directories removed",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_cleanup_dirs_total");
    counter
});

static ORIGIN_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("origin_errors_total", "Origin fetch errors by kind"),
        &["kind"],
    )
    .expect("create origin_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_errors_total");
    vec
});

static TRANSFORM_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("transform_errors_total", "Image transform failures")
        .expect("create transform_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register transform_errors_total");
    counter
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(status: StatusCode, elapsed: Duration) {
    let status_class = status_class(status.as_u16());
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class])
        .inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[status_class])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_cache_commit() {
    CACHE_COMMIT_TOTAL.inc();
}

pub fn record_cache_discard(reason: &str) {
    CACHE_DISCARD_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_cache_read_error() {
    CACHE_READ_ERRORS_TOTAL.inc();
}

pub fn record_cache_cleanup_dir() {
    CACHE_CLEANUP_DIRS_TOTAL.inc();
}

pub fn record_origin_error(kind: &str) {
    ORIGIN_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_transform_error() {
    TRANSFORM_ERRORS_TOTAL.inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
        gather(),
    )
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    axum::serve(listener, router())
        .await
        .context("metrics listener failed")
}
