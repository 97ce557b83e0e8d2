use axum::{http::StatusCode, response::Response, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

// Global metrics
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    registry.register(Box::new(EVENTS_INGESTED.clone())).unwrap();
    registry.register(Box::new(EVENTS_REJECTED.clone())).unwrap();
    registry.register(Box::new(EVENTS_DROPPED.clone())).unwrap();
    registry.register(Box::new(ALERTS_PROCESSED.clone())).unwrap();
    registry.register(Box::new(ALERTS_SUPPRESSED.clone())).unwrap();
    registry.register(Box::new(OPEN_ALERT_GROUPS.clone())).unwrap();
    registry.register(Box::new(ACTIVE_CHAINS.clone())).unwrap();
    registry.register(Box::new(INGEST_QUEUE_DEPTH.clone())).unwrap();
    registry.register(Box::new(CORRELATION_RUNS.clone())).unwrap();
    registry.register(Box::new(CORRELATION_RUN_DURATION.clone())).unwrap();
    registry.register(Box::new(QUERY_TOTAL.clone())).unwrap();

    registry
});

pub static EVENTS_INGESTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("nidrs_events_ingested_total", "Events accepted by the ingestion pipeline")
        .expect("metric can be created")
});

pub static EVENTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("nidrs_events_rejected_total", "Events rejected at the ingestion boundary"),
        &["reason"],
    )
    .expect("metric can be created")
});

pub static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("nidrs_events_dropped_total", "Events dropped after exhausting store retries"),
        &["store"],
    )
    .expect("metric can be created")
});

pub static ALERTS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("nidrs_alerts_processed_total", "Scored alerts passed to the aggregator")
        .expect("metric can be created")
});

pub static ALERTS_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("nidrs_alerts_suppressed_total", "Alerts folded into an existing group")
        .expect("metric can be created")
});

pub static OPEN_ALERT_GROUPS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("nidrs_open_alert_groups", "Alert groups inside their aggregation window")
        .expect("metric can be created")
});

pub static ACTIVE_CHAINS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("nidrs_active_chains", "Attack chains with activity inside the inactivity timeout")
        .expect("metric can be created")
});

pub static INGEST_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("nidrs_ingest_queue_depth", "Events waiting for the ingestion worker")
        .expect("metric can be created")
});

pub static CORRELATION_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("nidrs_correlation_runs_total", "Full correlation recomputes by outcome"),
        &["outcome"],
    )
    .expect("metric can be created")
});

pub static CORRELATION_RUN_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("nidrs_correlation_run_duration_seconds", "Correlation recompute duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .expect("metric can be created")
});

pub static QUERY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("nidrs_queries_total", "Dashboard queries served by endpoint"),
        &["endpoint"],
    )
    .expect("metric can be created")
});

pub fn create_metrics_router(endpoint: &str) -> Router {
    Router::new().route(endpoint, get(metrics_handler))
}

async fn metrics_handler() -> Result<Response<String>, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => {
            let response = Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4")
                .body(output)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(response)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_exposes_engine_metrics() {
        EVENTS_REJECTED.with_label_values(&["validation"]).inc();
        CORRELATION_RUNS.with_label_values(&["completed"]).inc();

        let names: Vec<String> = REGISTRY.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"nidrs_events_rejected_total".to_string()));
        assert!(names.contains(&"nidrs_correlation_runs_total".to_string()));
    }
}
