use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::alerts::{Alert, AlertRecord, AlertStatistics, LiveAlert};
use crate::chains::{AttackChain, ChainStatistics};
use crate::config::MetricsConfig;
use crate::correlation::{CorrelatedThreat, CorrelationSummary, TimelineEntry};
use crate::error::EngineError;
use crate::events::{LogEntry, RawEvent, TrafficRecord, TrafficStats};
use crate::health::{HealthCheckManager, ServiceStatus};
use crate::metrics::create_metrics_router;
use crate::pipeline::IngestHandle;
use crate::query::{QueryFacade, StatsSummary};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub queries: QueryFacade,
    pub ingest: IngestHandle,
    pub health: Arc<HealthCheckManager>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    /// Kept as text so a malformed value falls back to the default limit
    /// instead of failing the request.
    pub limit: Option<String>,
}

pub fn create_router(state: AppState, metrics: &MetricsConfig) -> Router {
    let api = Router::new()
        // Live views
        .route("/stats", get(traffic_stats))
        .route("/alerts", get(live_alerts))
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .route("/api/status", get(status))
        // Alerts
        .route("/api/alerts/prioritized", get(prioritized_alerts))
        .route("/api/alerts/aggregated", get(aggregated_alerts))
        .route("/api/alerts/statistics", get(alert_statistics))
        .route("/api/alerts/history", get(alert_history))
        // Attack chains
        .route("/api/chains/active", get(active_chains))
        .route("/api/chains/all", get(all_chains))
        .route("/api/chains/statistics", get(chain_statistics))
        .route("/api/chains/:chain_id", get(get_chain))
        // Correlation
        .route("/api/correlation/threats", get(correlated_threats))
        .route("/api/correlation/threats/:threat_id", get(get_threat))
        .route("/api/correlation/summary", get(correlation_summary))
        .route("/api/correlation/timeline", get(correlation_timeline))
        .route("/api/correlation/run", post(run_correlation))
        // Logs and traffic
        .route("/api/logs/recent", get(recent_logs))
        .route("/api/logs/by-source/:source", get(logs_by_source))
        .route("/api/traffic/recent", get(recent_traffic))
        .route("/api/traffic/by-ip/:ip", get(traffic_by_ip))
        .route("/api/stats/summary", get(stats_summary))
        // Ingestion
        .route("/api/events", post(ingest_events))
        .with_state(state);

    let app = if metrics.enabled {
        api.merge(create_metrics_router(&metrics.endpoint))
    } else {
        api
    };

    app.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}

async fn traffic_stats(State(state): State<AppState>) -> Json<TrafficStats> {
    Json(state.queries.traffic().await)
}

async fn live_alerts(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<LiveAlert>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.live_alerts(limit).await)
}

async fn prioritized_alerts(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<Alert>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.prioritized(limit).await)
}

async fn aggregated_alerts(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<Alert>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.aggregated(limit).await)
}

async fn alert_history(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<AlertRecord>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.alert_history(limit).await)
}

async fn alert_statistics(State(state): State<AppState>) -> Json<AlertStatistics> {
    Json(state.queries.alert_statistics().await)
}

async fn active_chains(State(state): State<AppState>) -> Json<Vec<AttackChain>> {
    Json(state.queries.active_chains().await)
}

async fn all_chains(State(state): State<AppState>) -> Json<Vec<AttackChain>> {
    Json(state.queries.all_chains().await)
}

async fn chain_statistics(State(state): State<AppState>) -> Json<ChainStatistics> {
    Json(state.queries.chain_statistics().await)
}

/// Unknown or malformed IDs answer `null`.
async fn get_chain(State(state): State<AppState>, Path(chain_id): Path<String>) -> Json<Option<AttackChain>> {
    match Uuid::parse_str(&chain_id) {
        Ok(id) => Json(state.queries.chain(id).await),
        Err(_) => Json(None),
    }
}

async fn correlated_threats(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<CorrelatedThreat>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.threats(limit).await)
}

async fn get_threat(State(state): State<AppState>, Path(threat_id): Path<String>) -> Json<Option<CorrelatedThreat>> {
    match Uuid::parse_str(&threat_id) {
        Ok(id) => Json(state.queries.threat(id).await),
        Err(_) => Json(None),
    }
}

async fn correlation_summary(State(state): State<AppState>) -> Json<CorrelationSummary> {
    Json(state.queries.correlation_summary().await)
}

async fn correlation_timeline(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<TimelineEntry>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.timeline(limit).await)
}

async fn run_correlation(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.queries.engine().correlation.run().await;
    Json(json!({
        "success": outcome.success,
        "status": outcome.status.as_str(),
        "generation": outcome.generation,
        "threat_count": outcome.threat_count,
        "duration_ms": outcome.duration_ms,
    }))
}

async fn recent_logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<LogEntry>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.logs_recent(limit).await)
}

async fn logs_by_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<LogEntry>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.logs_by_source(&source, limit).await)
}

async fn recent_traffic(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<TrafficRecord>> {
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.traffic_recent(limit).await)
}

async fn traffic_by_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<LogEntry>> {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return Json(Vec::new());
    };
    let limit = state.queries.limit(query.limit.as_deref()).await;
    Json(state.queries.traffic_by_ip(ip, limit).await)
}

async fn stats_summary(State(state): State<AppState>) -> Json<StatsSummary> {
    Json(state.queries.summary().await)
}

/// Accepts one raw event object or an array of them.
async fn ingest_events(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let records = match payload {
        Value::Array(records) => records,
        record @ Value::Object(_) => vec![record],
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    let mut accepted = 0usize;
    let mut errors = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        let result = serde_json::from_value::<RawEvent>(record)
            .map_err(|e| EngineError::validation(e.to_string()))
            .and_then(|raw| state.ingest.submit(raw));

        match result {
            Ok(()) => accepted += 1,
            Err(EngineError::PipelineClosed) => {
                tracing::error!("Ingestion pipeline is not running");
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            Err(e) => errors.push(json!({ "index": index, "error": e.to_string() })),
        }
    }

    if !errors.is_empty() {
        tracing::warn!(accepted = accepted, rejected = errors.len(), "Rejected malformed events");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": accepted,
            "rejected": errors.len(),
            "errors": errors,
        })),
    ))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": state.health.quick_health_check(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let health = state.health.check_health().await.map_err(|e| {
        tracing::error!("Health check failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    match health.status {
        ServiceStatus::Healthy | ServiceStatus::Degraded => Ok(Json(json!(health))),
        ServiceStatus::Unhealthy | ServiceStatus::Starting => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let engine = state.queries.engine();
    Json(json!({
        "status": "NIDRS Running",
        "uptime_seconds": engine.uptime_seconds(),
        "queue_depth": state.ingest.queue_depth(),
        "generation": engine.correlation.generation(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::Event;
    use crate::pipeline::{Engine, IngestionPipeline};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use chrono::{Duration, Utc};
    use tower::util::ServiceExt;

    fn app() -> (Router, IngestionPipeline) {
        let config = EngineConfig::default();
        let engine = Arc::new(Engine::new(&config));
        let (pipeline, ingest) = IngestionPipeline::new(engine.clone(), &config);
        let state = AppState {
            queries: QueryFacade::new(engine.clone()),
            ingest: ingest.clone(),
            health: Arc::new(HealthCheckManager::new(engine, ingest)),
        };
        (create_router(state, &config.observability.metrics), pipeline)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn port_scan(pipeline: &mut IngestionPipeline, seconds: i64) {
        let event = Event::new(
            RawEvent::new("port_scan", "10.0.0.5")
                .with_timestamp(Utc::now() - Duration::minutes(1) + Duration::seconds(seconds))
                .with_dst_ip("10.0.0.9")
                .with_protocol("TCP"),
        )
        .unwrap();
        pipeline.process(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_endpoints_are_empty_arrays_on_fresh_engine() {
        let (app, _pipeline) = app();
        for uri in [
            "/alerts",
            "/api/alerts/prioritized",
            "/api/alerts/aggregated?limit=10",
            "/api/chains/active",
            "/api/chains/all",
            "/api/correlation/threats",
            "/api/correlation/timeline",
            "/api/logs/recent",
            "/api/logs/by-source/firewall",
            "/api/alerts/history",
            "/api/traffic/recent?limit=0",
            "/api/traffic/by-ip/10.0.0.1",
            "/api/traffic/by-ip/not-an-ip",
        ] {
            let (status, body) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::OK, "{}", uri);
            assert_eq!(body, json!([]), "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_empty_alert_statistics() {
        let (app, _pipeline) = app();
        let (status, body) = get_json(&app, "/api/alerts/statistics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_processed"], 0);
        assert_eq!(body["suppressed"], 0);
        assert_eq!(body["suppression_rate"], 0.0);
        assert_eq!(body["aggregated_groups"], 0);
    }

    #[tokio::test]
    async fn test_duplicate_alerts_fold_into_one_group() {
        let (app, mut pipeline) = app();
        for seconds in [0, 20, 40] {
            port_scan(&mut pipeline, seconds).await;
        }

        let (_, body) = get_json(&app, "/api/alerts/aggregated").await;
        let groups = body.as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["count"], 3);
        assert_eq!(groups[0]["related_alerts"].as_array().unwrap().len(), 2);
        assert!(groups[0]["score_breakdown"].is_object());

        let (_, stats) = get_json(&app, "/api/alerts/statistics").await;
        assert_eq!(stats["total_processed"], 3);
        assert_eq!(stats["suppressed"], 2);
        assert_eq!(stats["aggregated_groups"], 1);

        let (_, live) = get_json(&app, "/alerts").await;
        assert_eq!(live.as_array().unwrap().len(), 3);
        assert_eq!(live[0]["type"], "port_scan");

        let (_, traffic) = get_json(&app, "/stats").await;
        assert_eq!(traffic["total_packets"], 3);
        assert_eq!(traffic["protocols"]["TCP"], 3);
    }

    #[tokio::test]
    async fn test_alert_history_and_recent_traffic_are_newest_first() {
        let (app, mut pipeline) = app();
        for seconds in [0, 20, 40] {
            port_scan(&mut pipeline, seconds).await;
        }
        let login = Event::new(
            RawEvent::new("vpn_session", "10.0.0.7")
                .with_timestamp(Utc::now())
                .with_extra(crate::events::extra_keys::SEVERITY, json!("low")),
        )
        .unwrap();
        pipeline.process(login).await.unwrap();

        let (status, history) = get_json(&app, "/api/alerts/history").await;
        assert_eq!(status, StatusCode::OK);
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["type"], "port_scan");
        let at = |row: &Value| row["timestamp"].as_str().unwrap().parse::<chrono::DateTime<Utc>>().unwrap();
        assert!(at(&history[0]) > at(&history[2]));
        assert!(history[0]["id"].is_string());

        let (_, limited) = get_json(&app, "/api/alerts/history?limit=2").await;
        assert_eq!(limited.as_array().unwrap().len(), 2);

        // Events without a protocol are not traffic.
        let (status, traffic) = get_json(&app, "/api/traffic/recent?limit=abc").await;
        assert_eq!(status, StatusCode::OK);
        let traffic = traffic.as_array().unwrap();
        assert_eq!(traffic.len(), 3);
        assert_eq!(traffic[0]["protocol"], "TCP");
        assert_eq!(traffic[0]["src_ip"], "10.0.0.5");
        assert!(traffic[0]["seq"].as_u64().unwrap() > traffic[1]["seq"].as_u64().unwrap());

        let (_, one) = get_json(&app, "/api/traffic/recent?limit=1").await;
        assert_eq!(one.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_answer_null() {
        let (app, _pipeline) = app();
        let missing = Uuid::new_v4();
        for uri in [
            format!("/api/chains/{}", missing),
            format!("/api/correlation/threats/{}", missing),
            "/api/chains/not-a-uuid".to_string(),
        ] {
            let (status, body) = get_json(&app, &uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, Value::Null);
        }
    }

    #[tokio::test]
    async fn test_chain_lookup_by_id() {
        let (app, mut pipeline) = app();
        port_scan(&mut pipeline, 0).await;

        let (_, chains) = get_json(&app, "/api/chains/all").await;
        let id = chains[0]["id"].as_str().unwrap().to_string();
        let (_, chain) = get_json(&app, &format!("/api/chains/{}", id)).await;
        assert_eq!(chain["attacker_ip"], "10.0.0.5");
        assert_eq!(chain["stages"], json!(["reconnaissance"]));
    }

    #[tokio::test]
    async fn test_run_correlation_reports_outcome() {
        let (app, mut pipeline) = app();
        port_scan(&mut pipeline, 0).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/correlation/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["threat_count"], 1);

        let (_, summary) = get_json(&app, "/api/correlation/summary").await;
        assert_eq!(summary["total_threats"], 1);
        assert_eq!(summary["total_events"], 1);
    }

    #[tokio::test]
    async fn test_ingest_endpoint_counts_rejections() {
        let (app, _pipeline) = app();
        let payload = json!([
            { "timestamp": "2024-05-01T12:00:00Z", "event_type": "port_scan", "src_ip": "10.0.0.5" },
            { "timestamp": "2024-05-01T12:00:00Z", "event_type": "port_scan", "src_ip": "bogus" },
            { "event_type": "port_scan", "src_ip": "10.0.0.5" }
        ]);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/events")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["rejected"], 2);
        assert_eq!(body["errors"][0]["index"], 1);
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (app, _pipeline) = app();

        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["version"].is_string());

        let (_, body) = get_json(&app, "/api/status").await;
        assert_eq!(body["status"], "NIDRS Running");
        assert_eq!(body["queue_depth"], 0);

        let (status, _) = get_json(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _pipeline) = app();
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
