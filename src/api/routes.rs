//! API route definitions.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use super::ApiError;
use crate::detect::DetectError;
use crate::entity::Priority;
use crate::scheduler::Tier;

type ApiResult = Result<Json<Value>, ApiError>;

const DEFAULT_LIMIT: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/findings", get(list_findings))
        .route("/findings/{id}", get(get_finding))
        .route("/findings/{id}/false-alarm", post(report_false_alarm))
        .route("/entities", get(list_entities).post(add_entity))
        .route("/entities/{id}", get(get_entity).delete(remove_entity))
        .route("/entities/{id}/monitoring", post(toggle_entity_monitoring))
        .route("/entities/{id}/learning", post(toggle_entity_learning))
        .route("/entities/{id}/ignore", post(ignore_entity))
        .route("/entities/{id}/reclassify", post(reclassify_entity))
        .route("/entities/{id}/baseline", get(get_baseline))
        .route("/schedule", get(schedule_status))
        .route("/tiers/{tier}/run", post(run_tier))
        .route("/monitoring", get(monitoring_status).post(toggle_monitoring))
        .route("/learning", get(learning_status).post(toggle_learning))
        .route("/reports", get(list_reports))
        .route("/reports/generate", post(generate_report))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "monitoring_active": state.engine.is_monitoring_active(),
        "entities": state.engine.registry().all().len(),
    }))
}

// -- findings -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FindingsQuery {
    limit: Option<usize>,
    entity: Option<String>,
}

async fn list_findings(State(state): State<AppState>, Query(q): Query<FindingsQuery>) -> ApiResult {
    let findings = state
        .engine
        .findings()
        .list_recent(q.limit.unwrap_or(DEFAULT_LIMIT), q.entity.as_deref())
        .await?;
    let total = findings.len();
    Ok(Json(json!({ "data": findings, "meta": { "total": total } })))
}

async fn get_finding(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let finding = state
        .engine
        .findings()
        .get(id)
        .await?
        .ok_or(DetectError::FindingNotFound(id))?;
    Ok(envelope(finding))
}

#[derive(Debug, Default, Deserialize)]
struct FalseAlarmRequest {
    reason: Option<String>,
}

async fn report_false_alarm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> ApiResult {
    // The body is optional; anything unparseable means "no reason given".
    let reason = serde_json::from_slice::<FalseAlarmRequest>(&body)
        .ok()
        .and_then(|b| b.reason);
    let outcome = state.engine.feedback().report_false_alarm(id, reason).await?;
    Ok(envelope(outcome))
}

// -- entities -----------------------------------------------------------------

async fn list_entities(State(state): State<AppState>) -> Json<Value> {
    let entities = state.engine.registry().all();
    let ignored = state.engine.registry().ignored();
    Json(json!({
        "data": entities,
        "meta": { "total": entities.len(), "ignored": ignored }
    }))
}

#[derive(Debug, Deserialize)]
struct AddEntityRequest {
    entity_id: String,
    priority: Option<Priority>,
}

async fn add_entity(State(state): State<AppState>, Json(req): Json<AddEntityRequest>) -> ApiResult {
    let entity = state
        .engine
        .add_entity(&req.entity_id, req.priority.unwrap_or(Priority::Standard))
        .await?;
    Ok(envelope(entity))
}

async fn get_entity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let entity = state
        .engine
        .registry()
        .get(&id)
        .ok_or(DetectError::UnknownEntity(id))?;
    Ok(envelope(entity))
}

async fn remove_entity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.engine.remove_entity(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_entity_monitoring(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> ApiResult {
    let entity = state
        .engine
        .feedback()
        .report_monitoring_toggle(&id, req.enabled)
        .await?;
    Ok(envelope(entity))
}

async fn toggle_entity_learning(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> ApiResult {
    Ok(envelope(state.engine.set_entity_learning(&id, req.enabled).await?))
}

async fn ignore_entity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.engine.ignore_entity(&id).await?;
    Ok(envelope(json!({ "ignored": id })))
}

async fn reclassify_entity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.engine.reclassify(&id).await?))
}

async fn get_baseline(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.engine.baseline(&id)?))
}

// -- schedule -----------------------------------------------------------------

async fn schedule_status(State(state): State<AppState>) -> Json<Value> {
    envelope(state.engine.schedule().snapshot(chrono::Utc::now()))
}

async fn run_tier(State(state): State<AppState>, Path(tier): Path<String>) -> ApiResult {
    let tier: Tier = tier.parse()?;
    let report = state.engine.run_tier(tier).await?;
    Ok(envelope(json!({ "tier": tier, "report": report })))
}

async fn monitoring_status(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({ "active": state.engine.is_monitoring_active() }))
}

async fn toggle_monitoring(State(state): State<AppState>, Json(req): Json<ToggleRequest>) -> ApiResult {
    state.engine.set_global_monitoring(req.enabled).await?;
    Ok(envelope(json!({ "active": req.enabled })))
}

async fn learning_status(State(state): State<AppState>) -> Json<Value> {
    envelope(state.engine.learning().status())
}

async fn toggle_learning(State(state): State<AppState>, Json(req): Json<ToggleRequest>) -> ApiResult {
    Ok(envelope(state.engine.set_learning(req.enabled).await?))
}

// -- reports ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReportsQuery {
    limit: Option<usize>,
}

async fn list_reports(State(state): State<AppState>, Query(q): Query<ReportsQuery>) -> ApiResult {
    let reports = state
        .engine
        .reports()
        .list(q.limit.unwrap_or(state.engine.config().reports.max_reports))
        .await?;
    let total = reports.len();
    Ok(Json(json!({ "data": reports, "meta": { "total": total } })))
}

async fn generate_report(State(state): State<AppState>) -> ApiResult {
    let report = state.engine.run_tier(Tier::Report).await?;
    Ok(envelope(report))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, SubsecRound, Utc};
    use tower::ServiceExt;

    use crate::api::{router, state::AppState};
    use crate::config::Config;
    use crate::detect::Engine;
    use crate::sink::LogSink;
    use crate::source::MemorySource;
    use crate::storage::open_memory_pool;

    async fn app() -> axum::Router {
        let now = Utc::now().trunc_subsecs(0) - Duration::minutes(1);
        let source = Arc::new(MemorySource::new());
        for h in 1..=12 {
            let value = if h % 2 == 0 { "19.0" } else { "21.0" };
            source.insert("sensor.boiler", value, now - Duration::hours(h));
        }
        source.insert("sensor.boiler", "30.0", now);

        let engine = Engine::open(
            Config::default(),
            open_memory_pool().unwrap(),
            source,
            Arc::new(LogSink),
            None,
        )
        .await
        .unwrap();
        router(AppState { engine })
    }

    async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["monitoring_active"], true);
    }

    #[tokio::test]
    async fn test_detect_then_report_false_alarm() {
        let app = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/entities",
            Some(r#"{"entity_id":"sensor.boiler","priority":"priority"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["kind"], "numeric");

        let (status, body) = call(&app, "POST", "/api/v1/tiers/priority/run", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["report"]["findings"], 1);

        let (_, body) = call(&app, "GET", "/api/v1/findings?entity=sensor.boiler", None).await;
        let id = body["data"][0]["id"].as_str().unwrap().to_string();

        let uri = format!("/api/v1/findings/{id}/false-alarm");
        let (status, body) = call(&app, "POST", &uri, Some(r#"{"reason":"boiler service"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["adjusted"], true);
        assert!((body["data"]["sensitivity"].as_f64().unwrap() - 0.9).abs() < 1e-9);

        let (_, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(body["data"]["adjusted"], false);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app().await;
        let uri = format!("/api/v1/findings/{}/false-alarm", uuid::Uuid::new_v4());
        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "finding_not_found");

        let (status, _) = call(&app, "GET", "/api/v1/entities/sensor.ghost/baseline", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/api/v1/tiers/hourly/run", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_global_monitoring_toggle() {
        let app = app().await;
        let (status, _) = call(&app, "POST", "/api/v1/monitoring", Some(r#"{"enabled":false}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, "GET", "/api/v1/monitoring", None).await;
        assert_eq!(body["data"]["active"], false);
    }
}
