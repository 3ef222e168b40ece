//! REST state source against a mock host API.

use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use anomalywatch::source::{EntityFilter, RestStateSource, SourceError, StateSource};

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer secret")
}

async fn states(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!([
        { "entity_id": "sensor.boiler", "state": "21.5", "last_changed": "2024-05-01T10:00:00Z" },
        { "entity_id": "binary_sensor.door", "state": "off", "last_changed": "2024-05-01T09:00:00Z" },
    ])))
}

async fn state(headers: HeaderMap, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match id.as_str() {
        "sensor.boiler" => Ok(Json(json!({
            "entity_id": "sensor.boiler",
            "state": "21.5",
            "last_changed": "2024-05-01T10:00:00Z"
        }))),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn history(headers: HeaderMap, Path(_start): Path<String>) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    // Minimal responses omit the entity id after the first state.
    Ok(Json(json!([[
        { "entity_id": "sensor.boiler", "state": "20.0", "last_changed": "2024-05-01T08:00:00Z" },
        { "state": "unavailable", "last_changed": "2024-05-01T09:00:00Z" },
        { "state": "21.5", "last_changed": "2024-05-01T10:00:00Z" },
    ]])))
}

async fn mock_host() -> String {
    let app = Router::new()
        .route("/api/states", get(states))
        .route("/api/states/{id}", get(state))
        .route("/api/history/period/{start}", get(history));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn source(base: &str, token: Option<&str>) -> RestStateSource {
    RestStateSource::new(base, token.map(str::to_string), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_current_state_and_not_found() {
    let base = mock_host().await;
    let src = source(&base, Some("secret"));

    let current = src.current_state("sensor.boiler").await.unwrap();
    assert_eq!(current.value, "21.5");
    assert_eq!(current.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");

    let err = src.current_state("sensor.ghost").await.unwrap_err();
    assert!(matches!(err, SourceError::NotFound(id) if id == "sensor.ghost"));
}

#[tokio::test]
async fn test_history_is_flattened() {
    let base = mock_host().await;
    let src = source(&base, Some("secret"));
    let from = "2024-05-01T00:00:00Z".parse().unwrap();
    let to = "2024-05-02T00:00:00Z".parse().unwrap();

    let history = src.history("sensor.boiler", from, to).await.unwrap();
    let values: Vec<_> = history.iter().map(|s| s.value.as_str()).collect();
    assert_eq!(values, vec!["20.0", "unavailable", "21.5"]);
}

#[tokio::test]
async fn test_list_entities_with_filter() {
    let base = mock_host().await;
    let src = source(&base, Some("secret"));

    let all = src.list_entities(&EntityFilter::all()).await.unwrap();
    assert_eq!(all.len(), 2);

    let sensors = EntityFilter {
        domains: vec!["sensor".to_string()],
    };
    let only = src.list_entities(&sensors).await.unwrap();
    assert_eq!(only.into_iter().collect::<Vec<_>>(), vec!["sensor.boiler"]);
}

#[tokio::test]
async fn test_rejected_token_is_unavailable() {
    let base = mock_host().await;
    let src = source(&base, Some("wrong"));
    let err = src.list_entities(&EntityFilter::all()).await.unwrap_err();
    assert!(matches!(err, SourceError::Unavailable(msg) if msg.contains("401")));
}

#[tokio::test]
async fn test_unreachable_host_is_unavailable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let src = source(&format!("http://{addr}"), None);
    let err = src.current_state("sensor.boiler").await.unwrap_err();
    assert!(matches!(err, SourceError::Unavailable(_)));
}
