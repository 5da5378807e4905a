//! ==============================================================================
//! api.rs - sensor ingestion / query endpoint
//! ==============================================================================
//!
//! purpose:
//!     the http face of the service. sensor firmware POSTs readings here,
//!     dashboards GET the history or the current level of every bin.
//!
//! request lifecycle:
//!
//!     received ──► OPTIONS ───────────────────────────► 200, empty
//!         │
//!         └──► method dispatch ──► POST ─► validate ─► insert ─► 200 / 400 / 500
//!                              ├─► GET ──────────────► select ─► 200 / 500
//!                              └─► other ─────────────────────► 405
//!
//!     every branch ends in exactly one response, and every response gets
//!     the same cross-origin headers from the layers in `router`.
//!
//! relationships:
//!     - uses: validation.rs (batch rules), store.rs (persistence),
//!             domain.rs (current-level view), error.rs (status mapping)
//!     - used by: main.rs (serves the router)
//!
//! ==============================================================================

use axum::{
    body::Bytes,
    extract::State,
    http::{
        header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN},
        HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};

use crate::domain::{latest_per_bin, BinSnapshot, Reading};
use crate::error::AppError;
use crate::store::ReadingStore;
use crate::validation::validate_batch;

pub const ALLOWED_HEADERS: &str = "authorization, x-client-info, apikey, content-type";

/// path the sensor firmware posts to
pub const SENSOR_PATH: &str = "/functions/v1/esp8266-data";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadingStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self { store }
    }
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub data: Vec<Reading>,
    pub bins_processed: usize,
    pub message: String,
}

#[derive(Serialize)]
pub struct DataResponse<T> {
    pub data: Vec<T>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", any(readings_handler))
        .route(SENSOR_PATH, any(readings_handler))
        .route("/bins", any(bins_handler))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        ))
        .layer(TraceLayer::new_for_http())
}

// ==============================================================================
// handlers
// ==============================================================================

async fn readings_handler(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    match method {
        Method::OPTIONS => preflight(),
        Method::POST => submit_readings(&state, &body).await.into_response(),
        Method::GET => fetch_readings(&state).await.into_response(),
        _ => AppError::MethodNotAllowed.into_response(),
    }
}

/// current level of every bin, derived from the history on each call
async fn bins_handler(State(state): State<AppState>, method: Method) -> Response {
    match method {
        Method::OPTIONS => preflight(),
        Method::GET => fetch_bins(&state).await.into_response(),
        _ => AppError::MethodNotAllowed.into_response(),
    }
}

fn preflight() -> Response {
    StatusCode::OK.into_response()
}

async fn submit_readings(state: &AppState, body: &[u8]) -> Result<Json<SubmitResponse>, AppError> {
    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| AppError::InvalidJson)?;
    tracing::debug!("Received sensor data: {}", payload);

    let rows = validate_batch(payload).map_err(|e| {
        tracing::info!("Rejected sensor data: {}", e);
        e
    })?;
    tracing::info!("Inserting {} reading(s)", rows.len());

    let data = state.store.insert_batch(rows).await?;
    let bins_processed = data.len();

    Ok(Json(SubmitResponse {
        success: true,
        data,
        bins_processed,
        message: format!("Successfully processed {} bin reading(s)", bins_processed),
    }))
}

async fn fetch_readings(state: &AppState) -> Result<Json<DataResponse<Reading>>, AppError> {
    let data = state.store.list_newest_first().await?;
    Ok(Json(DataResponse { data }))
}

async fn fetch_bins(state: &AppState) -> Result<Json<DataResponse<BinSnapshot>>, AppError> {
    let readings = state.store.list_newest_first().await?;
    Ok(Json(DataResponse { data: latest_per_bin(&readings) }))
}

/// anything that escaped a handler ends here
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    AppError::Internal(details).into_response()
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewReading;
    use crate::store::{ChangeMark, MemoryStore, StoreError, StoreFuture};
    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct FailingStore;

    impl ReadingStore for FailingStore {
        fn insert_batch(&self, _rows: Vec<NewReading>) -> StoreFuture<'_, Vec<Reading>> {
            Box::pin(async { Err::<Vec<Reading>, _>(StoreError::new("relation \"waste_bins\" does not exist")) })
        }

        fn list_newest_first(&self) -> StoreFuture<'_, Vec<Reading>> {
            Box::pin(async { Err::<Vec<Reading>, _>(StoreError::new("connection refused")) })
        }

        fn change_mark(&self) -> StoreFuture<'_, ChangeMark> {
            Box::pin(async { Err::<ChangeMark, _>(StoreError::new("connection refused")) })
        }
    }

    /// blows up if anything reaches the store
    struct PanickingStore;

    fn touched() -> Result<Vec<Reading>, StoreError> {
        panic!("store touched")
    }

    impl ReadingStore for PanickingStore {
        fn insert_batch(&self, _rows: Vec<NewReading>) -> StoreFuture<'_, Vec<Reading>> {
            Box::pin(async { touched() })
        }

        fn list_newest_first(&self) -> StoreFuture<'_, Vec<Reading>> {
            Box::pin(async { touched() })
        }

        fn change_mark(&self) -> StoreFuture<'_, ChangeMark> {
            Box::pin(async { touched().map(|_| ChangeMark::default()) })
        }
    }

    fn app_with(store: Arc<dyn ReadingStore>) -> Router {
        router(AppState::new(store))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Response) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn call(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let (status, response) = send(app, method, uri, body).await;
        (status, json_body(response).await)
    }

    fn assert_cors(response: &Response) {
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_HEADERS], ALLOWED_HEADERS);
    }

    #[tokio::test]
    async fn test_post_single_reading_rounds_and_persists() {
        let app = app_with(Arc::new(MemoryStore::new()));

        let (status, body) = call(
            &app,
            Method::POST,
            "/",
            r#"{"bin_id":"001","level":87.6,"location":"Lobby"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["bins_processed"], 1);
        assert_eq!(body["data"][0]["level"], 88);
        assert_eq!(body["message"], "Successfully processed 1 bin reading(s)");

        let (status, body) = call(&app, Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["bin_id"], "001");
        assert_eq!(rows[0]["level"], 88);
        assert_eq!(rows[0]["location"], "Lobby");
    }

    #[tokio::test]
    async fn test_post_batch_counts_every_reading() {
        let app = app_with(Arc::new(MemoryStore::new()));

        let (status, body) = call(
            &app,
            Method::POST,
            SENSOR_PATH,
            r#"[
                {"bin_id":"001","level":10,"location":"Lobby"},
                {"bin_id":"002","level":20,"location":"Kitchen"},
                {"bin_id":"003","level":30,"location":"Garage"}
            ]"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bins_processed"], 3);
        assert_eq!(body["data"].as_array().unwrap().len(), 3);

        let (_, body) = call(&app, Method::GET, SENSOR_PATH, "").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_batch_inserts_nothing() {
        let app = app_with(Arc::new(MemoryStore::new()));

        let (status, body) = call(
            &app,
            Method::POST,
            "/",
            r#"[
                {"bin_id":"001","level":10,"location":"Lobby"},
                {"bin_id":"002","level":150,"location":"Kitchen"}
            ]"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Level must be between 0 and 100 for bin 002"}));

        let (_, body) = call(&app, Method::GET, "/", "").await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_and_missing_fields_rejected() {
        let app = app_with(Arc::new(MemoryStore::new()));

        for payload in [
            r#"{"bin_id":"001","level":-1,"location":"Lobby"}"#,
            r#"{"bin_id":"001","level":101,"location":"Lobby"}"#,
            r#"{"level":50,"location":"Lobby"}"#,
            r#"{"bin_id":"001","level":50}"#,
            r#"{"bin_id":"001","level":"50","location":"Lobby"}"#,
            r#"[]"#,
        ] {
            let (status, body) = call(&app, Method::POST, "/", payload).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "payload: {}", payload);
            assert!(body["error"].is_string());
        }

        let (_, body) = call(&app, Method::POST, "/", r#"{"level":50,"location":"Lobby"}"#).await;
        assert_eq!(body["error"], "Missing required fields: bin_id, level, location");

        let (_, body) = call(&app, Method::GET, "/", "").await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_is_client_error() {
        let app = app_with(Arc::new(MemoryStore::new()));
        let (status, body) = call(&app, Method::POST, "/", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid JSON body");
    }

    #[tokio::test]
    async fn test_get_returns_newest_first() {
        let app = app_with(Arc::new(MemoryStore::new()));
        call(&app, Method::POST, "/", r#"{"bin_id":"001","level":1,"location":"A"}"#).await;
        call(&app, Method::POST, "/", r#"{"bin_id":"002","level":2,"location":"B"}"#).await;

        let (_, body) = call(&app, Method::GET, "/", "").await;
        assert_eq!(body["data"][0]["bin_id"], "002");

        call(&app, Method::POST, "/", r#"{"bin_id":"003","level":3,"location":"C"}"#).await;
        let (_, body) = call(&app, Method::GET, "/", "").await;
        let rows = body["data"].as_array().unwrap();
        let order: Vec<&str> = rows.iter().map(|r| r["bin_id"].as_str().unwrap()).collect();
        assert_eq!(order, vec!["003", "002", "001"]);
    }

    #[tokio::test]
    async fn test_preflight_is_empty_and_never_touches_store() {
        let app = app_with(Arc::new(PanickingStore));

        for uri in ["/", SENSOR_PATH, "/bins"] {
            let (status, response) = send(&app, Method::OPTIONS, uri, "").await;
            assert_eq!(status, StatusCode::OK);
            assert_cors(&response);
            assert!(response.headers().get(CONTENT_TYPE).is_none());
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert!(bytes.is_empty());
        }
    }

    #[tokio::test]
    async fn test_unsupported_methods_are_405() {
        let app = app_with(Arc::new(PanickingStore));

        for method in [Method::PUT, Method::DELETE, Method::PATCH] {
            let (status, response) = send(
                &app,
                method,
                "/",
                r#"{"bin_id":"001","level":50,"location":"Lobby"}"#,
            )
            .await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert_cors(&response);
            assert_eq!(json_body(response).await, json!({"error": "Method not allowed"}));
        }

        let (status, _) = call(&app, Method::POST, "/bins", "{}").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_details() {
        let app = app_with(Arc::new(FailingStore));

        let (status, response) = send(
            &app,
            Method::POST,
            "/",
            r#"{"bin_id":"001","level":50,"location":"Lobby"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&response);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            json_body(response).await,
            json!({"error": "Database error", "details": "relation \"waste_bins\" does not exist"})
        );

        let (status, body) = call(&app, Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Database error", "details": "connection refused"}));

        let (status, response) = send(&app, Method::GET, "/bins", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&response);
        assert_eq!(
            json_body(response).await,
            json!({"error": "Database error", "details": "connection refused"})
        );
    }

    #[tokio::test]
    async fn test_validation_runs_before_store() {
        // an invalid payload is rejected without reaching a broken store
        let app = app_with(Arc::new(PanickingStore));
        let (status, _) = call(&app, Method::POST, "/", r#"{"bin_id":"001","level":500,"location":"x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_panic_becomes_generic_500() {
        let app = app_with(Arc::new(PanickingStore));

        let (status, response) = send(&app, Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&response);
        assert_eq!(json_body(response).await, json!({"error": "Internal server error"}));
    }

    #[tokio::test]
    async fn test_bins_view_shows_latest_reading_per_bin() {
        let app = app_with(Arc::new(MemoryStore::new()));
        call(&app, Method::POST, "/", r#"{"bin_id":"001","level":20,"location":"Lobby"}"#).await;
        call(&app, Method::POST, "/", r#"{"bin_id":"002","level":60,"location":"Kitchen"}"#).await;
        call(&app, Method::POST, "/", r#"{"bin_id":"001","level":92,"location":"Lobby"}"#).await;

        let (status, response) = send(&app, Method::GET, "/bins", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_cors(&response);
        let body = json_body(response).await;
        let bins = body["data"].as_array().unwrap();
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0]["bin_id"], "001");
        assert_eq!(bins[0]["level"], 92);
        assert_eq!(bins[0]["status"], "full");
        assert_eq!(bins[1]["bin_id"], "002");
        assert_eq!(bins[1]["status"], "half_full");
    }
}
