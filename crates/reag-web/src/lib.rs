//! JSON API over canonical properties, dedup metrics and alerts.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::{header::HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reag_core::{normalize, AddressFields, DedupMetricSample, NormalizedAddress};
use reag_storage::{MetricsStore, PgStore, PropertyStore};
use reag_sync::{deduplicate, AlertPolicy, DedupAlert, SourceRegistry, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reag-web";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;
const MAX_METRIC_SAMPLES: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PropertyStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub alert_policy: Arc<AlertPolicy>,
    /// Used by `POST /api/dedup` when the request names no threshold.
    pub default_threshold: u8,
}

impl AppState {
    pub fn new(store: Arc<dyn PropertyStore>, metrics: Arc<dyn MetricsStore>, alert_policy: AlertPolicy) -> Self {
        Self {
            store,
            metrics,
            alert_policy: Arc::new(alert_policy),
            default_threshold: reag_sync::Threshold::FUZZY_DEFAULT.value(),
        }
    }

    pub fn with_default_threshold(mut self, threshold: u8) -> Self {
        self.default_threshold = threshold;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/properties", get(list_properties_handler))
        .route("/api/properties/{key}", get(property_handler))
        .route("/api/metrics/{source_id}", get(metrics_handler))
        .route("/api/alerts/{source_id}", get(alerts_handler))
        .route("/api/dedup", post(dedup_handler))
        .layer(middleware::from_fn(request_id_layer))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "reag-web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(config.sources_path()).await?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    let store = Arc::new(store);
    let state = AppState::new(store.clone(), store, registry.alert_policy())
        .with_default_threshold(config.thresholds.fuzzy.value());
    serve(state, config.web_port).await
}

// ---- request ids and errors ----

#[derive(Debug, Clone)]
struct RequestId(String);

/// Error message waiting for the request id; rendered by `request_id_layer`.
#[derive(Debug, Clone)]
struct PendingError(String);

async fn request_id_layer(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = info_span!(
        "http_request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut resp = next.run(req).instrument(span).await;

    if let Some(PendingError(message)) = resp.extensions_mut().remove::<PendingError>() {
        let status = resp.status();
        resp = (
            status,
            Json(json!({"error": {"message": message, "request_id": request_id}})),
        )
            .into_response();
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    resp
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Logs the cause; the client only sees a generic message.
    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut resp = self.status.into_response();
        resp.extensions_mut().insert(PendingError(self.message));
        resp
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---- handlers ----

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "service": CRATE_NAME}))
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    source: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PropertyList {
    count: usize,
    properties: Vec<reag_core::CanonicalProperty>,
}

async fn list_properties_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<PropertyList> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let properties = state
        .store
        .list(query.source.as_deref().filter(|s| !s.is_empty()), limit)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(PropertyList {
        count: properties.len(),
        properties,
    }))
}

async fn property_handler(
    State(state): State<Arc<AppState>>,
    key: Result<Path<String>, PathRejection>,
) -> ApiResult<reag_core::CanonicalProperty> {
    let Path(key) = key?;
    state
        .store
        .get(&key)
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("property {key} not found")))
}

#[derive(Debug, Deserialize, Default)]
struct MetricsQuery {
    n: Option<usize>,
}

#[derive(Debug, Serialize)]
struct MetricPoint {
    #[serde(flatten)]
    sample: DedupMetricSample,
    ratio: f64,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    source_id: String,
    samples: Vec<MetricPoint>,
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    source_id: Result<Path<String>, PathRejection>,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> ApiResult<MetricsResponse> {
    let Path(source_id) = source_id?;
    let Query(query) = query?;
    let n = query.n.unwrap_or(state.alert_policy.window);
    if n == 0 || n > MAX_METRIC_SAMPLES {
        return Err(ApiError::bad_request(format!(
            "n must be between 1 and {MAX_METRIC_SAMPLES}"
        )));
    }
    let samples = state
        .metrics
        .get_recent_samples(&source_id, n)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(|sample| MetricPoint {
            ratio: sample.ratio(),
            sample,
        })
        .collect();
    Ok(Json(MetricsResponse { source_id, samples }))
}

#[derive(Debug, Serialize)]
struct AlertResponse {
    source_id: String,
    min_rate: Option<f64>,
    window: usize,
    alert: Option<DedupAlert>,
}

async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    source_id: Result<Path<String>, PathRejection>,
) -> ApiResult<AlertResponse> {
    let Path(source_id) = source_id?;
    let policy = &state.alert_policy;
    let recent = state
        .metrics
        .get_recent_samples(&source_id, policy.window)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(AlertResponse {
        min_rate: policy.min_rate(&source_id),
        window: policy.window,
        alert: policy.evaluate(&source_id, &recent),
        source_id,
    }))
}

/// An address as a single line or as separate fields.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AddressInput {
    Line(String),
    Fields(AddressFields),
}

impl AddressInput {
    fn into_fields(self) -> AddressFields {
        match self {
            AddressInput::Line(line) => AddressFields::parse_single_line(&line),
            AddressInput::Fields(fields) => fields,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DedupRequest {
    addresses: Vec<AddressInput>,
    threshold: Option<u8>,
}

#[derive(Debug, Serialize)]
struct DedupGroupView {
    indices: Vec<usize>,
    representative: NormalizedAddress,
}

#[derive(Debug, Serialize)]
struct DedupResponse {
    threshold: u8,
    input_count: usize,
    group_count: usize,
    groups: Vec<DedupGroupView>,
}

async fn dedup_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DedupRequest>, JsonRejection>,
) -> ApiResult<DedupResponse> {
    let Json(request) = body?;
    let threshold = request.threshold.unwrap_or(state.default_threshold);
    let addresses = request
        .addresses
        .into_iter()
        .map(AddressInput::into_fields)
        .collect::<Vec<_>>();

    let groups = deduplicate(&addresses, |a| Some(a), threshold)
        .map_err(|err| ApiError::bad_request(err.to_string()))?
        .into_iter()
        .map(|group| DedupGroupView {
            representative: normalize(group.representative()),
            indices: group.indices,
        })
        .collect::<Vec<_>>();

    Ok(Json(DedupResponse {
        threshold,
        input_count: addresses.len(),
        group_count: groups.len(),
        groups,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use reag_core::{CanonicalProperty, ListingAttributes, Provenance};
    use reag_storage::{LoadBatch, MemoryStore};
    use tower::ServiceExt;

    async fn seeded_state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        let address = AddressFields::parse_single_line("123 Main St, Seattle, WA 98101");
        let mut provenance = Provenance::new();
        provenance.add("zillow", "48749425");
        provenance.add("mls", "NWM2101990");
        let now = Utc::now();
        store
            .commit_batch(&LoadBatch {
                properties: vec![CanonicalProperty {
                    property_key: CanonicalProperty::property_key_for("zillow", "48749425"),
                    normalized: normalize(&address),
                    address,
                    attributes: ListingAttributes {
                        price: Some(725_000.0),
                        ..Default::default()
                    },
                    source_provenance: provenance,
                    audit_artifacts: vec![],
                    created_at: now,
                    updated_at: now,
                    stale_at: None,
                    merged_into: None,
                }],
                trends: vec![],
            })
            .await
            .unwrap();
        for (i, fuzzy) in [96usize, 94, 80, 97, 93].into_iter().enumerate() {
            store
                .append_sample(&DedupMetricSample {
                    timestamp: now - Duration::hours(10 - i as i64),
                    source_id: "zillow".into(),
                    input_count: 120,
                    strict_count: 100,
                    fuzzy_count: fuzzy,
                    threshold: 95,
                })
                .await
                .unwrap();
        }
        AppState::new(
            store.clone(),
            store,
            AlertPolicy::default().with_min_rate("zillow", 0.95),
        )
    }

    async fn call(state: AppState, req: axum::http::Request<Body>) -> (StatusCode, Response, serde_json::Value) {
        let resp = app(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, Response::from_parts(parts, Body::empty()), json)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_carries_request_id() {
        let (status, resp, body) = call(seeded_state().await, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn properties_list_and_lookup() {
        let state = seeded_state().await;
        let (status, _, body) = call(state.clone(), get("/api/properties?source=mls")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (_, _, body) = call(state.clone(), get("/api/properties?source=county")).await;
        assert_eq!(body["count"], 0);

        let (status, _, body) = call(state, get("/api/properties/zillow:48749425")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attributes"]["price"], 725_000.0);
    }

    #[tokio::test]
    async fn missing_property_renders_error_shape() {
        let req = axum::http::Request::builder()
            .uri("/api/properties/zillow:nope")
            .header(REQUEST_ID_HEADER, "req-123")
            .body(Body::empty())
            .unwrap();
        let (status, resp, body) = call(seeded_state().await, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["request_id"], "req-123");
        assert!(body["error"]["message"].as_str().unwrap().contains("zillow:nope"));
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "req-123");
    }

    #[tokio::test]
    async fn metrics_return_newest_samples_oldest_first() {
        let (status, _, body) = call(seeded_state().await, get("/api/metrics/zillow?n=2")).await;
        assert_eq!(status, StatusCode::OK);
        let samples = body["samples"].as_array().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0]["fuzzy_count"], 97);
        assert_eq!(samples[1]["ratio"], 0.93);

        let (status, _, body) = call(seeded_state().await, get("/api/metrics/zillow?n=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn malformed_query_renders_error_shape() {
        let req = axum::http::Request::builder()
            .uri("/api/metrics/zillow?n=abc")
            .header(REQUEST_ID_HEADER, "req-456")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(seeded_state().await, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["request_id"], "req-456");
        assert!(body["error"]["message"].as_str().unwrap().contains("query string"));

        let (status, _, body) = call(seeded_state().await, get("/api/properties?limit=-3")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].is_string());
        assert!(body["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn alerts_evaluate_recent_window() {
        let state = seeded_state().await;
        let (status, _, body) = call(state.clone(), get("/api/alerts/zillow")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["min_rate"], 0.95);
        assert_eq!(body["alert"]["offending"].as_array().unwrap().len(), 3);

        let (_, _, body) = call(state, get("/api/alerts/county")).await;
        assert!(body["alert"].is_null());
        assert!(body["min_rate"].is_null());
    }

    #[tokio::test]
    async fn dedup_endpoint_groups_addresses() {
        let addresses = json!([
            "123 Main St, Seattle, WA 98101",
            "123 Main Street, Seattle, WA 98101",
            "124 Main St, Seattle, WA 98101",
            {"street": "123 Main St.", "city": "Seattle", "state": "WA", "zip": "98101"}
        ]);
        let state = seeded_state().await;

        let (status, _, body) = call(
            state.clone(),
            post_json("/api/dedup", json!({"addresses": addresses, "threshold": 98})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["group_count"], 2);
        assert_eq!(body["groups"][0]["indices"], json!([0, 1, 3]));
        assert_eq!(body["groups"][0]["representative"]["street"], "123 main street");

        let (_, _, body) = call(state, post_json("/api/dedup", json!({"addresses": addresses}))).await;
        assert_eq!(body["threshold"], 95);
        assert_eq!(body["group_count"], 1);
    }

    #[tokio::test]
    async fn dedup_rejects_bad_input() {
        let state = seeded_state().await;
        let (status, _, body) = call(
            state.clone(),
            post_json("/api/dedup", json!({"addresses": [], "threshold": 101})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("101"));

        let (status, _, body) = call(state, post_json("/api/dedup", json!({"addr": []}))).await;
        assert!(status.is_client_error());
        assert!(body["error"]["message"].is_string());
    }
}
