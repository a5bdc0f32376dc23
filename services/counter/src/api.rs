use crate::config::ApiConfig;
use crate::engine::VisitorCounter;
use crate::error::CounterError;
use crate::fingerprint::VisitFingerprint;
use crate::model::DayVisitors;
use crate::retention::day_stamp;
use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Header carrying an optional client-generated visitor id
pub const CLIENT_ID_HEADER: &str = "x-visitor-cid";

/// Header carrying the admin token
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const TOKEN_MAC_KEY: &[u8] = b"visitor-counter-admin-token";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub counter: Arc<VisitorCounter>,
    pub service_name: String,
    pub admin_token: Option<String>,
}

/// Query parameters for hit registration
#[derive(Debug, Default, Deserialize)]
pub struct HitQuery {
    /// Counter key (for `/api/hit?key=`)
    pub key: Option<String>,
    /// Client-generated visitor id
    pub cid: Option<String>,
    /// Include fingerprint inputs in the response
    pub debug: Option<String>,
}

/// Hit registration response
#[derive(Debug, Serialize)]
pub struct HitResponse {
    pub success: bool,
    pub added: bool,
    pub value: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<HitDebug>,
}

/// Fingerprint inputs echoed back with `?debug=1`
#[derive(Debug, Serialize)]
pub struct HitDebug {
    pub key: String,
    pub ip: String,
    pub ua: String,
    pub day: String,
    pub cid: Option<String>,
    pub hash: String,
    pub deduped: bool,
}

/// Counter value response
#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub key: String,
    pub value: u64,
}

/// Admin token in the query string
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Admin reset request body
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub key: Option<String>,
}

/// Admin reset response
#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub success: bool,
    pub reset: bool,
}

/// Today's dedup window for a key
#[derive(Debug, Serialize)]
pub struct VisitorsResponse {
    pub key: String,
    pub day: String,
    pub unique_visitors_today: u64,
    pub sample: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn counter_error(e: CounterError) -> ApiError {
    if e.is_invalid_input() {
        return api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_INPUT");
    }
    error!(error = %e, "Counter operation failed");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Counter backend unavailable",
        "BACKEND_UNAVAILABLE",
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/hit", get(hit_by_query))
        .route("/api/hit/:key", get(hit_by_path))
        .route("/api/count/:key", get(get_count))
        .route("/api/users/:key", get(get_user_count))
        .route("/api/admin/reset", post(admin_reset))
        .route("/api/admin/visitors/:key", get(admin_visitors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "backend": state.counter.backend_kind(),
        "anonymized": state.counter.anonymizes_users(),
        "admin_enabled": state.admin_token.is_some()
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.counter.backend_kind();
    match state.counter.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "backend": backend
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "backend": backend,
                "error": e.to_string()
            })),
        ),
    }
}

/// Register a hit for `/api/hit?key=`
async fn hit_by_query(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(params): Query<HitQuery>,
) -> Result<Json<HitResponse>, ApiError> {
    let key = params
        .key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing key", "MISSING_KEY"))?;
    record_hit(&state, &key, &params, &headers, peer).await
}

/// Register a hit for `/api/hit/:key`
async fn hit_by_path(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Query(params): Query<HitQuery>,
) -> Result<Json<HitResponse>, ApiError> {
    record_hit(&state, &key, &params, &headers, peer).await
}

#[instrument(skip(state, params, headers, peer))]
async fn record_hit(
    state: &AppState,
    key: &str,
    params: &HitQuery,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<HitResponse>, ApiError> {
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(client_ip)
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_default();
    let ua = header_str(headers, "user-agent").unwrap_or_default().trim();
    let cid = params
        .cid
        .as_deref()
        .or_else(|| header_str(headers, CLIENT_ID_HEADER))
        .map(str::trim)
        .filter(|c| !c.is_empty());
    let today = state.counter.today();

    let fingerprint = VisitFingerprint::new(key, today)
        .ip(&ip)
        .user_agent(ua)
        .client_id(cid)
        .digest();

    let outcome = state
        .counter
        .register_hit(key, fingerprint.as_str())
        .await
        .map_err(counter_error)?;

    let debug = params.debug.as_ref().map(|_| HitDebug {
        key: key.to_string(),
        ip: ip.clone(),
        ua: ua.to_string(),
        day: day_stamp(today),
        cid: cid.map(str::to_string),
        hash: fingerprint.to_string(),
        deduped: !outcome.added,
    });

    Ok(Json(HitResponse {
        success: true,
        added: outcome.added,
        value: outcome.total,
        debug,
    }))
}

/// Current hit total
async fn get_count(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let value = state.counter.get_total(&key).await.map_err(counter_error)?;
    Ok(Json(CountResponse { key, value }))
}

/// Current number of authenticated users
async fn get_user_count(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let value = state
        .counter
        .get_user_count(&key)
        .await
        .map_err(counter_error)?;
    Ok(Json(CountResponse { key, value }))
}

/// Reset all state for a key
async fn admin_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, ApiError> {
    authorize(&state, &headers, &token)?;

    let key = request
        .key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing key", "MISSING_KEY"))?;

    let outcome = state.counter.reset(&key).await.map_err(counter_error)?;
    info!(key = %key, "Admin reset via API");

    Ok(Json(ResetResponse {
        success: true,
        reset: outcome.reset,
    }))
}

/// Today's dedup window for a key
async fn admin_visitors(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
    Path(key): Path<String>,
) -> Result<Json<VisitorsResponse>, ApiError> {
    authorize(&state, &headers, &token)?;

    let DayVisitors {
        day,
        unique_visitors,
        sample,
    } = state.counter.day_visitors(&key).await.map_err(counter_error)?;

    Ok(Json(VisitorsResponse {
        key,
        day,
        unique_visitors_today: unique_visitors,
        sample,
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Originating client from an `x-forwarded-for` chain
fn client_ip(forwarded: &str) -> Option<String> {
    forwarded
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn authorize(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<(), ApiError> {
    let provided = header_str(headers, ADMIN_TOKEN_HEADER).or(query.token.as_deref());
    match (&state.admin_token, provided) {
        (Some(expected), Some(provided)) if token_matches(expected, provided) => Ok(()),
        _ => Err(api_error(StatusCode::FORBIDDEN, "forbidden", "FORBIDDEN")),
    }
}

/// Constant-time admin token comparison
fn token_matches(expected: &str, provided: &str) -> bool {
    let keyed = |token: &str| {
        Hmac::<Sha256>::new_from_slice(TOKEN_MAC_KEY).map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    match (keyed(expected), keyed(provided)) {
        (Ok(expected), Ok(provided)) => provided
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

/// Start the counter API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting counter API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymizer::IdentityAnonymizer;
    use crate::selector::ActiveBackend;
    use crate::store::LocalStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router(admin_token: Option<&str>) -> Router {
        let counter = VisitorCounter::new(
            ActiveBackend::local(Arc::new(LocalStore::in_memory())),
            IdentityAnonymizer::new(None),
        );
        let state = AppState {
            counter: Arc::new(counter),
            service_name: "visitor-counter".to_string(),
            admin_token: admin_token.map(str::to_string),
        };
        create_router(state, &ApiConfig::default())
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn hit(uri: &str, ua: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("user-agent", ua)
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    }

    fn reset(token: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/admin/reset")
            .header(ADMIN_TOKEN_HEADER, token)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_same_visitor_is_counted_once() {
        let router = test_router(None);

        let (status, first) = call(&router, hit("/api/hit/profile", "firefox")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["added"], true);
        assert_eq!(first["value"], 1);

        let (_, second) = call(&router, hit("/api/hit/profile", "firefox")).await;
        assert_eq!(second["added"], false);
        assert_eq!(second["value"], 1);

        let (_, other) = call(&router, hit("/api/hit/profile", "chrome")).await;
        assert_eq!(other["value"], 2);
    }

    fn hit_via(forwarded: &str, ua: &str, cid: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/hit/profile?debug=1")
            .header("user-agent", ua)
            .header("x-forwarded-for", forwarded)
            .header(CLIENT_ID_HEADER, cid)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_same_client_through_different_proxies_is_counted_once() {
        let router = test_router(None);

        let (_, first) = call(&router, hit_via("203.0.113.7, 10.0.0.1", "firefox", "tab")).await;
        let (_, second) = call(&router, hit_via("203.0.113.7, 10.0.0.2", " firefox ", "tab ")).await;
        let (_, third) = call(&router, hit_via(" 203.0.113.7", "firefox", " tab")).await;

        assert_eq!(first["added"], true);
        assert_eq!(first["debug"]["ip"], "203.0.113.7");
        assert_eq!(second["added"], false);
        assert_eq!(third["added"], false);
        assert_eq!(third["value"], 1);
        assert_eq!(first["debug"]["hash"], third["debug"]["hash"]);
    }

    #[test]
    fn test_client_ip_takes_first_forwarded_entry() {
        assert_eq!(client_ip(" 198.51.100.4 , 10.0.0.1").as_deref(), Some("198.51.100.4"));
        assert_eq!(client_ip("198.51.100.4").as_deref(), Some("198.51.100.4"));
        assert_eq!(client_ip(" , 10.0.0.1"), None);
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("admin", "admin"));
        assert!(!token_matches("admin", "admin "));
        assert!(!token_matches("admin", "adm"));
        assert!(!token_matches("admin", ""));
    }

    #[tokio::test]
    async fn test_query_key_route_and_client_id() {
        let router = test_router(None);

        call(&router, hit("/api/hit?key=profile", "firefox")).await;
        let (_, body) = call(&router, hit("/api/hit?key=profile&cid=tab-2", "firefox")).await;

        assert_eq!(body["added"], true);
        assert_eq!(body["value"], 2);
    }

    #[tokio::test]
    async fn test_query_route_requires_key() {
        let router = test_router(None);
        let (status, body) = call(&router, hit("/api/hit", "firefox")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_KEY");
    }

    #[tokio::test]
    async fn test_debug_echoes_fingerprint_inputs() {
        let router = test_router(None);
        let (_, body) = call(&router, hit("/api/hit/profile?debug=1", "firefox")).await;

        assert_eq!(body["debug"]["ip"], "203.0.113.7");
        assert_eq!(body["debug"]["ua"], "firefox");
        assert_eq!(body["debug"]["deduped"], false);
        assert_eq!(body["debug"]["hash"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_count_endpoints() {
        let router = test_router(None);
        call(&router, hit("/api/hit/profile", "firefox")).await;

        let request = Request::builder()
            .uri("/api/count/profile")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], 1);

        let request = Request::builder()
            .uri("/api/users/profile")
            .body(Body::empty())
            .unwrap();
        let (_, body) = call(&router, request).await;
        assert_eq!(body["value"], 0);
    }

    #[tokio::test]
    async fn test_reset_requires_token() {
        let router = test_router(Some("admin"));
        let (status, _) = call(&router, reset("wrong", r#"{"key":"profile"}"#)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let router = test_router(None);
        let (status, _) = call(&router, reset("", r#"{"key":"profile"}"#)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_reset_clears_counter() {
        let router = test_router(Some("admin"));
        call(&router, hit("/api/hit/profile", "firefox")).await;

        let (status, body) = call(&router, reset("admin", r#"{"key":"profile"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reset"], true);

        let (_, again) = call(&router, hit("/api/hit/profile", "firefox")).await;
        assert_eq!(again["added"], true);
        assert_eq!(again["value"], 1);
    }

    #[tokio::test]
    async fn test_reset_requires_key() {
        let router = test_router(Some("admin"));
        let (status, body) = call(&router, reset("admin", "{}")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_KEY");
    }

    #[tokio::test]
    async fn test_admin_visitors() {
        let router = test_router(Some("admin"));
        call(&router, hit("/api/hit/profile", "firefox")).await;
        call(&router, hit("/api/hit/profile", "chrome")).await;

        let request = Request::builder()
            .uri("/api/admin/visitors/profile?token=admin")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unique_visitors_today"], 2);
        assert_eq!(body["sample"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let router = test_router(None);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(&router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "local");
        assert_eq!(body["anonymized"], false);
    }

    #[tokio::test]
    async fn test_ready_pings_backend() {
        let router = test_router(None);
        let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        let (status, body) = call(&router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }
}
