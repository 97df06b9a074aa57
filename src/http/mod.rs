//! `GET /`, `GET /derp.json`, and the optional `/admin/config` surface,
//! built on an `axum::Router`/`Extension`/`ServiceBuilder` stack with
//! load-shedding, a concurrency limit, and a request timeout.

pub mod error;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::{Extension, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{BoxError, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;

use crate::registry::{EndpointStatus, FilterParams, Registry};
use crate::relay_map::RelayMap;
use crate::scheduler::SharedConfig;
use crate::unit::Unit;

use self::error::ApiError;

const INDEX_HTML: &str = include_str!("../../static/index.html");

/// Shared state handed to every handler via an [`Extension`] layer.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: SharedConfig,
}

/// Builds the full router: the always-mounted public routes, plus
/// `/admin/config` when `admin_token` was non-empty at startup. Per
/// spec, admin reconfiguration affects future loop iterations only; it
/// has no bearing on whether this route itself is mounted, which is
/// decided once, here, at startup.
pub fn build_router(state: AppState) -> Router {
    let admin_enabled = !state
        .config
        .read()
        .expect("config lock poisoned")
        .admin_token
        .is_empty();

    let mut router = Router::new()
        .route("/", get(index))
        .route("/derp.json", get(get_derp_map));

    if admin_enabled {
        router = router.route("/admin/config", get(get_admin_config).post(post_admin_config));
    }

    router
        .layer(Extension(state))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(middleware_error_handler))
                .load_shed()
                .concurrency_limit(1024)
                .timeout(Duration::from_secs(10))
                .into_inner(),
        )
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Deserialize)]
struct DerpQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "latency-limit", default)]
    latency_limit: Option<String>,
    #[serde(rename = "bandwidth-limit", default)]
    bandwidth_limit: Option<String>,
}

async fn get_derp_map(
    Extension(state): Extension<AppState>,
    Query(query): Query<DerpQuery>,
) -> Result<Json<RelayMap>, ApiError> {
    let baseline_bandwidth = state.config.read().expect("config lock poisoned").baseline_bandwidth;

    // `status=all` bypasses all filtering, not just the status predicate —
    // short-circuit before the limits are even parsed, so a request like
    // `?status=all&bandwidth-limit=1.00Mbps` still returns every endpoint.
    if query.status.as_deref() == Some("all") {
        return Ok(Json(state.registry.filter(&FilterParams::all(baseline_bandwidth))));
    }

    let status = match query.status.as_deref() {
        None => Some(EndpointStatus::Available),
        Some("available") => Some(EndpointStatus::Available),
        Some("error") => Some(EndpointStatus::Error),
        Some("unknown") => Some(EndpointStatus::Unknown),
        Some(other) => return Err(crate::error::ApiError::UnknownStatus(other.to_string()).into()),
    };

    let latency_limit = query
        .latency_limit
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .map_err(crate::error::ApiError::InvalidLatencyLimit)?;

    let bandwidth_limit = query
        .bandwidth_limit
        .as_deref()
        .map(|s| Unit::parse(s, "bps"))
        .transpose()
        .map_err(crate::error::ApiError::InvalidBandwidthLimit)?
        .map(|unit| unit.value);

    let params = FilterParams {
        status,
        latency_limit,
        bandwidth_limit,
        baseline_bandwidth,
    };
    Ok(Json(state.registry.filter(&params)))
}

/// Non-secret projection of [`crate::config::Config`] returned by
/// `GET /admin/config`. `admin_token`/`fofa_email`/`fofa_key` are
/// deliberately excluded from the response body.
#[derive(Debug, Serialize)]
struct AdminConfigView {
    #[serde(with = "humantime_serde")]
    refetch_interval: Duration,
    fetch_limit: usize,
    #[serde(with = "humantime_serde")]
    recheck_interval: Duration,
    #[serde(with = "humantime_serde")]
    check_duration: Duration,
    check_concurrency: usize,
    baseline_bandwidth: f64,
    cn: bool,
}

/// A partial update accepted by `POST /admin/config`; absent fields leave
/// the corresponding setting untouched.
#[derive(Debug, Deserialize)]
struct AdminConfigUpdate {
    refetch_interval: Option<String>,
    fetch_limit: Option<usize>,
    recheck_interval: Option<String>,
    check_duration: Option<String>,
    check_concurrency: Option<usize>,
    baseline_bandwidth: Option<f64>,
    cn: Option<bool>,
}

async fn get_admin_config(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Json<AdminConfigView>, ApiError> {
    check_admin_auth(&state, &headers)?;
    let config = state.config.read().expect("config lock poisoned");
    Ok(Json(AdminConfigView {
        refetch_interval: config.refetch_interval,
        fetch_limit: config.fetch_limit,
        recheck_interval: config.recheck_interval,
        check_duration: config.check_duration,
        check_concurrency: config.check_concurrency,
        baseline_bandwidth: config.baseline_bandwidth,
        cn: config.cn,
    }))
}

async fn post_admin_config(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(update): Json<AdminConfigUpdate>,
) -> Result<Json<AdminConfigView>, ApiError> {
    check_admin_auth(&state, &headers)?;

    let refetch_interval = update
        .refetch_interval
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .map_err(crate::error::ApiError::InvalidLatencyLimit)?;
    let recheck_interval = update
        .recheck_interval
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .map_err(crate::error::ApiError::InvalidLatencyLimit)?;
    let check_duration = update
        .check_duration
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .map_err(crate::error::ApiError::InvalidLatencyLimit)?;

    let mut config = state.config.write().expect("config lock poisoned");
    if let Some(value) = refetch_interval {
        config.refetch_interval = value;
    }
    if let Some(value) = update.fetch_limit {
        config.fetch_limit = value;
    }
    if let Some(value) = recheck_interval {
        config.recheck_interval = value;
    }
    if let Some(value) = check_duration {
        config.check_duration = value;
    }
    if let Some(value) = update.check_concurrency {
        config.check_concurrency = value;
    }
    if let Some(value) = update.baseline_bandwidth {
        config.baseline_bandwidth = value;
    }
    if let Some(value) = update.cn {
        config.cn = value;
    }

    Ok(Json(AdminConfigView {
        refetch_interval: config.refetch_interval,
        fetch_limit: config.fetch_limit,
        recheck_interval: config.recheck_interval,
        check_duration: config.check_duration,
        check_concurrency: config.check_concurrency,
        baseline_bandwidth: config.baseline_bandwidth,
        cn: config.cn,
    }))
}

/// HTTP Basic auth guard for `/admin/*`: any username, password must equal
/// the configured `admin_token`. No route is mounted at all when
/// `admin_token` is empty (see [`build_router`]), so this is only ever
/// called with a non-empty expected token.
fn check_admin_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state.config.read().expect("config lock poisoned").admin_token.clone();

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|decoded| decoded.split_once(':').map(|(_, password)| password.to_string()));

    match provided {
        Some(password) if password == expected => Ok(()),
        _ => Err(ApiError::unauthorized("admin credentials required")),
    }
}

async fn middleware_error_handler(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }
    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("unhandled internal error: {error}")),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::registry::{EndpointCandidate, ProbeOutcome};

    fn test_state() -> AppState {
        AppState {
            registry: Arc::new(Registry::new()),
            config: Arc::new(RwLock::new(Config::default())),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn derp_json_defaults_to_available_only() {
        let state = test_state();
        state.registry.upsert(EndpointCandidate {
            name: "unprobed".into(),
            host: "h1".into(),
            port: 443,
            ipv4: Some(std::net::Ipv4Addr::new(1, 1, 1, 1)),
            ipv6: None,
            insecure: false,
        });
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().uri("/derp.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["Regions"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn derp_json_status_all_bypasses_filtering() {
        let state = test_state();
        state.registry.upsert(EndpointCandidate {
            name: "unprobed".into(),
            host: "h1".into(),
            port: 443,
            ipv4: Some(std::net::Ipv4Addr::new(1, 1, 1, 1)),
            ipv6: None,
            insecure: false,
        });
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/derp.json?status=all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["Regions"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn derp_json_status_all_ignores_latency_and_bandwidth_limits() {
        let state = test_state();
        let (endpoint, _) = state.registry.upsert(EndpointCandidate {
            name: "slow".into(),
            host: "h1".into(),
            port: 443,
            ipv4: Some(std::net::Ipv4Addr::new(1, 1, 1, 1)),
            ipv6: None,
            insecure: false,
        });
        state.registry.record(
            endpoint.id,
            Ok(ProbeOutcome {
                latency: std::time::Duration::from_secs(999),
                bandwidth: Unit::bps(1024.0),
            }),
        );
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/derp.json?status=all&bandwidth-limit=1.00Mbps&latency-limit=1ms")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["Regions"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_status_is_400() {
        let state = test_state();
        let router = build_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/derp.json?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_latency_limit_is_400() {
        let state = test_state();
        let router = build_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/derp.json?latency-limit=not-a-duration")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bandwidth_limit_filters_out_slower_endpoints() {
        let state = test_state();
        let (endpoint, _) = state.registry.upsert(EndpointCandidate {
            name: "slow".into(),
            host: "h1".into(),
            port: 443,
            ipv4: Some(std::net::Ipv4Addr::new(1, 1, 1, 1)),
            ipv6: None,
            insecure: false,
        });
        state.registry.record(
            endpoint.id,
            Ok(ProbeOutcome {
                latency: std::time::Duration::from_millis(10),
                bandwidth: Unit::bps(1024.0),
            }),
        );
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/derp.json?bandwidth-limit=1.00Mbps")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(json["Regions"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_routes_are_not_mounted_without_a_token() {
        let state = test_state();
        let router = build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_routes_reject_missing_credentials() {
        let state = test_state();
        state.config.write().unwrap().admin_token = "secret".to_string();
        let router = build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_accept_correct_basic_auth() {
        let state = test_state();
        state.config.write().unwrap().admin_token = "secret".to_string();
        let router = build_router(state);
        let credentials = BASE64.encode(b"admin:secret");
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/admin/config")
                    .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_admin_config_updates_future_reads() {
        let state = test_state();
        state.config.write().unwrap().admin_token = "secret".to_string();
        let config_handle = state.config.clone();
        let router = build_router(state);
        let credentials = BASE64.encode(b"admin:secret");

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/config")
                    .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"fetch_limit": 7}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(config_handle.read().unwrap().fetch_limit, 7);
    }
}
