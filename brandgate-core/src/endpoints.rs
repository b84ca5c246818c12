//! HTTP surface over the governance pipeline.
//!
//! Every response body follows the `{"success": bool, ...}` envelope, and
//! every rate-limited endpoint carries `X-RateLimit-Limit`,
//! `X-RateLimit-Remaining`, and `X-RateLimit-Reset` headers, on rejections
//! as well as admissions. Rejections are rendered by [`Error`]'s
//! `IntoResponse` impl (429 plus `Retry-After` for rate limits, 402 for
//! exhausted budgets).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cost::CostMonitor;
use crate::error::Error;
use crate::governance::{GenerationRequest, Governance, ProviderResponse};
use crate::rate_limiting::{RateLimitCategory, RateLimitDecision, RequestIdentity};

pub const RATELIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATELIMIT_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATELIMIT_RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const USER_ID_HEADER: &str = "x-user-id";

/// The upstream AI call the pipeline wraps. `generate` receives the model to
/// use (post any budget downgrade); `degraded_fallback` must return a valid
/// payload without calling the provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<ProviderResponse, Error>;

    async fn degraded_fallback(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderResponse, Error>;
}

#[derive(Clone)]
pub struct AppState {
    pub governance: Arc<Governance>,
    pub monitor: Arc<CostMonitor>,
    pub backend: Arc<dyn GenerationBackend>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/generate", post(generate_handler))
        .route("/v1/cost/preflight", post(preflight_handler))
        .route("/v1/cost/dashboard", get(dashboard_handler))
        .route("/v1/cost/alerts", get(alerts_handler))
        .route(
            "/v1/cost/alerts/{alert_id}/acknowledge",
            post(acknowledge_handler),
        )
        .with_state(state)
}

/// Authenticated user id wins; otherwise the peer address plus user-agent.
pub fn request_identity(headers: &HeaderMap, peer_ip: IpAddr) -> RequestIdentity {
    if let Some(user_id) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        if !user_id.is_empty() {
            return RequestIdentity::user(user_id);
        }
    }
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    RequestIdentity::anonymous(peer_ip, user_agent)
}

pub fn apply_rate_limit_headers(decision: &RateLimitDecision, headers: &mut HeaderMap) {
    let entries = [
        (RATELIMIT_LIMIT_HEADER, decision.limit.to_string()),
        (RATELIMIT_REMAINING_HEADER, decision.remaining.to_string()),
        (RATELIMIT_RESET_HEADER, decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn envelope(data: impl serde::Serialize) -> Result<Value, Error> {
    Ok(json!({
        "success": true,
        "data": serde_json::to_value(data)?,
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn generate_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> Result<Response, Error> {
    let identity = request_identity(&headers, peer.ip());
    let primary_backend = state.backend.clone();
    let fallback_backend = state.backend.clone();
    let primary_request = request.clone();
    let fallback_request = request.clone();

    let result = state
        .governance
        .execute(
            &identity,
            &request,
            move |model| async move { primary_backend.generate(&primary_request, &model).await },
            move || async move { fallback_backend.degraded_fallback(&fallback_request).await },
        )
        .await?;

    let rate_limit = result.rate_limit;
    let mut response = Json(envelope(result)?).into_response();
    apply_rate_limit_headers(&rate_limit, response.headers_mut());
    Ok(response)
}

/// Pre-flight request body. `model`, `estimated_tokens`, and
/// `operation_data` are accepted for contract compatibility; only realized
/// spend feeds the decision.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightBody {
    pub service: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub estimated_tokens: Option<u64>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub operation_data: Option<Value>,
}

async fn preflight_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PreflightBody>,
) -> Result<Response, Error> {
    let identity = request_identity(&headers, peer.ip());
    let decision = state
        .governance
        .admit(RateLimitCategory::Api, &identity)
        .await?;

    let preflight = state
        .governance
        .governor()
        .preflight(&body.service, &identity.stable_id(), Utc::now())
        .await;

    let mut response = Json(envelope(preflight)?).into_response();
    apply_rate_limit_headers(&decision, response.headers_mut());
    Ok(response)
}

async fn dashboard_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let identity = request_identity(&headers, peer.ip());
    let decision = state
        .governance
        .admit(RateLimitCategory::Api, &identity)
        .await?;

    let dashboard = state
        .monitor
        .dashboard(&identity.stable_id(), Utc::now())
        .await?;

    let mut response = Json(envelope(dashboard)?).into_response();
    apply_rate_limit_headers(&decision, response.headers_mut());
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default = "default_alerts_limit")]
    pub limit: usize,
}

fn default_alerts_limit() -> usize {
    20
}

async fn alerts_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AlertsQuery>,
) -> Result<Response, Error> {
    let identity = request_identity(&headers, peer.ip());
    let decision = state
        .governance
        .admit(RateLimitCategory::Api, &identity)
        .await?;

    let alerts = state.monitor.user_alerts(&identity.stable_id(), query.limit);
    let mut response = Json(envelope(alerts)?).into_response();
    apply_rate_limit_headers(&decision, response.headers_mut());
    Ok(response)
}

async fn acknowledge_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(alert_id): Path<Uuid>,
) -> Result<Response, Error> {
    let identity = request_identity(&headers, peer.ip());
    let decision = state
        .governance
        .admit(RateLimitCategory::Api, &identity)
        .await?;

    // Scoped to the caller: an alert id belonging to someone else reads as
    // unknown rather than getting un-suppressed.
    let acknowledged = state
        .monitor
        .acknowledge_for(&identity.stable_id(), alert_id);
    let mut response = Json(json!({"success": acknowledged})).into_response();
    apply_rate_limit_headers(&decision, response.headers_mut());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    #[test]
    fn test_identity_prefers_user_header() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("42"));
        headers.insert(http::header::USER_AGENT, HeaderValue::from_static("curl/8"));

        let identity = request_identity(&headers, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(identity, RequestIdentity::user("42"));
    }

    #[test]
    fn test_identity_falls_back_to_peer_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::USER_AGENT, HeaderValue::from_static("curl/8"));

        let identity = request_identity(&headers, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(identity.stable_id(), "ip:203.0.113.9:curl/8");
    }

    #[test]
    fn test_empty_user_header_is_treated_as_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(""));

        let identity = request_identity(&headers, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(identity.stable_id(), "ip:127.0.0.1:unknown");
    }

    #[test]
    fn test_rate_limit_headers_are_rendered() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 20,
            remaining: 7,
            reset_at: Utc.with_ymd_and_hms(2026, 8, 20, 13, 0, 0).single().unwrap(),
            retry_after_s: None,
        };
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&decision, &mut headers);

        assert_eq!(headers[RATELIMIT_LIMIT_HEADER], "20");
        assert_eq!(headers[RATELIMIT_REMAINING_HEADER], "7");
        assert_eq!(
            headers[RATELIMIT_RESET_HEADER],
            decision.reset_at.timestamp().to_string().as_str()
        );
    }
}
