//! JSON API over the dispatch service.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rsd_core::{
    GeoPoint, NewServiceRequest, Party, PaymentMethod, Provider, ProviderId, RequestId,
    ServiceType, ValidationError,
};
use rsd_dispatch::{
    AcceptOutcome, AutoFinishSweep, DispatchError, DispatchService, ErrorClass,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rsd-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DispatchService>,
}

impl AppState {
    pub fn new(service: Arc<DispatchService>) -> Self {
        Self { service }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/requests", post(submit_handler))
        .route("/requests/{id}", get(request_handler))
        .route("/requests/{id}/search", get(search_handler))
        .route("/requests/{id}/search/restart", post(restart_search_handler))
        .route("/requests/{id}/accept", post(accept_handler))
        .route("/requests/{id}/decline", post(decline_handler))
        .route("/requests/{id}/proposals", post(propose_handler))
        .route("/requests/{id}/proposals/accept", post(accept_value_handler))
        .route("/requests/{id}/confirm-value", post(confirm_value_handler))
        .route("/requests/{id}/reopen", post(reopen_handler))
        .route("/requests/{id}/payment", post(payment_handler))
        .route("/requests/{id}/finish", post(finish_handler))
        .route("/requests/{id}/confirm-completion", post(confirm_completion_handler))
        .route("/requests/{id}/reject-completion", post(reject_completion_handler))
        .route("/requests/{id}/cancel", post(cancel_handler))
        .route("/requests/{id}/settlement", post(settlement_handler))
        .route("/providers/{id}", put(provider_handler))
        .route("/ops/auto-finish", post(auto_finish_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dispatch api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.class() {
            ErrorClass::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Invariant | ErrorClass::Dependency => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        let body = Json(json!({
            "error": self.0.reason(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn ok<T: serde::Serialize>(value: T) -> ApiResult {
    Ok(Json(value).into_response())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn submit_handler(
    State(state): State<AppState>,
    Json(body): Json<NewServiceRequest>,
) -> ApiResult {
    let request = state.service.submit(body).await?;
    Ok((StatusCode::CREATED, Json(request)).into_response())
}

async fn request_handler(State(state): State<AppState>, Path(id): Path<RequestId>) -> ApiResult {
    ok(state.service.get_request(id).await?)
}

async fn search_handler(State(state): State<AppState>, Path(id): Path<RequestId>) -> ApiResult {
    match state.service.search_snapshot(id).await? {
        Some(snapshot) => ok(snapshot),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no_active_search", "message": "request has no search session"})),
        )
            .into_response()),
    }
}

async fn restart_search_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult {
    ok(state.service.restart_search(id).await?)
}

#[derive(Debug, Deserialize)]
struct ProviderBody {
    provider_id: ProviderId,
}

async fn accept_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<ProviderBody>,
) -> ApiResult {
    match state.service.accept(id, body.provider_id).await? {
        outcome @ AcceptOutcome::Assigned { .. } => ok(outcome),
        outcome @ AcceptOutcome::LostRace => {
            Ok((StatusCode::CONFLICT, Json(outcome)).into_response())
        }
    }
}

async fn decline_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<ProviderBody>,
) -> ApiResult {
    ok(state.service.decline(id, body.provider_id).await?)
}

#[derive(Debug, Deserialize)]
struct ProposalBody {
    by: Party,
    value: f64,
}

async fn propose_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<ProposalBody>,
) -> ApiResult {
    ok(state.service.propose(id, body.by, body.value).await?)
}

#[derive(Debug, Deserialize)]
struct PartyBody {
    by: Party,
}

async fn accept_value_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<PartyBody>,
) -> ApiResult {
    ok(state.service.accept_value(id, body.by).await?)
}

async fn confirm_value_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult {
    ok(state.service.confirm_value(id).await?)
}

async fn reopen_handler(State(state): State<AppState>, Path(id): Path<RequestId>) -> ApiResult {
    ok(state.service.reopen_negotiation(id).await?)
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    method: PaymentMethod,
}

async fn payment_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<PaymentBody>,
) -> ApiResult {
    ok(state.service.record_payment(id, body.method).await?)
}

async fn finish_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<ProviderBody>,
) -> ApiResult {
    ok(state.service.provider_finish(id, body.provider_id).await?)
}

async fn confirm_completion_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult {
    ok(state.service.confirm_completion(id).await?)
}

async fn reject_completion_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult {
    ok(state.service.reject_completion(id).await?)
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    by: Party,
    #[serde(default)]
    provider_id: Option<ProviderId>,
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<CancelBody>,
) -> ApiResult {
    let request = match (body.by, body.provider_id) {
        (Party::Client, _) => state.service.client_cancel(id, body.reason).await?,
        (Party::Provider, Some(provider_id)) => {
            state
                .service
                .provider_cancel(id, provider_id, body.reason)
                .await?
        }
        (Party::Provider, None) => {
            return Ok((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "error": "missing_provider_id",
                    "message": "provider cancellation requires provider_id",
                })),
            )
                .into_response());
        }
    };
    ok(request)
}

async fn settlement_handler(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult {
    ok(state.service.settle(id).await?)
}

#[derive(Debug, Deserialize)]
struct ProviderProfile {
    lat: f64,
    lng: f64,
    radar_range_km: f64,
    services_offered: Vec<String>,
    online: bool,
    #[serde(default)]
    last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    custom_fee_enabled: bool,
    #[serde(default)]
    custom_fee_percentage: Option<f64>,
    #[serde(default)]
    custom_fee_fixed: Option<f64>,
}

/// Creates or replaces a provider's profile. Assignment and balance are
/// owned by the dispatcher and survive the write.
async fn provider_handler(
    State(state): State<AppState>,
    Path(id): Path<ProviderId>,
    Json(body): Json<ProviderProfile>,
) -> ApiResult {
    let location = GeoPoint::new(body.lat, body.lng);
    location.validate("provider")?;
    let services_offered = body
        .services_offered
        .iter()
        .map(|s| ServiceType::parse(s))
        .collect::<Result<BTreeSet<_>, _>>()?;

    let existing = state
        .service
        .store()
        .get_provider(id)
        .await
        .map_err(DispatchError::from)?;
    let (current_request_id, pending_balance_cents) = existing
        .map(|p| (p.current_request_id, p.pending_balance_cents))
        .unwrap_or((None, 0));

    let provider = Provider {
        id,
        location,
        radar_range_km: body.radar_range_km.max(0.0),
        services_offered,
        online: body.online,
        last_heartbeat_at: body.last_heartbeat_at.or_else(|| Some(Utc::now())),
        current_request_id,
        blocked: body.blocked,
        custom_fee_enabled: body.custom_fee_enabled,
        custom_fee_percentage: body.custom_fee_percentage,
        custom_fee_fixed: body.custom_fee_fixed,
        pending_balance_cents,
    };
    ok(state.service.upsert_provider(provider).await?)
}

async fn auto_finish_handler(State(state): State<AppState>) -> ApiResult {
    let report = AutoFinishSweep::new(state.service.clone())
        .run_once()
        .await
        .map_err(DispatchError::from)?;
    ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use rsd_dispatch::SearchConfig;
    use rsd_feed::{InMemoryChangeFeed, LogNotifier};
    use rsd_storage::MemoryStore;
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_app() -> Router {
        let service = DispatchService::in_memory(
            Arc::new(MemoryStore::new()),
            InMemoryChangeFeed::new(),
            Arc::new(LogNotifier),
            SearchConfig::default(),
            15.0,
        );
        app(AppState::new(Arc::new(service)))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn submission(service_type: &str) -> Value {
        json!({
            "client_id": Uuid::new_v4(),
            "service_type": service_type,
            "origin": {"lat": -23.55, "lng": -46.63, "address": "Praça da Sé"},
        })
    }

    fn provider_profile() -> Value {
        json!({
            "lat": -23.551,
            "lng": -46.631,
            "radar_range_km": 30.0,
            "services_offered": ["battery_jump"],
            "online": true,
        })
    }

    #[tokio::test]
    async fn submit_then_fetch_request() {
        let app = test_app();
        let (status, created) = call(&app, "POST", "/requests", Some(submission("lockout"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "searching");

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = call(&app, "GET", &format!("/requests/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["service_type"], "lockout");

        let (status, search) = call(&app, "GET", &format!("/requests/{id}/search"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(search["radius_km"], 3.0);
    }

    #[tokio::test]
    async fn validation_errors_are_unprocessable() {
        let app = test_app();
        let (status, body) = call(&app, "POST", "/requests", Some(submission("tow"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "missing_destination");

        let (status, body) = call(&app, "POST", "/requests", Some(submission("teleport"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unknown_service_type");
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let app = test_app();
        let (status, body) = call(&app, "GET", &format!("/requests/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "request_not_found");
    }

    #[tokio::test]
    async fn second_acceptance_loses_the_race() {
        let app = test_app();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        for id in [first, second] {
            let (status, _) =
                call(&app, "PUT", &format!("/providers/{id}"), Some(provider_profile())).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (_, created) = call(&app, "POST", "/requests", Some(submission("battery_jump"))).await;
        let id = created["id"].as_str().unwrap();

        let (status, won) = call(
            &app,
            "POST",
            &format!("/requests/{id}/accept"),
            Some(json!({"provider_id": first})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(won["outcome"], "assigned");
        assert_eq!(won["request"]["status"], "negotiating");

        let (status, lost) = call(
            &app,
            "POST",
            &format!("/requests/{id}/accept"),
            Some(json!({"provider_id": second})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(lost["outcome"], "lost_race");
    }

    #[tokio::test]
    async fn negotiation_through_settlement_over_http() {
        let app = test_app();
        let provider = Uuid::new_v4();
        call(&app, "PUT", &format!("/providers/{provider}"), Some(provider_profile())).await;
        let (_, created) = call(&app, "POST", "/requests", Some(submission("battery_jump"))).await;
        let id = created["id"].as_str().unwrap().to_string();
        let r = |path: &str| format!("/requests/{id}/{path}");

        call(&app, "POST", &r("accept"), Some(json!({"provider_id": provider}))).await;
        let (status, _) =
            call(&app, "POST", &r("proposals"), Some(json!({"by": "provider", "value": 150.0}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "POST", &r("proposals/accept"), Some(json!({"by": "provider"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "own_proposal");

        call(&app, "POST", &r("proposals/accept"), Some(json!({"by": "client"}))).await;
        let (_, confirmed) = call(&app, "POST", &r("confirm-value"), None).await;
        assert_eq!(confirmed["status"], "awaiting_payment");
        call(&app, "POST", &r("payment"), Some(json!({"method": "direct"}))).await;
        let (_, finishing) =
            call(&app, "POST", &r("finish"), Some(json!({"provider_id": provider}))).await;
        assert_eq!(finishing["status"], "pending_client_confirmation");

        let (status, done) = call(&app, "POST", &r("confirm-completion"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["request"]["status"], "finished");
        assert_eq!(done["settlement"]["outcome"], "settled");
        assert_eq!(done["settlement"]["record"]["application_fee_cents"], 2250);
        assert_eq!(done["settlement"]["record"]["provider_net_cents"], 12750);

        let (status, again) = call(&app, "POST", &r("settlement"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["outcome"], "already_settled");
    }

    #[tokio::test]
    async fn provider_cancel_requires_provider_id() {
        let app = test_app();
        let (_, created) = call(&app, "POST", "/requests", Some(submission("mechanic"))).await;
        let id = created["id"].as_str().unwrap();
        let (status, body) = call(
            &app,
            "POST",
            &format!("/requests/{id}/cancel"),
            Some(json!({"by": "provider"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "missing_provider_id");

        let (status, canceled) = call(
            &app,
            "POST",
            &format!("/requests/{id}/cancel"),
            Some(json!({"by": "client", "reason": "changed plans"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["status"], "canceled");
    }

    #[tokio::test]
    async fn provider_profile_rejects_unknown_services() {
        let app = test_app();
        let mut profile = provider_profile();
        profile["services_offered"] = json!(["hovercraft"]);
        let (status, body) =
            call(&app, "PUT", &format!("/providers/{}", Uuid::new_v4()), Some(profile)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unknown_service_type");
    }

    #[tokio::test]
    async fn auto_finish_endpoint_reports_counts() {
        let app = test_app();
        let (status, report) = call(&app, "POST", "/ops/auto-finish", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["scanned"], 0);
        assert_eq!(report["finished"], 0);
    }
}
