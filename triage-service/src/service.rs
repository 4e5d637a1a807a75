use std::sync::Arc;

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, info};
use triage_gateway::{ErrorKind, EvaluationGateway, EvaluationRequest, Referral};
use uuid::Uuid;

use crate::models::{EvaluateErrorResponse, EvaluateResponse, HealthResponse};

type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": message })))
}

/// Non-standard "client closed request".
fn client_closed() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ConfigurationError | ErrorKind::TransientUpstreamError => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamRejected | ErrorKind::MalformedResponse | ErrorKind::SchemaViolation => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::Cancelled => client_closed(),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<EvaluationGateway>,
    /// Fired on shutdown; in-flight evaluations stop at their next await.
    pub shutdown: CancellationToken,
}

pub fn create_app(gateway: EvaluationGateway, shutdown: CancellationToken) -> Router {
    build_router(AppState {
        gateway: Arc::new(gateway),
        shutdown,
    })
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/v1/evaluate", post(evaluate))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tags every request with a fresh correlation id and runs it in a span.
async fn correlation_id_middleware(mut request: Request<axum::body::Body>, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Referral Triage Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Throttled evaluation of clinical referrals through an upstream completion service",
        "tasks": ["completeness", "auth", "bundle"],
        "endpoints": {
            "POST /v1/evaluate": "Evaluate a referral for one task",
            "GET /health": "Health check",
            "GET /": "This descriptor"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        gateway_enabled: state.gateway.is_enabled(),
        admission_available: state.gateway.admission_available(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn evaluate(
    State(state): State<AppState>,
    payload: Result<Json<EvaluationRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request_error(&rejection.body_text()).into_response(),
    };
    if let Err(error) = validate_referral(&request.referral) {
        return error.into_response();
    }

    info!(
        task = %request.task,
        referral_id = %request.referral.id,
        debug = request.debug,
        "Evaluation requested"
    );

    // A client disconnect drops this future, which abandons the evaluation too.
    match state
        .gateway
        .evaluate_cancellable(request, &state.shutdown)
        .await
    {
        Ok(evaluation) => Json(EvaluateResponse::from(evaluation)).into_response(),
        Err(failure) => {
            let status = status_for(failure.kind());
            (status, Json(EvaluateErrorResponse::from(failure))).into_response()
        }
    }
}

fn validate_referral(referral: &Referral) -> Result<(), ApiError> {
    if referral.id.trim().is_empty() {
        return Err(bad_request_error("referral.id is required"));
    }
    if referral
        .distance_miles
        .is_some_and(|miles| !miles.is_finite() || miles < 0.0)
    {
        return Err(bad_request_error(
            "referral.distanceMiles must be a non-negative number",
        ));
    }
    if let Some(document) = referral
        .documents
        .iter()
        .find(|d| !(0.0..=1.0).contains(&d.ocr_confidence))
    {
        return Err(bad_request_error(&format!(
            "document {} has ocrConfidence outside [0, 1]",
            document.id
        )));
    }
    Ok(())
}
