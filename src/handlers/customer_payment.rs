use crate::handlers::auth::AuthenticatedUser;
use crate::{
    errors::ApiError,
    services::payments::{CaptureResult, InitiatePaymentRequest, WebhookHeaders},
    AppState,
};
use axum::{
    extract::{Json, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::Value;

/// Creates the router for customer checkout endpoints
pub fn customer_payment_routes() -> Router<AppState> {
    Router::new()
        .route("/init", post(initiate_payment))
        .route("/capture", get(capture_from_redirect).post(capture_payment))
        .route("/confirm", post(confirm_payment))
        .route("/webhook", post(payment_webhook))
}

async fn initiate_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<InitiatePaymentRequest>,
) -> impl IntoResponse {
    let result = state
        .services
        .payments
        .initiate_payment(user.user_id, payload)
        .await;
    (result.status, Json(result))
}

/// PayPal redirects the buyer here with `?token=...&PayerID=...`.
async fn capture_from_redirect(
    State(state): State<AppState>,
    Query(query): Query<CaptureQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .payments
        .capture_payment(&query.token, None)
        .await?;
    Ok(capture_response(result))
}

async fn capture_payment(
    State(state): State<AppState>,
    user: Option<AuthenticatedUser>,
    Json(payload): Json<TokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .payments
        .capture_payment(&payload.token, user.map(|u| u.user_id))
        .await?;
    Ok(capture_response(result))
}

async fn confirm_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<TokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .payments
        .confirm(user.user_id, &payload.token)
        .await?;
    Ok(capture_response(result))
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let ack = state
        .services
        .payments
        .handle_webhook(&webhook_headers(&headers), &body)
        .await?;
    Ok(Json(ack))
}

fn capture_response(result: CaptureResult) -> impl IntoResponse {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::PAYMENT_REQUIRED
    };
    (status, Json(result))
}

fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    WebhookHeaders {
        auth_algo: get("paypal-auth-algo"),
        cert_url: get("paypal-cert-url"),
        transmission_id: get("paypal-transmission-id"),
        transmission_sig: get("paypal-transmission-sig"),
        transmission_time: get("paypal-transmission-time"),
    }
}

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct CaptureQuery {
    pub token: String,
    #[serde(rename = "PayerID")]
    pub payer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}
