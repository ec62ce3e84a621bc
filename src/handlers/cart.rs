use crate::handlers::{
    auth::AuthenticatedUser,
    common::{success_response, validate_input},
};
use crate::{errors::ApiError, services::commerce::CartItemStatusUpdate, AppState};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/selected", get(get_selected_cart_items))
        .route("/add", post(add_to_cart))
        .route("/remove", post(remove_from_cart))
        .route("/select", post(select_cart_items))
        .route("/update-status", post(update_cart_item_status))
        .route("/apply-voucher", post(apply_voucher))
}

async fn get_cart(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.get_cart(user.user_id).await?;
    Ok(success_response(cart))
}

async fn get_selected_cart_items(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .get_selected_cart_items(user.user_id)
        .await?;
    Ok(success_response(cart))
}

async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CourseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .add_to_cart(user.user_id, payload.course_id)
        .await?;
    Ok(success_response(cart))
}

async fn remove_from_cart(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CourseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .remove_from_cart(user.user_id, payload.course_id)
        .await?;
    Ok(success_response(cart))
}

async fn select_cart_items(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<SelectItemsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let selected = state
        .services
        .cart
        .select_cart_items(user.user_id, &payload.course_ids)
        .await?;
    Ok(success_response(json!({ "selectedCourseIds": selected })))
}

async fn update_cart_item_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let selected = state
        .services
        .cart
        .update_cart_item_status(user.user_id, &payload.items)
        .await?;
    Ok(success_response(json!({ "selectedCourseIds": selected })))
}

async fn apply_voucher(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ApplyVoucherRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let applied = state
        .services
        .cart
        .apply_voucher_to_cart(user.user_id, payload.code.trim())
        .await?;
    Ok(success_response(applied))
}

// Request DTOs

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRequest {
    pub course_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectItemsRequest {
    pub course_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    #[validate(length(min = 1))]
    pub items: Vec<CartItemStatusUpdate>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyVoucherRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}
