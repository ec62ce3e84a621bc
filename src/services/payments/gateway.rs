use super::records::GatewayOrderId;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment gateway credentials are not configured")]
    MissingCredentials,
    #[error("Invalid payment request: {0}")]
    InvalidRequest(String),
    #[error("Payment gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Payment gateway unreachable: {0}")]
    Transport(String),
    #[error("Unexpected payment gateway response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::MalformedResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayItem {
    pub course_id: Uuid,
    pub name: String,
    /// Price after discount, in the local currency
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrderRequest {
    pub items: Vec<GatewayItem>,
    pub total: Decimal,
    pub return_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedOrder {
    pub gateway_order_id: GatewayOrderId,
    pub approval_url: String,
    pub status: String,
    pub total_amount_usd: Decimal,
    pub exchange_rate: Decimal,
    /// Settlement-currency price per course, in request order
    pub item_prices_usd: Vec<(Uuid, Decimal)>,
}

/// Tagged capture result; capture never returns an error.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCapture {
    Captured {
        gateway_order_id: GatewayOrderId,
        details: serde_json::Value,
    },
    Failed {
        error: String,
    },
}

/// Headers PayPal sends with each webhook delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookHeaders {
    pub auth_algo: Option<String>,
    pub cert_url: Option<String>,
    pub transmission_id: Option<String>,
    pub transmission_sig: Option<String>,
    pub transmission_time: Option<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: CreateOrderRequest) -> Result<CreatedOrder, GatewayError>;

    async fn capture_order(&self, gateway_order_id: &GatewayOrderId) -> GatewayCapture;

    /// `Ok(true)` when the delivery is authentic or verification is disabled.
    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        body: &serde_json::Value,
    ) -> Result<bool, GatewayError>;
}
