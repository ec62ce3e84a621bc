//! Cache-resident order state and its durable snapshot form.

use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order id issued by the payment gateway (PayPal's `token`).
///
/// Kept as an opaque string: gateway ids are not UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayOrderId(String);

impl GatewayOrderId {
    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= 64
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ServiceError::ValidationError(format!(
                "Invalid payment token: {:?}",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub course_id: Uuid,
    pub price: Decimal,
    pub discount: Decimal,
    pub final_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<Decimal>,
}

/// One checkout attempt. Created PENDING at initiation and moved to
/// COMPLETED exactly once, at capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub total_amount: Decimal,
    pub currency_code: String,
    #[serde(default)]
    pub exchange_rate: Option<Decimal>,
    #[serde(default)]
    pub total_amount_usd: Option<Decimal>,
    pub payment_id: GatewayOrderId,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub voucher_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn course_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|item| item.course_id).collect()
    }

    /// Courses that actually received a discount.
    pub fn discounted_course_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter(|item| item.discount > Decimal::ZERO)
            .map(|item| item.course_id)
            .collect()
    }
}

/// Links a gateway token to its order so capture needs only the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub currency_code: String,
    pub total_amount: Decimal,
    #[serde(default)]
    pub total_amount_usd: Option<Decimal>,
    #[serde(default)]
    pub exchange_rate: Option<Decimal>,
}

impl PaymentDetails {
    pub fn for_order(order: &OrderRecord) -> Self {
        Self {
            order_id: order.order_id,
            status: order.status,
            created_at: order.created_at,
            currency_code: order.currency_code.clone(),
            total_amount: order.total_amount,
            total_amount_usd: order.total_amount_usd,
            exchange_rate: order.exchange_rate,
        }
    }
}

/// JSON stored in `temporary_payments.payment_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSnapshot {
    pub order: OrderRecord,
    pub details: PaymentDetails,
}

pub fn order_key(order_id: Uuid) -> String {
    format!("order:{}", order_id)
}

pub fn payment_details_key(token: &GatewayOrderId) -> String {
    format!("payment:{}", token)
}
