//! PayPal Orders v2 adapter.
//!
//! Uses the client-credentials OAuth flow; the access token is cached until
//! shortly before it expires.

use super::exchange_rate::CurrencyConverter;
use super::gateway::{
    CreateOrderRequest, CreatedOrder, GatewayCapture, GatewayError, PaymentGateway, WebhookHeaders,
};
use super::records::GatewayOrderId;
use crate::config::PaymentConfig;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Refresh the token this long before PayPal says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub webhook_id: Option<String>,
    pub payee_email: Option<String>,
    pub currency: String,
    pub timeout: Duration,
}

impl PayPalConfig {
    pub fn from_payment_config(config: &PaymentConfig) -> Self {
        Self {
            base_url: config.paypal_base_url.trim_end_matches('/').to_string(),
            client_id: config.paypal_client_id.clone(),
            client_secret: config.paypal_client_secret.clone(),
            webhook_id: config.paypal_webhook_id.clone(),
            payee_email: config.payee_email.clone(),
            currency: config.settlement_currency.clone(),
            timeout: config.http_timeout(),
        }
    }

    fn credentials(&self) -> Result<(&str, &str), GatewayError> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
            _ => Err(GatewayError::MissingCredentials),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OrderLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    links: Vec<OrderLink>,
}

pub struct PayPalGateway {
    config: PayPalConfig,
    client: reqwest::Client,
    converter: CurrencyConverter,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig, converter: CurrencyConverter) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            client,
            converter,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let (client_id, client_secret) = self.config.credentials()?;

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(client_id, Some(client_secret))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body("grant_type=client_credentials")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "PayPal token request failed");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: describe_error(status.as_u16(), &body),
            });
        }

        let token: TokenResponse = response.json().await?;
        debug!(expires_in = token.expires_in, "Obtained PayPal access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }

    fn money(&self, value: Decimal) -> Value {
        json!({
            "currency_code": self.config.currency,
            "value": format!("{:.2}", value.round_dp(2)),
        })
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    async fn create_order(&self, request: CreateOrderRequest) -> Result<CreatedOrder, GatewayError> {
        self.config.credentials()?;
        if request.items.is_empty() {
            return Err(GatewayError::InvalidRequest("order has no items".to_string()));
        }
        if request.total <= Decimal::ZERO {
            return Err(GatewayError::InvalidRequest(format!(
                "order total must be positive, got {}",
                request.total
            )));
        }
        if request.return_url.trim().is_empty() || request.cancel_url.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "return and cancel URLs are required".to_string(),
            ));
        }

        // Each item is converted on its own so the itemized breakdown sums
        // exactly to the purchase unit amount.
        let mut item_prices_usd = Vec::with_capacity(request.items.len());
        let mut paypal_items = Vec::with_capacity(request.items.len());
        let mut total_usd = Decimal::ZERO;
        for item in &request.items {
            let price_usd = self.converter.convert(item.price).await;
            total_usd += price_usd;
            item_prices_usd.push((item.course_id, price_usd));
            paypal_items.push(json!({
                "name": item.name.chars().take(127).collect::<String>(),
                "sku": item.course_id.to_string(),
                "quantity": "1",
                "category": "DIGITAL_GOODS",
                "unit_amount": self.money(price_usd),
            }));
        }

        let mut purchase_unit = json!({
            "amount": {
                "currency_code": self.config.currency,
                "value": format!("{:.2}", total_usd),
                "breakdown": { "item_total": self.money(total_usd) },
            },
            "items": paypal_items,
        });
        if let Some(email) = &self.config.payee_email {
            purchase_unit["payee"] = json!({ "email_address": email });
        }

        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [purchase_unit],
            "application_context": {
                "return_url": request.return_url,
                "cancel_url": request.cancel_url,
                "user_action": "PAY_NOW",
                "shipping_preference": "NO_SHIPPING",
            },
        });

        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = describe_error(status.as_u16(), &text);
            error!(status = status.as_u16(), %message, "PayPal rejected order creation");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let order: OrderResponse = response.json().await?;
        let approval_url = order
            .links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.clone())
            .ok_or_else(|| {
                GatewayError::MalformedResponse("order response has no approval link".to_string())
            })?;
        let gateway_order_id = GatewayOrderId::parse(&order.id)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let exchange_rate = (total_usd / request.total).round_dp(8);
        info!(order_id = %gateway_order_id, %total_usd, "Created PayPal order");

        Ok(CreatedOrder {
            gateway_order_id,
            approval_url,
            status: order.status,
            total_amount_usd: total_usd,
            exchange_rate,
            item_prices_usd,
        })
    }

    #[instrument(skip(self), fields(order_id = %gateway_order_id))]
    async fn capture_order(&self, gateway_order_id: &GatewayOrderId) -> GatewayCapture {
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(e) => return GatewayCapture::Failed { error: e.to_string() },
        };

        let response = match self
            .client
            .post(self.url(&format!(
                "/v2/checkout/orders/{}/capture",
                gateway_order_id.as_str()
            )))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return GatewayCapture::Failed {
                    error: GatewayError::from(e).to_string(),
                }
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let details: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.is_success() {
            let order_status = details
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if order_status == "COMPLETED" {
                info!("PayPal order captured");
                return GatewayCapture::Captured {
                    gateway_order_id: gateway_order_id.clone(),
                    details,
                };
            }
            warn!(%order_status, "PayPal capture did not complete");
            return GatewayCapture::Failed {
                error: format!("capture returned status {}", order_status),
            };
        }

        if has_issue(&details, "ORDER_ALREADY_CAPTURED") {
            info!("PayPal order was already captured");
            return GatewayCapture::Captured {
                gateway_order_id: gateway_order_id.clone(),
                details,
            };
        }

        let message = describe_error(status.as_u16(), &text);
        warn!(status = status.as_u16(), %message, "PayPal capture failed");
        GatewayCapture::Failed { error: message }
    }

    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        body: &Value,
    ) -> Result<bool, GatewayError> {
        let Some(webhook_id) = self.config.webhook_id.as_deref() else {
            return Ok(true);
        };

        let (
            Some(auth_algo),
            Some(cert_url),
            Some(transmission_id),
            Some(transmission_sig),
            Some(transmission_time),
        ) = (
            headers.auth_algo.as_deref(),
            headers.cert_url.as_deref(),
            headers.transmission_id.as_deref(),
            headers.transmission_sig.as_deref(),
            headers.transmission_time.as_deref(),
        )
        else {
            warn!("Webhook delivery is missing PayPal transmission headers");
            return Ok(false);
        };

        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v1/notifications/verify-webhook-signature"))
            .bearer_auth(token)
            .json(&json!({
                "auth_algo": auth_algo,
                "cert_url": cert_url,
                "transmission_id": transmission_id,
                "transmission_sig": transmission_sig,
                "transmission_time": transmission_time,
                "webhook_id": webhook_id,
                "webhook_event": body,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: describe_error(status.as_u16(), &text),
            });
        }

        let result: Value = response.json().await?;
        Ok(result.get("verification_status").and_then(Value::as_str) == Some("SUCCESS"))
    }
}

fn has_issue(body: &Value, issue: &str) -> bool {
    body.get("details")
        .and_then(Value::as_array)
        .map(|details| {
            details
                .iter()
                .any(|d| d.get("issue").and_then(Value::as_str) == Some(issue))
        })
        .unwrap_or(false)
}

/// Human-readable message from a PayPal error body. 422 responses carry
/// per-field `details` which are more useful than the top-level message.
fn describe_error(status: u16, body: &str) -> String {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if body.is_empty() => return format!("HTTP {}", status),
        Err(_) => return body.to_string(),
    };

    if status == 422 {
        if let Some(details) = parsed.get("details").and_then(Value::as_array) {
            let issues: Vec<String> = details
                .iter()
                .map(|d| {
                    let issue = d.get("issue").and_then(Value::as_str).unwrap_or("UNKNOWN");
                    match d.get("description").and_then(Value::as_str) {
                        Some(description) => format!("{}: {}", issue, description),
                        None => issue.to_string(),
                    }
                })
                .collect();
            if !issues.is_empty() {
                return issues.join("; ");
            }
        }
    }

    parsed
        .get("message")
        .or_else(|| parsed.get("error_description"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}
