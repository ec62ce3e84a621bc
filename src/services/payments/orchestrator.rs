//! Customer checkout: initiation, capture and the success side effects.
//!
//! An order moves `PENDING -> COMPLETED` exactly once. Every read of order
//! state goes cache first and falls back to the durable store, so a capture
//! that arrives after cache eviction still completes.

use super::gateway::{
    CreateOrderRequest, GatewayCapture, GatewayItem, PaymentGateway, WebhookHeaders,
};
use super::records::{
    order_key, payment_details_key, GatewayOrderId, OrderItem, OrderRecord, OrderStatus,
    PaymentDetails, PaymentSnapshot,
};
use crate::{
    cache::{CacheBackedRepository, CacheStore},
    config::PaymentConfig,
    entities::{
        order_detail,
        payment::{self, PaymentStatus},
        temporary_payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{PaymentRepository, TemporaryPaymentRepository},
    services::commerce::{CartService, EnrollmentService, VoucherService},
};
use axum::http::StatusCode;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const ORDER_APPROVED: &str = "CHECKOUT.ORDER.APPROVED";
const CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    /// Currency cart prices are expressed in
    pub currency_code: String,
    pub pending_ttl: Duration,
    pub completed_ttl: Duration,
    pub snapshot_ttl: Duration,
}

impl PaymentSettings {
    pub fn from_config(config: &PaymentConfig) -> Self {
        Self {
            currency_code: config.local_currency.clone(),
            pending_ttl: config.pending_ttl(),
            completed_ttl: config.completed_ttl(),
            snapshot_ttl: config.snapshot_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[validate(url)]
    pub return_url: String,
    #[validate(url)]
    pub cancel_url: String,
    #[serde(default)]
    pub selected_course_ids: Option<Vec<Uuid>>,
}

/// Outcome of [`CustomerPaymentService::initiate_payment`]. Failures are
/// reported here rather than as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl InitiateResult {
    fn succeeded(order_id: Uuid, payment_id: &GatewayOrderId, approval_url: String) -> Self {
        Self {
            success: true,
            payment_id: Some(payment_id.to_string()),
            approval_url: Some(approval_url),
            order_id: Some(order_id),
            error: None,
            status: StatusCode::CREATED,
        }
    }

    fn failed(err: &ServiceError) -> Self {
        Self {
            success: false,
            payment_id: None,
            approval_url: None,
            order_id: None,
            error: Some(err.response_message()),
            status: err.status_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub success: bool,
    pub payment_id: String,
    pub order_id: Uuid,
    /// Set when the order had been captured by an earlier call
    pub already_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureResult {
    fn completed(token: &GatewayOrderId, order_id: Uuid, details: Option<Value>) -> Self {
        Self {
            success: true,
            payment_id: token.to_string(),
            order_id,
            already_completed: details.is_none(),
            details,
            error: None,
        }
    }

    fn failed(token: &GatewayOrderId, order_id: Uuid, error: String) -> Self {
        Self {
            success: false,
            payment_id: token.to_string(),
            order_id,
            already_completed: false,
            details: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub event_type: String,
    pub handled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureResult>,
}

/// Drives checkout against the payment gateway and applies the effects of
/// a successful capture: durable payment, enrollments, order details,
/// voucher usage and cart cleanup.
#[derive(Clone)]
pub struct CustomerPaymentService {
    gateway: Arc<dyn PaymentGateway>,
    cart: Arc<CartService>,
    enrollments: Arc<EnrollmentService>,
    vouchers: Arc<VoucherService>,
    payments: Arc<dyn PaymentRepository>,
    snapshots: Arc<dyn TemporaryPaymentRepository>,
    orders: CacheBackedRepository<OrderRecord>,
    details: CacheBackedRepository<PaymentDetails>,
    event_sender: Arc<EventSender>,
    settings: PaymentSettings,
}

impl CustomerPaymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        cart: Arc<CartService>,
        enrollments: Arc<EnrollmentService>,
        vouchers: Arc<VoucherService>,
        payments: Arc<dyn PaymentRepository>,
        snapshots: Arc<dyn TemporaryPaymentRepository>,
        cache: CacheStore,
        event_sender: Arc<EventSender>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            gateway,
            cart,
            enrollments,
            vouchers,
            payments,
            snapshots,
            orders: CacheBackedRepository::new(cache.clone(), settings.pending_ttl),
            details: CacheBackedRepository::new(cache, settings.pending_ttl),
            event_sender,
            settings,
        }
    }

    /// Creates a gateway order for the user's selected cart items.
    #[instrument(skip(self, request))]
    pub async fn initiate_payment(
        &self,
        user_id: Uuid,
        request: InitiatePaymentRequest,
    ) -> InitiateResult {
        match self.try_initiate(user_id, request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%user_id, error = %e, "Payment initiation failed");
                InitiateResult::failed(&e)
            }
        }
    }

    async fn try_initiate(
        &self,
        user_id: Uuid,
        request: InitiatePaymentRequest,
    ) -> Result<InitiateResult, ServiceError> {
        request.validate()?;

        if let Some(course_ids) = &request.selected_course_ids {
            self.cart.select_cart_items(user_id, course_ids).await?;
        }

        let summary = self.cart.get_selected_cart_items(user_id).await?;
        if summary.is_empty() {
            return Err(ServiceError::ValidationError(
                "No cart items selected for payment".to_string(),
            ));
        }
        if summary.total_final_price <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Invalid order total: {}",
                summary.total_final_price
            )));
        }

        let created = self
            .gateway
            .create_order(CreateOrderRequest {
                items: summary
                    .items
                    .iter()
                    .map(|item| GatewayItem {
                        course_id: item.course_id,
                        name: item.title.clone(),
                        price: item.final_price,
                    })
                    .collect(),
                total: summary.total_final_price,
                return_url: request.return_url,
                cancel_url: request.cancel_url,
            })
            .await?;

        let token = created.gateway_order_id.clone();
        let items: Vec<OrderItem> = summary
            .items
            .iter()
            .map(|item| OrderItem {
                course_id: item.course_id,
                price: item.original_price,
                discount: item.discount_amount,
                final_price: item.final_price,
                price_usd: created
                    .item_prices_usd
                    .iter()
                    .find(|(course_id, _)| *course_id == item.course_id)
                    .map(|(_, price)| *price),
            })
            .collect();
        let voucher_id = summary
            .voucher_id
            .filter(|_| items.iter().any(|item| item.discount > Decimal::ZERO));

        let now = Utc::now();
        let order = OrderRecord {
            order_id: Uuid::new_v4(),
            user_id,
            total_amount: summary.total_final_price,
            currency_code: self.settings.currency_code.clone(),
            exchange_rate: Some(created.exchange_rate),
            total_amount_usd: Some(created.total_amount_usd),
            payment_id: token.clone(),
            status: OrderStatus::Pending,
            items,
            voucher_id,
            created_at: now,
            completed_at: None,
        };
        let details = PaymentDetails::for_order(&order);

        let shadowed = match self.write_snapshot(&order, &details).await {
            Ok(()) => true,
            Err(e) => {
                warn!(order_id = %order.order_id, error = %e, "Failed to write durable order snapshot");
                false
            }
        };

        if let Err(e) = self.cache_order(&order, &details, self.settings.pending_ttl).await {
            if !shadowed {
                error!(order_id = %order.order_id, error = %e, "Order could not be stored anywhere");
                return Err(e);
            }
            warn!(order_id = %order.order_id, error = %e, "Order cached only in durable snapshot");
        }

        self.event_sender
            .send_or_log(Event::PaymentInitiated {
                user_id,
                order_id: order.order_id,
                gateway_order_id: token.to_string(),
            })
            .await;
        metrics::counter!("course_market.payment.initiated", 1);
        info!(
            %user_id,
            order_id = %order.order_id,
            payment_id = %token,
            total = %order.total_amount,
            "Payment initiated"
        );

        Ok(InitiateResult::succeeded(
            order.order_id,
            &token,
            created.approval_url,
        ))
    }

    /// Captures the gateway order behind `token`. Safe to call repeatedly:
    /// once the order is completed the gateway is not contacted again.
    ///
    /// `user_id` is checked against the order owner when supplied; the
    /// gateway's own redirect callback carries only the token.
    #[instrument(skip(self))]
    pub async fn capture_payment(
        &self,
        token: &str,
        user_id: Option<Uuid>,
    ) -> Result<CaptureResult, ServiceError> {
        let token = GatewayOrderId::parse(token)?;

        let fetched = self
            .details
            .get_or_recover(&payment_details_key(&token), || self.recover_details(&token))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", token)))?;
        if fetched.was_recovered() {
            metrics::counter!("course_market.payment.recovered", 1);
            info!(payment_id = %token, "Recovered payment details from durable store");
        }
        let details = fetched.into_inner();

        if details.status == OrderStatus::Completed {
            debug!(payment_id = %token, "Payment already completed");
            return Ok(CaptureResult::completed(&token, details.order_id, None));
        }

        let order = self
            .orders
            .get_or_recover(&order_key(details.order_id), || self.recover_order(&token))
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", details.order_id))
            })?
            .into_inner();

        if order.status == OrderStatus::Completed {
            return Ok(CaptureResult::completed(&token, order.order_id, None));
        }

        if let Some(user_id) = user_id {
            if user_id != order.user_id {
                warn!(%user_id, order_id = %order.order_id, "Capture attempted by another user");
                return Err(ServiceError::Forbidden(
                    "Payment belongs to another user".to_string(),
                ));
            }
        }

        match self.gateway.capture_order(&token).await {
            GatewayCapture::Failed { error } => {
                metrics::counter!("course_market.payment.capture_failed", 1);
                warn!(payment_id = %token, %error, "Gateway capture failed, order stays pending");
                Ok(CaptureResult::failed(&token, order.order_id, error))
            }
            GatewayCapture::Captured { details, .. } => {
                let order_id = order.order_id;
                self.process_successful_payment(order, details.clone())
                    .await?;
                Ok(CaptureResult::completed(&token, order_id, Some(details)))
            }
        }
    }

    /// Authenticated capture from the storefront after the buyer returns.
    pub async fn confirm(&self, user_id: Uuid, token: &str) -> Result<CaptureResult, ServiceError> {
        self.capture_payment(token, Some(user_id)).await
    }

    /// Routes gateway webhook deliveries to the token-only capture path.
    #[instrument(skip(self, headers, body))]
    pub async fn handle_webhook(
        &self,
        headers: &WebhookHeaders,
        body: &Value,
    ) -> Result<WebhookAck, ServiceError> {
        if !self.gateway.verify_webhook(headers, body).await? {
            return Err(ServiceError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }

        let event_type = body
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let pointer = match event_type.as_str() {
            ORDER_APPROVED => "/resource/id",
            CAPTURE_COMPLETED => "/resource/supplementary_data/related_ids/order_id",
            _ => {
                info!(%event_type, "Ignoring webhook event");
                return Ok(WebhookAck {
                    received: true,
                    event_type,
                    handled: false,
                    capture: None,
                });
            }
        };

        let token = body
            .pointer(pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("{} event has no order id", event_type))
            })?;

        let capture = self.capture_payment(token, None).await?;
        Ok(WebhookAck {
            received: true,
            event_type,
            handled: true,
            capture: Some(capture),
        })
    }

    /// Applies a successful capture. Each step is idempotent so a replay
    /// after a partial failure converges on the same state.
    #[instrument(skip(self, order, gateway_details), fields(order_id = %order.order_id))]
    pub async fn process_successful_payment(
        &self,
        mut order: OrderRecord,
        gateway_details: Value,
    ) -> Result<OrderRecord, ServiceError> {
        let now = Utc::now();
        let token = order.payment_id.clone();

        let payment = self.ensure_payment(&order).await?;

        for item in &order.items {
            self.enrollments
                .enroll(order.user_id, item.course_id, Some(payment.id))
                .await?;

            let detail = order_detail::Model {
                id: Uuid::new_v4(),
                payment_id: payment.id,
                course_id: item.course_id,
                price: item.price,
                discount: item.discount,
                final_price: item.final_price,
                created_at: now,
            };
            match self.payments.insert_order_detail(detail).await {
                Ok(_) | Err(ServiceError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // only the caller that flips the row to COMPLETED records voucher usage
        let newly_completed = self
            .payments
            .mark_completed(token.as_str(), gateway_details, now)
            .await?;

        if newly_completed {
            if let Some(voucher_id) = order.voucher_id {
                if let Err(e) = self
                    .vouchers
                    .record_usage(voucher_id, &order.discounted_course_ids())
                    .await
                {
                    warn!(%voucher_id, error = %e, "Failed to record voucher usage");
                }
            }
        }

        let course_ids = order.course_ids();
        if let Err(e) = self
            .cart
            .remove_courses_from_database_cart(order.user_id, &course_ids)
            .await
        {
            warn!(user_id = %order.user_id, error = %e, "Failed to remove paid courses from cart");
        }
        if let Err(e) = self.cart.clear_selected_cart_items(order.user_id).await {
            warn!(user_id = %order.user_id, error = %e, "Failed to clear cart selection");
        }

        if let Err(e) = self.snapshots.delete_by_payment_id(token.as_str()).await {
            warn!(payment_id = %token, error = %e, "Failed to delete order snapshot");
        }

        order.status = OrderStatus::Completed;
        order.completed_at = Some(now);
        let details = PaymentDetails::for_order(&order);
        if let Err(e) = self
            .cache_order(&order, &details, self.settings.completed_ttl)
            .await
        {
            warn!(payment_id = %token, error = %e, "Failed to cache completed order");
        }

        self.event_sender
            .send_or_log(Event::PaymentCompleted {
                user_id: order.user_id,
                order_id: order.order_id,
                gateway_order_id: token.to_string(),
                course_ids,
            })
            .await;
        metrics::counter!("course_market.payment.captured", 1);
        info!(
            user_id = %order.user_id,
            payment_id = %token,
            courses = order.items.len(),
            "Payment completed"
        );

        Ok(order)
    }

    /// Durable payment row for `order`, created PENDING when absent.
    async fn ensure_payment(&self, order: &OrderRecord) -> Result<payment::Model, ServiceError> {
        let token = order.payment_id.as_str();
        if let Some(existing) = self.payments.find_by_transaction_id(token).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let model = payment::Model {
            id: Uuid::new_v4(),
            order_id: order.order_id,
            user_id: order.user_id,
            amount: order.total_amount,
            currency: order.currency_code.clone(),
            amount_usd: order.total_amount_usd,
            exchange_rate: order.exchange_rate,
            status: PaymentStatus::Pending,
            transaction_id: token.to_string(),
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        match self.payments.save(model).await {
            Ok(created) => Ok(created),
            Err(ServiceError::Conflict(_)) => self
                .payments
                .find_by_transaction_id(token)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError("Payment vanished after conflict".to_string())
                }),
            Err(e) => Err(e),
        }
    }

    async fn cache_order(
        &self,
        order: &OrderRecord,
        details: &PaymentDetails,
        ttl: Duration,
    ) -> Result<(), ServiceError> {
        self.orders
            .put(&order_key(order.order_id), order, ttl)
            .await?;
        self.details
            .put(&payment_details_key(&order.payment_id), details, ttl)
            .await?;
        Ok(())
    }

    async fn write_snapshot(
        &self,
        order: &OrderRecord,
        details: &PaymentDetails,
    ) -> Result<(), ServiceError> {
        let snapshot = PaymentSnapshot {
            order: order.clone(),
            details: details.clone(),
        };
        let ttl = chrono::Duration::from_std(self.settings.snapshot_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        self.snapshots
            .save(temporary_payment::Model {
                id: Uuid::new_v4(),
                payment_id: order.payment_id.to_string(),
                order_id: order.order_id,
                user_id: order.user_id,
                payment_data: serde_json::to_value(&snapshot)?,
                expires_at: order.created_at + ttl,
                created_at: order.created_at,
            })
            .await
    }

    /// Completed durable payment first, then the pending snapshot.
    async fn recover_details(
        &self,
        token: &GatewayOrderId,
    ) -> Result<Option<PaymentDetails>, ServiceError> {
        if let Some(payment) = self.payments.find_by_transaction_id(token.as_str()).await? {
            if payment.status == PaymentStatus::Completed {
                return Ok(Some(PaymentDetails {
                    order_id: payment.order_id,
                    status: OrderStatus::Completed,
                    created_at: payment.created_at,
                    currency_code: payment.currency,
                    total_amount: payment.amount,
                    total_amount_usd: payment.amount_usd,
                    exchange_rate: payment.exchange_rate,
                }));
            }
        }
        Ok(self.load_snapshot(token).await?.map(|s| s.details))
    }

    async fn recover_order(
        &self,
        token: &GatewayOrderId,
    ) -> Result<Option<OrderRecord>, ServiceError> {
        Ok(self.load_snapshot(token).await?.map(|s| s.order))
    }

    async fn load_snapshot(
        &self,
        token: &GatewayOrderId,
    ) -> Result<Option<PaymentSnapshot>, ServiceError> {
        let Some(row) = self.snapshots.find_by_payment_id(token.as_str()).await? else {
            return Ok(None);
        };
        if row.expires_at <= Utc::now() {
            debug!(payment_id = %token, "Ignoring expired order snapshot");
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(row.payment_data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::entities::{
        course,
        voucher::{self, CreatorRole, DiscountType, VoucherScope},
    };
    use crate::repositories::{
        CartRepository, InMemoryCartRepository, InMemoryCourseRepository,
        InMemoryEnrollmentRepository, InMemoryPaymentRepository,
        InMemoryTemporaryPaymentRepository, InMemoryVoucherRepository,
    };
    use crate::services::payments::gateway::{CreatedOrder, GatewayError, MockPaymentGateway};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::sync::mpsc;

    const TOKEN: &str = "8XY12345AB678901C";

    struct Fixture {
        service: CustomerPaymentService,
        cart: Arc<CartService>,
        cache: CacheStore,
        courses: InMemoryCourseRepository,
        vouchers: InMemoryVoucherRepository,
        enrollments: InMemoryEnrollmentRepository,
        payments: InMemoryPaymentRepository,
        snapshots: InMemoryTemporaryPaymentRepository,
        durable_carts: InMemoryCartRepository,
        _events: mpsc::Receiver<Event>,
    }

    fn created_order() -> CreatedOrder {
        CreatedOrder {
            gateway_order_id: GatewayOrderId::parse(TOKEN).unwrap(),
            approval_url: format!("https://www.paypal.test/checkoutnow?token={}", TOKEN),
            status: "CREATED".into(),
            total_amount_usd: dec!(6),
            exchange_rate: dec!(0.00004),
            item_prices_usd: Vec::new(),
        }
    }

    /// Gateway that creates orders and captures exactly `captures` times.
    fn gateway(captures: usize) -> MockPaymentGateway {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_order()
            .returning(|_| Ok(created_order()));
        gateway
            .expect_capture_order()
            .times(captures)
            .returning(|token| GatewayCapture::Captured {
                gateway_order_id: token.clone(),
                details: json!({ "id": token.as_str(), "status": "COMPLETED" }),
            });
        gateway
    }

    fn fixture(gateway: MockPaymentGateway) -> Fixture {
        let cache = CacheStore::new(Arc::new(InMemoryCache::new()));
        let courses = InMemoryCourseRepository::new();
        let vouchers = InMemoryVoucherRepository::new();
        let enrollments = InMemoryEnrollmentRepository::new();
        let payments = InMemoryPaymentRepository::new();
        let snapshots = InMemoryTemporaryPaymentRepository::new();
        let durable_carts = InMemoryCartRepository::new();
        let (tx, rx) = mpsc::channel(256);
        let events = Arc::new(EventSender::new(tx));

        let voucher_service = Arc::new(VoucherService::new(
            Arc::new(vouchers.clone()),
            Arc::new(courses.clone()),
        ));
        let cart = Arc::new(CartService::new(
            cache.clone(),
            Arc::new(courses.clone()),
            Arc::new(enrollments.clone()),
            Arc::new(durable_carts.clone()),
            voucher_service.clone(),
            events.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        ));
        let enrollment_service = Arc::new(EnrollmentService::new(
            Arc::new(enrollments.clone()),
            events.clone(),
        ));
        let service = CustomerPaymentService::new(
            Arc::new(gateway),
            cart.clone(),
            enrollment_service,
            voucher_service,
            Arc::new(payments.clone()),
            Arc::new(snapshots.clone()),
            cache.clone(),
            events,
            PaymentSettings {
                currency_code: "VND".into(),
                pending_ttl: Duration::from_secs(7200),
                completed_ttl: Duration::from_secs(86400),
                snapshot_ttl: Duration::from_secs(86400),
            },
        );

        Fixture {
            service,
            cart,
            cache,
            courses,
            vouchers,
            enrollments,
            payments,
            snapshots,
            durable_carts,
            _events: rx,
        }
    }

    async fn add_course(f: &Fixture, user_id: Uuid, price: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        f.courses
            .insert(course::Model {
                id,
                title: format!("Course {}", price),
                price,
                instructor_id: Uuid::new_v4(),
                category_id: None,
                created_at: Utc::now(),
            })
            .await;
        f.cart.add_to_cart(user_id, id).await.unwrap();
        id
    }

    fn request(selected: Option<Vec<Uuid>>) -> InitiatePaymentRequest {
        InitiatePaymentRequest {
            return_url: "https://shop.example.com/return".into(),
            cancel_url: "https://shop.example.com/cancel".into(),
            selected_course_ids: selected,
        }
    }

    async fn initiated(f: &Fixture, user_id: Uuid, courses: Vec<Uuid>) -> InitiateResult {
        let result = f.service.initiate_payment(user_id, request(Some(courses))).await;
        assert!(result.success, "initiate failed: {:?}", result.error);
        result
    }

    #[tokio::test]
    async fn initiate_stores_pending_order_in_cache_and_snapshot() {
        let f = fixture(gateway(0));
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let b = add_course(&f, user, dec!(50000)).await;

        let result = initiated(&f, user, vec![a, b]).await;
        assert_eq!(result.payment_id.as_deref(), Some(TOKEN));
        assert_eq!(result.status, StatusCode::CREATED);

        let order_id = result.order_id.unwrap();
        let order: OrderRecord = f.cache.get(&order_key(order_id)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, dec!(150000));
        assert_eq!(order.user_id, user);
        assert_eq!(order.items.len(), 2);

        let token = GatewayOrderId::parse(TOKEN).unwrap();
        let details: PaymentDetails = f
            .cache
            .get(&payment_details_key(&token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.order_id, order_id);
        assert!(f.cache.ttl(&order_key(order_id)).await.unwrap() > 7000);

        let snapshot = f.snapshots.find_by_payment_id(TOKEN).await.unwrap().unwrap();
        assert_eq!(snapshot.order_id, order_id);
    }

    #[tokio::test]
    async fn initiate_rejects_empty_selection_and_zero_total() {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_order().times(0);
        let f = fixture(gateway);
        let user = Uuid::new_v4();

        let empty = f.service.initiate_payment(user, request(None)).await;
        assert!(!empty.success);
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);

        let free = add_course(&f, user, Decimal::ZERO).await;
        let zero = f.service.initiate_payment(user, request(Some(vec![free]))).await;
        assert!(!zero.success);
        assert!(zero.error.unwrap().contains("Invalid order total"));
        assert!(f.snapshots.find_by_payment_id(TOKEN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn initiate_reports_gateway_rejection() {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_order().returning(|_| {
            Err(GatewayError::Rejected {
                status: 422,
                message: "ITEM_TOTAL_MISMATCH".into(),
            })
        });
        let f = fixture(gateway);
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(1000)).await;

        let result = f.service.initiate_payment(user, request(Some(vec![a]))).await;
        assert!(!result.success);
        assert_eq!(result.status, StatusCode::BAD_GATEWAY);
        assert!(result.error.unwrap().contains("ITEM_TOTAL_MISMATCH"));
    }

    #[tokio::test]
    async fn capture_twice_hits_gateway_once() {
        let f = fixture(gateway(1));
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let b = add_course(&f, user, dec!(50000)).await;
        initiated(&f, user, vec![a, b]).await;

        let first = f.service.capture_payment(TOKEN, Some(user)).await.unwrap();
        assert!(first.success);
        assert!(!first.already_completed);

        let second = f.service.capture_payment(TOKEN, None).await.unwrap();
        assert!(second.success);
        assert!(second.already_completed);

        assert_eq!(f.enrollments.count().await, 2);
        assert_eq!(f.payments.payment_count().await, 1);
        let payment = f.payments.find_by_transaction_id(TOKEN).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(f.payments.find_order_details(payment.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn capture_cleans_cart_and_snapshot() {
        let f = fixture(gateway(1));
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let keep = add_course(&f, user, dec!(20000)).await;
        initiated(&f, user, vec![a]).await;

        f.service.capture_payment(TOKEN, Some(user)).await.unwrap();

        assert_eq!(f.cart.cart_course_ids(user).await.unwrap(), vec![keep]);
        assert_eq!(f.durable_carts.course_ids(user).await.unwrap(), vec![keep]);
        assert!(f.cart.get_selected_cart_items(user).await.unwrap().is_empty());
        assert!(f.snapshots.find_by_payment_id(TOKEN).await.unwrap().is_none());

        let token = GatewayOrderId::parse(TOKEN).unwrap();
        let details: PaymentDetails = f
            .cache
            .get(&payment_details_key(&token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn capture_after_eviction_recovers_from_snapshot() {
        let f = fixture(gateway(1));
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let order_id = initiated(&f, user, vec![a]).await.order_id.unwrap();

        let token = GatewayOrderId::parse(TOKEN).unwrap();
        f.cache.del(&payment_details_key(&token)).await.unwrap();
        f.cache.del(&order_key(order_id)).await.unwrap();

        let result = f.service.capture_payment(TOKEN, Some(user)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.order_id, order_id);
        assert_eq!(f.enrollments.count().await, 1);

        let order: OrderRecord = f.cache.get(&order_key(order_id)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(order.completed_at.is_some());
    }

    #[tokio::test]
    async fn completed_payment_is_found_after_cache_loss() {
        let f = fixture(gateway(1));
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let order_id = initiated(&f, user, vec![a]).await.order_id.unwrap();
        f.service.capture_payment(TOKEN, None).await.unwrap();

        let token = GatewayOrderId::parse(TOKEN).unwrap();
        f.cache.del(&payment_details_key(&token)).await.unwrap();
        f.cache.del(&order_key(order_id)).await.unwrap();

        let replay = f.service.capture_payment(TOKEN, None).await.unwrap();
        assert!(replay.already_completed);
        assert_eq!(replay.order_id, order_id);
    }

    #[tokio::test]
    async fn failed_capture_leaves_order_pending() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_order()
            .returning(|_| Ok(created_order()));
        gateway
            .expect_capture_order()
            .times(1)
            .returning(|_| GatewayCapture::Failed {
                error: "INSTRUMENT_DECLINED".into(),
            });
        let f = fixture(gateway);
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let order_id = initiated(&f, user, vec![a]).await.order_id.unwrap();

        let result = f.service.capture_payment(TOKEN, Some(user)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("INSTRUMENT_DECLINED"));

        let order: OrderRecord = f.cache.get(&order_key(order_id)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(f.enrollments.count().await, 0);
        assert_eq!(f.cart.cart_course_ids(user).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn capture_by_another_user_is_forbidden() {
        let f = fixture(gateway(0));
        let owner = Uuid::new_v4();
        let a = add_course(&f, owner, dec!(100000)).await;
        initiated(&f, owner, vec![a]).await;

        let err = f
            .service
            .capture_payment(TOKEN, Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Forbidden(_));
        assert_eq!(f.enrollments.count().await, 0);
    }

    #[tokio::test]
    async fn unknown_or_malformed_tokens_are_rejected() {
        let f = fixture(gateway(0));
        assert_matches!(
            f.service.capture_payment("NOPE123", None).await,
            Err(ServiceError::NotFound(_))
        );
        assert_matches!(
            f.service.capture_payment("bad token!", None).await,
            Err(ServiceError::ValidationError(_))
        );
    }

    async fn seed_save10(f: &Fixture) -> Uuid {
        let now = Utc::now();
        let voucher_id = Uuid::new_v4();
        f.vouchers
            .insert(voucher::Model {
                id: voucher_id,
                code: "SAVE10".into(),
                scope: VoucherScope::AllCourses,
                discount_type: DiscountType::Percentage,
                discount_value: dec!(10),
                max_discount: None,
                category_id: None,
                start_date: now - chrono::Duration::days(1),
                end_date: now + chrono::Duration::days(1),
                is_active: true,
                max_usage: Some(5),
                usage_count: 0,
                creator_id: Uuid::new_v4(),
                creator_role: CreatorRole::Admin,
                created_at: now,
            })
            .await;
        voucher_id
    }

    /// Payment store whose reads always lag behind: every payment looks
    /// PENDING, as it would to two captures reading before either writes.
    struct LaggingPayments(InMemoryPaymentRepository);

    #[async_trait::async_trait]
    impl PaymentRepository for LaggingPayments {
        async fn find_by_transaction_id(
            &self,
            transaction_id: &str,
        ) -> Result<Option<payment::Model>, ServiceError> {
            Ok(self
                .0
                .find_by_transaction_id(transaction_id)
                .await?
                .map(|p| payment::Model {
                    status: PaymentStatus::Pending,
                    ..p
                }))
        }

        async fn save(&self, model: payment::Model) -> Result<payment::Model, ServiceError> {
            self.0.save(model).await
        }

        async fn mark_completed(
            &self,
            transaction_id: &str,
            metadata: Value,
            completed_at: chrono::DateTime<Utc>,
        ) -> Result<bool, ServiceError> {
            self.0
                .mark_completed(transaction_id, metadata, completed_at)
                .await
        }

        async fn insert_order_detail(
            &self,
            model: order_detail::Model,
        ) -> Result<order_detail::Model, ServiceError> {
            self.0.insert_order_detail(model).await
        }

        async fn find_order_details(
            &self,
            payment_id: Uuid,
        ) -> Result<Vec<order_detail::Model>, ServiceError> {
            self.0.find_order_details(payment_id).await
        }
    }

    #[tokio::test]
    async fn racing_completions_count_voucher_once() {
        let f = fixture(gateway(0));
        let voucher_id = seed_save10(&f).await;
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let order_id = initiated(&f, user, vec![a]).await.order_id.unwrap();
        let order: OrderRecord = f.cache.get(&order_key(order_id)).await.unwrap().unwrap();

        let service = CustomerPaymentService {
            payments: Arc::new(LaggingPayments(f.payments.clone())),
            ..f.service.clone()
        };
        let details = json!({ "id": TOKEN, "status": "COMPLETED" });
        service
            .process_successful_payment(order.clone(), details.clone())
            .await
            .unwrap();
        service
            .process_successful_payment(order, details)
            .await
            .unwrap();

        let voucher = f.vouchers.find_by_id(voucher_id).await.unwrap();
        assert_eq!(voucher.usage_count, 1);
        assert_eq!(f.payments.payment_count().await, 1);
        assert_eq!(f.enrollments.count().await, 1);
        let payment = f.payments.find_by_transaction_id(TOKEN).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(f.payments.find_order_details(payment.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_snapshot_is_not_recovered() {
        let f = fixture(gateway(0));
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let order_id = initiated(&f, user, vec![a]).await.order_id.unwrap();

        let token = GatewayOrderId::parse(TOKEN).unwrap();
        f.cache.del(&payment_details_key(&token)).await.unwrap();
        f.cache.del(&order_key(order_id)).await.unwrap();

        let mut row = f.snapshots.find_by_payment_id(TOKEN).await.unwrap().unwrap();
        row.expires_at = Utc::now() - chrono::Duration::minutes(1);
        f.snapshots.save(row).await.unwrap();

        assert_matches!(
            f.service.capture_payment(TOKEN, Some(user)).await,
            Err(ServiceError::NotFound(_))
        );
        assert_eq!(f.enrollments.count().await, 0);
    }

    #[tokio::test]
    async fn voucher_usage_is_counted_once() {
        let f = fixture(gateway(1));
        let voucher_id = seed_save10(&f).await;

        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        let order_id = initiated(&f, user, vec![a]).await.order_id.unwrap();

        let order: OrderRecord = f.cache.get(&order_key(order_id)).await.unwrap().unwrap();
        assert_eq!(order.voucher_id, Some(voucher_id));
        assert_eq!(order.total_amount, dec!(90000));

        f.service.capture_payment(TOKEN, None).await.unwrap();
        f.service.capture_payment(TOKEN, None).await.unwrap();

        let voucher = f.vouchers.find_by_id(voucher_id).await.unwrap();
        assert_eq!(voucher.usage_count, 1);
    }

    #[tokio::test]
    async fn webhook_routes_approved_orders_to_capture() {
        let mut gateway = gateway(1);
        gateway.expect_verify_webhook().returning(|_, _| Ok(true));
        let f = fixture(gateway);
        let user = Uuid::new_v4();
        let a = add_course(&f, user, dec!(100000)).await;
        initiated(&f, user, vec![a]).await;

        let ack = f
            .service
            .handle_webhook(
                &WebhookHeaders::default(),
                &json!({ "event_type": ORDER_APPROVED, "resource": { "id": TOKEN } }),
            )
            .await
            .unwrap();
        assert!(ack.handled);
        assert!(ack.capture.unwrap().success);

        let ack = f
            .service
            .handle_webhook(
                &WebhookHeaders::default(),
                &json!({
                    "event_type": CAPTURE_COMPLETED,
                    "resource": { "supplementary_data": { "related_ids": { "order_id": TOKEN } } }
                }),
            )
            .await
            .unwrap();
        assert!(ack.capture.unwrap().already_completed);

        let ignored = f
            .service
            .handle_webhook(
                &WebhookHeaders::default(),
                &json!({ "event_type": "PAYMENT.CAPTURE.REFUNDED" }),
            )
            .await
            .unwrap();
        assert!(!ignored.handled);
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_unauthorized() {
        let mut gateway = gateway(0);
        gateway.expect_verify_webhook().returning(|_, _| Ok(false));
        let f = fixture(gateway);

        let err = f
            .service
            .handle_webhook(
                &WebhookHeaders::default(),
                &json!({ "event_type": ORDER_APPROVED, "resource": { "id": TOKEN } }),
            )
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Unauthorized(_));
    }
}
