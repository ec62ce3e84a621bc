use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use course_market::{
    cache::{CacheStore, InMemoryCache},
    config::AppConfig,
    entities::{
        course,
        voucher::{self, CreatorRole, DiscountType, VoucherScope},
    },
    events::{self, EventSender, LoggingSubscriber},
    handlers::{auth::USER_ID_HEADER, AppServices},
    middleware_helpers::retry::RetryConfig,
    repositories::{
        InMemoryCartRepository, InMemoryCourseRepository, InMemoryEnrollmentRepository,
        InMemoryPaymentRepository, InMemoryTemporaryPaymentRepository, InMemoryVoucherRepository,
        RepositorySet,
    },
    services::payments::{
        CreateOrderRequest, CreatedOrder, GatewayCapture, GatewayError, GatewayOrderId,
        PaymentGateway, WebhookHeaders,
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ConnectOptions, Database};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Gateway double that counts calls and can be told to fail captures.
#[derive(Default)]
pub struct FakeGateway {
    pub created: AtomicUsize,
    pub captured: AtomicUsize,
    pub fail_capture: AtomicBool,
    pub reject_webhooks: AtomicBool,
}

impl FakeGateway {
    pub fn token(n: usize) -> String {
        format!("TESTORDER{:08}", n)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(&self, request: CreateOrderRequest) -> Result<CreatedOrder, GatewayError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let token = Self::token(n);
        let gateway_order_id = GatewayOrderId::parse(&token)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        Ok(CreatedOrder {
            gateway_order_id,
            approval_url: format!("https://www.sandbox.paypal.com/checkoutnow?token={}", token),
            status: "CREATED".to_string(),
            total_amount_usd: request.total,
            exchange_rate: Decimal::ONE,
            item_prices_usd: request
                .items
                .iter()
                .map(|item| (item.course_id, item.price))
                .collect(),
        })
    }

    async fn capture_order(&self, gateway_order_id: &GatewayOrderId) -> GatewayCapture {
        self.captured.fetch_add(1, Ordering::SeqCst);
        if self.fail_capture.load(Ordering::SeqCst) {
            return GatewayCapture::Failed {
                error: "INSTRUMENT_DECLINED".to_string(),
            };
        }
        GatewayCapture::Captured {
            gateway_order_id: gateway_order_id.clone(),
            details: json!({ "id": gateway_order_id.as_str(), "status": "COMPLETED" }),
        }
    }

    async fn verify_webhook(
        &self,
        _headers: &WebhookHeaders,
        _body: &Value,
    ) -> Result<bool, GatewayError> {
        Ok(!self.reject_webhooks.load(Ordering::SeqCst))
    }
}

/// Application wired to in-memory stores and a fake gateway, driven
/// through the real router.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub courses: InMemoryCourseRepository,
    pub vouchers: InMemoryVoucherRepository,
    pub enrollments: InMemoryEnrollmentRepository,
    pub payments: InMemoryPaymentRepository,
    pub carts: InMemoryCartRepository,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let config = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "test".to_string(),
        );

        let mut options = ConnectOptions::new(config.database_url.clone());
        options.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Arc::new(
            Database::connect(options)
                .await
                .expect("failed to open test database"),
        );

        let cache = CacheStore::with_retry_config(
            Arc::new(InMemoryCache::new()),
            RetryConfig::fixed(1, Duration::from_millis(1)),
        );

        let courses = InMemoryCourseRepository::new();
        let vouchers = InMemoryVoucherRepository::new();
        let enrollments = InMemoryEnrollmentRepository::new();
        let payments = InMemoryPaymentRepository::new();
        let carts = InMemoryCartRepository::new();
        let repositories = RepositorySet {
            courses: Arc::new(courses.clone()),
            vouchers: Arc::new(vouchers.clone()),
            enrollments: Arc::new(enrollments.clone()),
            payments: Arc::new(payments.clone()),
            temporary_payments: Arc::new(InMemoryTemporaryPaymentRepository::new()),
            carts: Arc::new(carts.clone()),
        };

        let (tx, rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(tx));
        let event_task = tokio::spawn(events::process_events(
            rx,
            vec![Arc::new(LoggingSubscriber)],
        ));

        let gateway = Arc::new(FakeGateway::default());
        let services = AppServices::new(
            repositories,
            cache.clone(),
            gateway.clone(),
            event_sender.clone(),
            &config,
        );

        let state = AppState {
            db,
            config,
            cache,
            event_sender,
            services,
        };
        let router = course_market::build_router(state.clone(), CorsLayer::new());

        Self {
            router,
            state,
            gateway,
            courses,
            vouchers,
            enrollments,
            payments,
            carts,
            _event_task: event_task,
        }
    }

    pub async fn seed_course(&self, title: &str, price: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        self.courses
            .insert(course::Model {
                id,
                title: title.to_string(),
                price,
                instructor_id: Uuid::new_v4(),
                category_id: None,
                created_at: Utc::now(),
            })
            .await;
        id
    }

    /// Active ALL_COURSES percentage voucher valid for the next day.
    pub async fn seed_percentage_voucher(
        &self,
        code: &str,
        percent: Decimal,
        max_discount: Option<Decimal>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.vouchers
            .insert(voucher::Model {
                id,
                code: code.to_string(),
                scope: VoucherScope::AllCourses,
                discount_type: DiscountType::Percentage,
                discount_value: percent,
                max_discount,
                category_id: None,
                start_date: now - chrono::Duration::hours(1),
                end_date: now + chrono::Duration::days(1),
                is_active: true,
                max_usage: None,
                usage_count: 0,
                creator_id: Uuid::new_v4(),
                creator_role: CreatorRole::Admin,
                created_at: now,
            })
            .await;
        id
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user_id: Option<Uuid>,
    ) -> Response {
        self.request_with_headers(method, uri, body, user_id, &[])
            .await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user_id: Option<Uuid>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            builder = builder.header(USER_ID_HEADER, user_id.to_string());
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Adds each course to the user's cart through the API.
    pub async fn add_to_cart(&self, user_id: Uuid, course_ids: &[Uuid]) {
        for course_id in course_ids {
            let response = self
                .request(
                    Method::POST,
                    "/cart/add",
                    Some(json!({ "courseId": course_id })),
                    Some(user_id),
                )
                .await;
            assert_eq!(response.status(), 200, "adding {} to cart", course_id);
        }
    }

    /// Starts checkout for `course_ids` and returns the response body.
    pub async fn initiate(&self, user_id: Uuid, course_ids: &[Uuid]) -> (u16, Value) {
        let response = self
            .request(
                Method::POST,
                "/customer-payment/init",
                Some(json!({
                    "returnUrl": "https://learn.example.com/checkout/return",
                    "cancelUrl": "https://learn.example.com/checkout/cancel",
                    "selectedCourseIds": course_ids,
                })),
                Some(user_id),
            )
            .await;
        let status = response.status().as_u16();
        (status, response_json(response).await)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal serialized as a JSON string or number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected decimal, got {}", other),
    }
}
