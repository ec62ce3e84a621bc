pub mod exchange_rate;
pub mod gateway;
pub mod orchestrator;
pub mod paypal;
pub mod records;

pub use exchange_rate::{CurrencyConverter, ExchangeRateProvider, HttpExchangeRateProvider};
pub use gateway::{
    CreateOrderRequest, CreatedOrder, GatewayCapture, GatewayError, GatewayItem, PaymentGateway,
    WebhookHeaders,
};
pub use orchestrator::{
    CaptureResult, CustomerPaymentService, InitiatePaymentRequest, InitiateResult, PaymentSettings,
    WebhookAck,
};
pub use paypal::{PayPalConfig, PayPalGateway};
pub use records::{GatewayOrderId, OrderItem, OrderRecord, OrderStatus, PaymentDetails};
