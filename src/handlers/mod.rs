pub mod auth;
pub mod cart;
pub mod common;
pub mod customer_payment;
pub mod health;

use crate::{
    cache::CacheStore,
    config::AppConfig,
    events::EventSender,
    repositories::RepositorySet,
    services::{
        commerce::{CartService, EnrollmentService, VoucherService},
        payments::{CustomerPaymentService, PaymentGateway, PaymentSettings},
    },
};
use std::sync::Arc;

/// Service container shared by every handler.
#[derive(Clone)]
pub struct AppServices {
    pub vouchers: Arc<VoucherService>,
    pub cart: Arc<CartService>,
    pub enrollments: Arc<EnrollmentService>,
    pub payments: Arc<CustomerPaymentService>,
}

impl AppServices {
    pub fn new(
        repositories: RepositorySet,
        cache: CacheStore,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Self {
        let vouchers = Arc::new(VoucherService::new(
            repositories.vouchers.clone(),
            repositories.courses.clone(),
        ));
        let cart = Arc::new(CartService::new(
            cache.clone(),
            repositories.courses.clone(),
            repositories.enrollments.clone(),
            repositories.carts.clone(),
            vouchers.clone(),
            event_sender.clone(),
            config.cache.cart_ttl(),
            config.cache.cart_view_ttl(),
        ));
        let enrollments = Arc::new(EnrollmentService::new(
            repositories.enrollments.clone(),
            event_sender.clone(),
        ));
        let payments = Arc::new(CustomerPaymentService::new(
            gateway,
            cart.clone(),
            enrollments.clone(),
            vouchers.clone(),
            repositories.payments.clone(),
            repositories.temporary_payments.clone(),
            cache,
            event_sender,
            PaymentSettings::from_config(&config.payment),
        ));

        Self {
            vouchers,
            cart,
            enrollments,
            payments,
        }
    }
}
