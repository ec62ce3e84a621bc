//! Narrow access to the durable store. Each trait has a sea-orm
//! implementation ([`database`]) and an in-process one ([`memory`]) used by
//! tests and local runs without a database.

use crate::entities::{
    course, enrollment, order_detail, payment, temporary_payment, voucher,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use uuid::Uuid;

pub mod database;
pub mod memory;

pub use database::{
    SeaOrmCartRepository, SeaOrmCourseRepository, SeaOrmEnrollmentRepository,
    SeaOrmPaymentRepository, SeaOrmTemporaryPaymentRepository, SeaOrmVoucherRepository,
};
pub use memory::{
    InMemoryCartRepository, InMemoryCourseRepository, InMemoryEnrollmentRepository,
    InMemoryPaymentRepository, InMemoryTemporaryPaymentRepository, InMemoryVoucherRepository,
};

#[async_trait]
pub trait CourseRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<course::Model>, ServiceError>;
    /// Courses in unspecified order; unknown ids are skipped.
    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<course::Model>, ServiceError>;
}

#[async_trait]
pub trait VoucherRepository: Send + Sync {
    async fn find_by_code(&self, code: &str) -> Result<Option<voucher::Model>, ServiceError>;
    /// Active vouchers whose validity window contains `now`, oldest first.
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<voucher::Model>, ServiceError>;
    /// Courses bound to a SPECIFIC_COURSES voucher.
    async fn course_ids(&self, voucher_id: Uuid) -> Result<Vec<Uuid>, ServiceError>;
    /// Bumps the voucher's usage counter and the per-course counters of `course_ids`.
    async fn increment_usage(&self, voucher_id: Uuid, course_ids: &[Uuid])
        -> Result<(), ServiceError>;
}

#[async_trait]
pub trait EnrollmentRepository: Send + Sync {
    async fn find(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<enrollment::Model>, ServiceError>;
    /// Fails with [`ServiceError::Conflict`] if (user, course) already exists.
    async fn insert(&self, model: enrollment::Model) -> Result<enrollment::Model, ServiceError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<payment::Model>, ServiceError>;
    /// Inserts or replaces by primary key.
    async fn save(&self, model: payment::Model) -> Result<payment::Model, ServiceError>;
    /// Flips the payment to COMPLETED only if it is not already. `Ok(true)`
    /// for the single caller that made the transition.
    async fn mark_completed(
        &self,
        transaction_id: &str,
        metadata: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;
    /// Fails with [`ServiceError::Conflict`] if the (payment, course) row exists.
    async fn insert_order_detail(
        &self,
        model: order_detail::Model,
    ) -> Result<order_detail::Model, ServiceError>;
    async fn find_order_details(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<order_detail::Model>, ServiceError>;
}

#[async_trait]
pub trait TemporaryPaymentRepository: Send + Sync {
    /// Inserts or replaces by gateway order id.
    async fn save(&self, model: temporary_payment::Model) -> Result<(), ServiceError>;
    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<temporary_payment::Model>, ServiceError>;
    async fn delete_by_payment_id(&self, payment_id: &str) -> Result<bool, ServiceError>;
}

/// Durable mirror of the cache-resident cart.
#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn add_course(&self, user_id: Uuid, course_id: Uuid) -> Result<(), ServiceError>;
    /// Returns how many rows were removed; a user without a cart yields 0.
    async fn remove_courses(&self, user_id: Uuid, course_ids: &[Uuid])
        -> Result<u64, ServiceError>;
    async fn course_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError>;
}

/// Every durable-store dependency of the services, behind its trait.
#[derive(Clone)]
pub struct RepositorySet {
    pub courses: Arc<dyn CourseRepository>,
    pub vouchers: Arc<dyn VoucherRepository>,
    pub enrollments: Arc<dyn EnrollmentRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub temporary_payments: Arc<dyn TemporaryPaymentRepository>,
    pub carts: Arc<dyn CartRepository>,
}

impl RepositorySet {
    pub fn sea_orm(db: Arc<DatabaseConnection>) -> Self {
        Self {
            courses: Arc::new(SeaOrmCourseRepository::new(db.clone())),
            vouchers: Arc::new(SeaOrmVoucherRepository::new(db.clone())),
            enrollments: Arc::new(SeaOrmEnrollmentRepository::new(db.clone())),
            payments: Arc::new(SeaOrmPaymentRepository::new(db.clone())),
            temporary_payments: Arc::new(SeaOrmTemporaryPaymentRepository::new(db.clone())),
            carts: Arc::new(SeaOrmCartRepository::new(db)),
        }
    }
}
