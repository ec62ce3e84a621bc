use super::{
    CartRepository, CourseRepository, EnrollmentRepository, PaymentRepository,
    TemporaryPaymentRepository, VoucherRepository,
};
use crate::entities::{
    course, enrollment, order_detail, payment, temporary_payment, voucher, voucher_course,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InMemoryCourseRepository {
    courses: Arc<RwLock<HashMap<Uuid, course::Model>>>,
}

impl InMemoryCourseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, model: course::Model) {
        self.courses.write().await.insert(model.id, model);
    }
}

#[async_trait]
impl CourseRepository for InMemoryCourseRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<course::Model>, ServiceError> {
        Ok(self.courses.read().await.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<course::Model>, ServiceError> {
        let courses = self.courses.read().await;
        Ok(ids.iter().filter_map(|id| courses.get(id).cloned()).collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryVoucherRepository {
    vouchers: Arc<RwLock<Vec<voucher::Model>>>,
    bindings: Arc<RwLock<Vec<voucher_course::Model>>>,
}

impl InMemoryVoucherRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a voucher, keeping insertion order for `list_active`.
    pub async fn insert(&self, model: voucher::Model) {
        let mut vouchers = self.vouchers.write().await;
        vouchers.retain(|v| v.id != model.id);
        vouchers.push(model);
    }

    pub async fn bind_course(&self, voucher_id: Uuid, course_id: Uuid) {
        self.bindings.write().await.push(voucher_course::Model {
            id: Uuid::new_v4(),
            voucher_id,
            course_id,
            discount_amount: rust_decimal::Decimal::ZERO,
            usage_count: 0,
        });
    }

    pub async fn find_by_id(&self, id: Uuid) -> Option<voucher::Model> {
        self.vouchers
            .read()
            .await
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }
}

#[async_trait]
impl VoucherRepository for InMemoryVoucherRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<voucher::Model>, ServiceError> {
        Ok(self
            .vouchers
            .read()
            .await
            .iter()
            .find(|v| v.code == code)
            .cloned())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<voucher::Model>, ServiceError> {
        Ok(self
            .vouchers
            .read()
            .await
            .iter()
            .filter(|v| v.is_active && v.start_date <= now && now <= v.end_date)
            .cloned()
            .collect())
    }

    async fn course_ids(&self, voucher_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self
            .bindings
            .read()
            .await
            .iter()
            .filter(|b| b.voucher_id == voucher_id)
            .map(|b| b.course_id)
            .collect())
    }

    async fn increment_usage(
        &self,
        voucher_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        if let Some(v) = self
            .vouchers
            .write()
            .await
            .iter_mut()
            .find(|v| v.id == voucher_id)
        {
            v.usage_count += 1;
        }
        for binding in self.bindings.write().await.iter_mut() {
            if binding.voucher_id == voucher_id && course_ids.contains(&binding.course_id) {
                binding.usage_count += 1;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEnrollmentRepository {
    enrollments: Arc<RwLock<HashMap<(Uuid, Uuid), enrollment::Model>>>,
}

impl InMemoryEnrollmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.enrollments.read().await.len()
    }
}

#[async_trait]
impl EnrollmentRepository for InMemoryEnrollmentRepository {
    async fn find(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<enrollment::Model>, ServiceError> {
        Ok(self
            .enrollments
            .read()
            .await
            .get(&(user_id, course_id))
            .cloned())
    }

    async fn insert(&self, model: enrollment::Model) -> Result<enrollment::Model, ServiceError> {
        let mut enrollments = self.enrollments.write().await;
        let key = (model.user_id, model.course_id);
        if enrollments.contains_key(&key) {
            return Err(ServiceError::Conflict("Enrollment already exists".to_string()));
        }
        enrollments.insert(key, model.clone());
        Ok(model)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPaymentRepository {
    payments: Arc<RwLock<HashMap<Uuid, payment::Model>>>,
    details: Arc<RwLock<Vec<order_detail::Model>>>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn payment_count(&self) -> usize {
        self.payments.read().await.len()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| p.transaction_id == transaction_id)
            .cloned())
    }

    async fn save(&self, model: payment::Model) -> Result<payment::Model, ServiceError> {
        let mut payments = self.payments.write().await;
        let duplicate_tx = payments
            .values()
            .any(|p| p.id != model.id && p.transaction_id == model.transaction_id);
        if duplicate_tx {
            return Err(ServiceError::Conflict("Payment already exists".to_string()));
        }
        payments.insert(model.id, model.clone());
        Ok(model)
    }

    async fn mark_completed(
        &self,
        transaction_id: &str,
        metadata: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut payments = self.payments.write().await;
        match payments.values_mut().find(|p| {
            p.transaction_id == transaction_id && p.status != payment::PaymentStatus::Completed
        }) {
            Some(pending) => {
                pending.status = payment::PaymentStatus::Completed;
                pending.metadata = Some(metadata);
                pending.updated_at = completed_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_order_detail(
        &self,
        model: order_detail::Model,
    ) -> Result<order_detail::Model, ServiceError> {
        let mut details = self.details.write().await;
        if details
            .iter()
            .any(|d| d.payment_id == model.payment_id && d.course_id == model.course_id)
        {
            return Err(ServiceError::Conflict(
                "Order detail already exists".to_string(),
            ));
        }
        details.push(model.clone());
        Ok(model)
    }

    async fn find_order_details(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<order_detail::Model>, ServiceError> {
        Ok(self
            .details
            .read()
            .await
            .iter()
            .filter(|d| d.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTemporaryPaymentRepository {
    snapshots: Arc<RwLock<HashMap<String, temporary_payment::Model>>>,
}

impl InMemoryTemporaryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemporaryPaymentRepository for InMemoryTemporaryPaymentRepository {
    async fn save(&self, model: temporary_payment::Model) -> Result<(), ServiceError> {
        self.snapshots
            .write()
            .await
            .insert(model.payment_id.clone(), model);
        Ok(())
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<temporary_payment::Model>, ServiceError> {
        Ok(self.snapshots.read().await.get(payment_id).cloned())
    }

    async fn delete_by_payment_id(&self, payment_id: &str) -> Result<bool, ServiceError> {
        Ok(self.snapshots.write().await.remove(payment_id).is_some())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCartRepository {
    carts: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
}

impl InMemoryCartRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartRepository for InMemoryCartRepository {
    async fn add_course(&self, user_id: Uuid, course_id: Uuid) -> Result<(), ServiceError> {
        let mut carts = self.carts.write().await;
        let items = carts.entry(user_id).or_default();
        if !items.contains(&course_id) {
            items.push(course_id);
        }
        Ok(())
    }

    async fn remove_courses(
        &self,
        user_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<u64, ServiceError> {
        let mut carts = self.carts.write().await;
        let Some(items) = carts.get_mut(&user_id) else {
            return Ok(0);
        };
        let before = items.len();
        items.retain(|id| !course_ids.contains(id));
        Ok((before - items.len()) as u64)
    }

    async fn course_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self
            .carts
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}
