use super::{
    CartRepository, CourseRepository, EnrollmentRepository, PaymentRepository,
    TemporaryPaymentRepository, VoucherRepository,
};
use crate::entities::{
    cart, cart_item, course, enrollment, order_detail, payment, temporary_payment, voucher,
    voucher_course,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set, SqlErr,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

fn conflict_or_db(err: DbErr, what: &str) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::Conflict(format!("{} already exists", what))
        }
        _ => ServiceError::DatabaseError(err),
    }
}

#[derive(Clone)]
pub struct SeaOrmCourseRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmCourseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CourseRepository for SeaOrmCourseRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<course::Model>, ServiceError> {
        Ok(course::Entity::find_by_id(id).one(&*self.db).await?)
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<course::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(course::Entity::find()
            .filter(course::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db)
            .await?)
    }
}

#[derive(Clone)]
pub struct SeaOrmVoucherRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmVoucherRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VoucherRepository for SeaOrmVoucherRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<voucher::Model>, ServiceError> {
        Ok(voucher::Entity::find()
            .filter(voucher::Column::Code.eq(code))
            .one(&*self.db)
            .await?)
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<voucher::Model>, ServiceError> {
        Ok(voucher::Entity::find()
            .filter(voucher::Column::IsActive.eq(true))
            .filter(voucher::Column::StartDate.lte(now))
            .filter(voucher::Column::EndDate.gte(now))
            .order_by_asc(voucher::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn course_ids(&self, voucher_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let rows = voucher_course::Entity::find()
            .filter(voucher_course::Column::VoucherId.eq(voucher_id))
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(|row| row.course_id).collect())
    }

    #[instrument(skip(self))]
    async fn increment_usage(
        &self,
        voucher_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        voucher::Entity::update_many()
            .col_expr(
                voucher::Column::UsageCount,
                Expr::col(voucher::Column::UsageCount).add(1),
            )
            .filter(voucher::Column::Id.eq(voucher_id))
            .exec(&*self.db)
            .await?;

        if !course_ids.is_empty() {
            voucher_course::Entity::update_many()
                .col_expr(
                    voucher_course::Column::UsageCount,
                    Expr::col(voucher_course::Column::UsageCount).add(1),
                )
                .filter(voucher_course::Column::VoucherId.eq(voucher_id))
                .filter(voucher_course::Column::CourseId.is_in(course_ids.iter().copied()))
                .exec(&*self.db)
                .await?;
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct SeaOrmEnrollmentRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmEnrollmentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EnrollmentRepository for SeaOrmEnrollmentRepository {
    async fn find(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<enrollment::Model>, ServiceError> {
        Ok(enrollment::Entity::find()
            .filter(enrollment::Column::UserId.eq(user_id))
            .filter(enrollment::Column::CourseId.eq(course_id))
            .one(&*self.db)
            .await?)
    }

    async fn insert(&self, model: enrollment::Model) -> Result<enrollment::Model, ServiceError> {
        model
            .into_active_model()
            .insert(&*self.db)
            .await
            .map_err(|e| conflict_or_db(e, "Enrollment"))
    }
}

#[derive(Clone)]
pub struct SeaOrmPaymentRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmPaymentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PaymentRepository for SeaOrmPaymentRepository {
    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .one(&*self.db)
            .await?)
    }

    async fn save(&self, model: payment::Model) -> Result<payment::Model, ServiceError> {
        let exists = payment::Entity::find_by_id(model.id)
            .one(&*self.db)
            .await?
            .is_some();

        let mut active = model.into_active_model();
        if exists {
            active = active.reset_all();
            Ok(active.update(&*self.db).await?)
        } else {
            active
                .insert(&*self.db)
                .await
                .map_err(|e| conflict_or_db(e, "Payment"))
        }
    }

    #[instrument(skip(self, metadata))]
    async fn mark_completed(
        &self,
        transaction_id: &str,
        metadata: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let result = payment::Entity::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(payment::PaymentStatus::Completed),
            )
            .col_expr(payment::Column::Metadata, Expr::value(metadata))
            .col_expr(payment::Column::UpdatedAt, Expr::value(completed_at))
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .filter(payment::Column::Status.ne(payment::PaymentStatus::Completed))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn insert_order_detail(
        &self,
        model: order_detail::Model,
    ) -> Result<order_detail::Model, ServiceError> {
        model
            .into_active_model()
            .insert(&*self.db)
            .await
            .map_err(|e| conflict_or_db(e, "Order detail"))
    }

    async fn find_order_details(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<order_detail::Model>, ServiceError> {
        Ok(order_detail::Entity::find()
            .filter(order_detail::Column::PaymentId.eq(payment_id))
            .all(&*self.db)
            .await?)
    }
}

#[derive(Clone)]
pub struct SeaOrmTemporaryPaymentRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmTemporaryPaymentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TemporaryPaymentRepository for SeaOrmTemporaryPaymentRepository {
    async fn save(&self, model: temporary_payment::Model) -> Result<(), ServiceError> {
        let existing = self.find_by_payment_id(&model.payment_id).await?;

        match existing {
            Some(existing) => {
                let mut active: temporary_payment::ActiveModel = existing.into();
                active.order_id = Set(model.order_id);
                active.user_id = Set(model.user_id);
                active.payment_data = Set(model.payment_data);
                active.expires_at = Set(model.expires_at);
                active.update(&*self.db).await?;
            }
            None => {
                model.into_active_model().insert(&*self.db).await?;
            }
        }
        Ok(())
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<temporary_payment::Model>, ServiceError> {
        Ok(temporary_payment::Entity::find()
            .filter(temporary_payment::Column::PaymentId.eq(payment_id))
            .one(&*self.db)
            .await?)
    }

    async fn delete_by_payment_id(&self, payment_id: &str) -> Result<bool, ServiceError> {
        let result = temporary_payment::Entity::delete_many()
            .filter(temporary_payment::Column::PaymentId.eq(payment_id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[derive(Clone)]
pub struct SeaOrmCartRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmCartRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn find_cart(&self, user_id: Uuid) -> Result<Option<cart::Model>, DbErr> {
        cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
    }
}

#[async_trait]
impl CartRepository for SeaOrmCartRepository {
    #[instrument(skip(self))]
    async fn add_course(&self, user_id: Uuid, course_id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        let cart = match self.find_cart(user_id).await? {
            Some(cart) => cart,
            None => {
                cart::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?
            }
        };

        let already_there = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::CourseId.eq(course_id))
            .one(&*self.db)
            .await?
            .is_some();
        if already_there {
            return Ok(());
        }

        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            course_id: Set(course_id),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_courses(
        &self,
        user_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<u64, ServiceError> {
        let Some(cart) = self.find_cart(user_id).await? else {
            return Ok(0);
        };
        if course_ids.is_empty() {
            return Ok(0);
        }

        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::CourseId.is_in(course_ids.iter().copied()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn course_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let Some(cart) = self.find_cart(user_id).await? else {
            return Ok(Vec::new());
        };
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(items.into_iter().map(|item| item.course_id).collect())
    }
}
