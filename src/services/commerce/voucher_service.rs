use crate::{
    entities::{
        course,
        voucher::{self, CreatorRole, DiscountType, VoucherScope},
    },
    errors::ServiceError,
    repositories::{CourseRepository, VoucherRepository},
};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Reasons a voucher cannot be applied. None of these are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoucherError {
    #[error("Voucher {0} not found")]
    NotFound(String),
    #[error("Voucher is not active")]
    Inactive,
    #[error("Voucher has expired")]
    Expired,
    #[error("Voucher is not valid yet")]
    NotYetValid,
    #[error("Voucher usage limit reached")]
    UsageExceeded,
    #[error("Voucher does not apply to any of the selected courses")]
    NotApplicable,
}

/// Per-course result of applying a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountedCourse {
    pub course_id: Uuid,
    pub original_price: Decimal,
    pub discount_amount: Decimal,
    pub final_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoucherApplication {
    pub voucher: voucher::Model,
    pub discounted_courses: Vec<DiscountedCourse>,
    pub total_discount: Decimal,
    pub total_final_price: Decimal,
}

/// Discount granted by `voucher` on a course costing `price`.
///
/// Percentage discounts are capped at `max_discount`; fixed discounts never
/// exceed the price. Rounded half away from zero to 2 decimal places.
pub fn compute_discount(price: Decimal, voucher: &voucher::Model) -> Decimal {
    discount_for(
        price,
        voucher.discount_type,
        voucher.discount_value,
        voucher.max_discount,
    )
}

fn discount_for(
    price: Decimal,
    discount_type: DiscountType,
    value: Decimal,
    max_discount: Option<Decimal>,
) -> Decimal {
    if price <= Decimal::ZERO || value <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let raw = match discount_type {
        DiscountType::Percentage => {
            let pct = price * value / Decimal::ONE_HUNDRED;
            match max_discount {
                Some(cap) => pct.min(cap.max(Decimal::ZERO)),
                None => pct,
            }
        }
        DiscountType::Fixed => value.min(price),
    };

    raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Checks the activity flag, validity window and usage cap.
pub fn ensure_usable(voucher: &voucher::Model, now: DateTime<Utc>) -> Result<(), VoucherError> {
    if !voucher.is_active {
        return Err(VoucherError::Inactive);
    }
    if now < voucher.start_date {
        return Err(VoucherError::NotYetValid);
    }
    if now > voucher.end_date {
        return Err(VoucherError::Expired);
    }
    if let Some(max) = voucher.max_usage {
        if voucher.usage_count >= max {
            return Err(VoucherError::UsageExceeded);
        }
    }
    Ok(())
}

/// Voucher engine: eligibility, discount computation and best-voucher
/// selection.
#[derive(Clone)]
pub struct VoucherService {
    vouchers: Arc<dyn VoucherRepository>,
    courses: Arc<dyn CourseRepository>,
}

impl VoucherService {
    pub fn new(vouchers: Arc<dyn VoucherRepository>, courses: Arc<dyn CourseRepository>) -> Self {
        Self { vouchers, courses }
    }

    /// Narrows `candidates` to the courses `voucher` can discount.
    pub async fn resolve_applicable_courses(
        &self,
        voucher: &voucher::Model,
        candidates: &[course::Model],
    ) -> Result<Vec<course::Model>, ServiceError> {
        let applicable = match voucher.scope {
            VoucherScope::AllCourses => candidates
                .iter()
                .filter(|c| {
                    voucher.creator_role != CreatorRole::Instructor
                        || c.instructor_id == voucher.creator_id
                })
                .cloned()
                .collect(),
            VoucherScope::SpecificCourses => {
                let bound = self.vouchers.course_ids(voucher.id).await?;
                candidates
                    .iter()
                    .filter(|c| bound.contains(&c.id))
                    .cloned()
                    .collect()
            }
            VoucherScope::Category => match voucher.category_id {
                Some(category_id) => candidates
                    .iter()
                    .filter(|c| c.category_id == Some(category_id))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            },
        };
        Ok(applicable)
    }

    /// Validates `code` and computes its discount on `course_ids`.
    #[instrument(skip(self))]
    pub async fn apply_voucher(
        &self,
        user_id: Uuid,
        code: &str,
        course_ids: &[Uuid],
    ) -> Result<VoucherApplication, ServiceError> {
        let voucher = self
            .vouchers
            .find_by_code(code)
            .await?
            .ok_or_else(|| VoucherError::NotFound(code.to_string()))?;

        let courses = self.load_courses(course_ids).await?;
        self.apply_to_courses(voucher, &courses, Utc::now()).await
    }

    /// Trial-applies every candidate and keeps the one with the largest
    /// total discount. Earlier candidates win ties; failures are skipped.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn find_best_voucher(
        &self,
        candidates: &[voucher::Model],
        course_ids: &[Uuid],
    ) -> Result<Option<VoucherApplication>, ServiceError> {
        let courses = self.load_courses(course_ids).await?;
        let now = Utc::now();
        let mut best: Option<VoucherApplication> = None;

        for candidate in candidates {
            match self.apply_to_courses(candidate.clone(), &courses, now).await {
                Ok(application) if application.total_discount > Decimal::ZERO => {
                    let better = best
                        .as_ref()
                        .map(|b| application.total_discount > b.total_discount)
                        .unwrap_or(true);
                    if better {
                        best = Some(application);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(code = %candidate.code, error = %e, "Voucher skipped"),
            }
        }

        Ok(best)
    }

    pub async fn list_active(&self) -> Result<Vec<voucher::Model>, ServiceError> {
        self.vouchers.list_active(Utc::now()).await
    }

    /// Counts one redemption of `voucher_id` against `course_ids`.
    pub async fn record_usage(
        &self,
        voucher_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        self.vouchers.increment_usage(voucher_id, course_ids).await
    }

    async fn apply_to_courses(
        &self,
        voucher: voucher::Model,
        courses: &[course::Model],
        now: DateTime<Utc>,
    ) -> Result<VoucherApplication, ServiceError> {
        ensure_usable(&voucher, now)?;

        let applicable = self.resolve_applicable_courses(&voucher, courses).await?;
        if applicable.is_empty() {
            return Err(VoucherError::NotApplicable.into());
        }

        let discounted_courses: Vec<DiscountedCourse> = applicable
            .iter()
            .map(|course| {
                let discount_amount = compute_discount(course.price, &voucher);
                DiscountedCourse {
                    course_id: course.id,
                    original_price: course.price,
                    discount_amount,
                    final_price: course.price - discount_amount,
                }
            })
            .collect();

        let total_discount = discounted_courses.iter().map(|c| c.discount_amount).sum();
        let total_final_price = discounted_courses.iter().map(|c| c.final_price).sum();

        Ok(VoucherApplication {
            voucher,
            discounted_courses,
            total_discount,
            total_final_price,
        })
    }

    /// Loads courses keeping the order of `ids`.
    async fn load_courses(&self, ids: &[Uuid]) -> Result<Vec<course::Model>, ServiceError> {
        let found = self.courses.find_by_ids(ids).await?;
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|c| c.id == *id).cloned())
            .collect())
    }
}
