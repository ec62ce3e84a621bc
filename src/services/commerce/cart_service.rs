use crate::{
    cache::CacheStore,
    entities::course,
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{CartRepository, CourseRepository, EnrollmentRepository},
    services::commerce::voucher_service::{DiscountedCourse, VoucherService},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

fn items_key(user_id: Uuid) -> String {
    format!("cart:{}", user_id)
}

fn selected_key(user_id: Uuid) -> String {
    format!("selected_cart:{}", user_id)
}

fn voucher_key(user_id: Uuid) -> String {
    format!("cart:{}:voucher", user_id)
}

fn view_key(user_id: Uuid) -> String {
    format!("cart:{}:view", user_id)
}

/// Snapshot of the voucher currently applied to a cart. Derived data:
/// rebuilt whenever the cart's membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedVoucher {
    pub code: String,
    pub voucher_id: Uuid,
    pub discounted_courses: Vec<DiscountedCourse>,
}

impl AppliedVoucher {
    fn discount_for(&self, course_id: Uuid) -> Decimal {
        self.discounted_courses
            .iter()
            .find(|c| c.course_id == course_id)
            .map(|c| c.discount_amount)
            .unwrap_or(Decimal::ZERO)
    }

    fn retain_courses(&mut self, course_ids: &[Uuid]) {
        self.discounted_courses
            .retain(|c| course_ids.contains(&c.course_id));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemView {
    pub course_id: Uuid,
    pub title: String,
    pub original_price: Decimal,
    pub discount_amount: Decimal,
    pub final_price: Decimal,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSummary {
    pub items: Vec<CartItemView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher_id: Option<Uuid>,
    pub total_original_price: Decimal,
    pub total_discount: Decimal,
    pub total_final_price: Decimal,
}

impl CartSummary {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn course_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|item| item.course_id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemStatusUpdate {
    pub course_id: Uuid,
    pub selected: bool,
}

/// Per-user cart held in the cache store.
///
/// Three keys per user: the course list (`cart:{user}`), the selected
/// subset (`selected_cart:{user}`) and the applied voucher snapshot
/// (`cart:{user}:voucher`). A rendered summary is cached under
/// `cart:{user}:view` and dropped on every mutation.
///
/// Read-modify-write cycles are not locked; two concurrent mutations for
/// the same user can lose one of the updates.
#[derive(Clone)]
pub struct CartService {
    cache: CacheStore,
    courses: Arc<dyn CourseRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    durable_carts: Arc<dyn CartRepository>,
    vouchers: Arc<VoucherService>,
    event_sender: Arc<EventSender>,
    cart_ttl: Duration,
    view_ttl: Duration,
}

impl CartService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: CacheStore,
        courses: Arc<dyn CourseRepository>,
        enrollments: Arc<dyn EnrollmentRepository>,
        durable_carts: Arc<dyn CartRepository>,
        vouchers: Arc<VoucherService>,
        event_sender: Arc<EventSender>,
        cart_ttl: Duration,
        view_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            courses,
            enrollments,
            durable_carts,
            vouchers,
            event_sender,
            cart_ttl,
            view_ttl,
        }
    }

    /// Adds a course and re-selects the best voucher for the new item set.
    #[instrument(skip(self))]
    pub async fn add_to_cart(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> Result<CartSummary, ServiceError> {
        if self.courses.find_by_id(course_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!(
                "Course {} not found",
                course_id
            )));
        }

        if self.enrollments.find(user_id, course_id).await?.is_some() {
            return Err(ServiceError::Conflict(
                "Already enrolled in this course".to_string(),
            ));
        }

        let mut items = self.load_items(user_id).await?;
        if items.contains(&course_id) {
            return Err(ServiceError::Conflict(
                "Course is already in the cart".to_string(),
            ));
        }
        items.push(course_id);
        self.save_items(user_id, &items).await?;

        if let Err(e) = self.durable_carts.add_course(user_id, course_id).await {
            warn!(%user_id, %course_id, error = %e, "Failed to mirror cart item to database");
        }

        self.cache.del(&voucher_key(user_id)).await?;
        self.refresh_best_voucher(user_id).await;
        self.invalidate_view(user_id).await;

        self.event_sender
            .send_or_log(Event::CartItemAdded { user_id, course_id })
            .await;

        info!(%user_id, %course_id, "Added course to cart");
        self.get_cart(user_id).await
    }

    /// Removes a course from the cart and the selection, then re-selects the
    /// best voucher for whatever remains.
    #[instrument(skip(self))]
    pub async fn remove_from_cart(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> Result<CartSummary, ServiceError> {
        let mut items = self.load_items(user_id).await?;
        if !items.contains(&course_id) {
            return Err(ServiceError::NotFound(
                "Course is not in the cart".to_string(),
            ));
        }
        items.retain(|id| *id != course_id);
        self.save_items(user_id, &items).await?;

        let mut selected = self.load_selected(user_id).await?;
        if selected.contains(&course_id) {
            selected.retain(|id| *id != course_id);
            self.save_selected(user_id, &selected).await?;
        }

        if let Err(e) = self
            .durable_carts
            .remove_courses(user_id, &[course_id])
            .await
        {
            warn!(%user_id, %course_id, error = %e, "Failed to remove cart item from database");
        }

        self.cache.del(&voucher_key(user_id)).await?;
        if !items.is_empty() {
            self.refresh_best_voucher(user_id).await;
        }
        self.invalidate_view(user_id).await;

        self.event_sender
            .send_or_log(Event::CartItemRemoved { user_id, course_id })
            .await;

        self.get_cart(user_id).await
    }

    /// Replaces the selection. Every id must already be in the cart.
    #[instrument(skip(self))]
    pub async fn select_cart_items(
        &self,
        user_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, ServiceError> {
        let items = self.load_items(user_id).await?;
        ensure_members(&items, course_ids.iter().copied())?;

        let mut selected: Vec<Uuid> = Vec::with_capacity(course_ids.len());
        for id in course_ids {
            if !selected.contains(id) {
                selected.push(*id);
            }
        }

        self.save_selected(user_id, &selected).await?;
        self.invalidate_view(user_id).await;
        Ok(selected)
    }

    /// Toggles selection per item. Validated as a whole before any change.
    #[instrument(skip(self, updates))]
    pub async fn update_cart_item_status(
        &self,
        user_id: Uuid,
        updates: &[CartItemStatusUpdate],
    ) -> Result<Vec<Uuid>, ServiceError> {
        let items = self.load_items(user_id).await?;
        ensure_members(&items, updates.iter().map(|u| u.course_id))?;

        let mut selected = self.load_selected(user_id).await?;
        for update in updates {
            let present = selected.contains(&update.course_id);
            if update.selected && !present {
                selected.push(update.course_id);
            } else if !update.selected && present {
                selected.retain(|id| *id != update.course_id);
            }
        }

        self.save_selected(user_id, &selected).await?;
        self.invalidate_view(user_id).await;
        Ok(selected)
    }

    /// Full cart with prices recomputed against current course prices.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartSummary, ServiceError> {
        match self.cache.get::<CartSummary>(&view_key(user_id)).await {
            Ok(Some(view)) => {
                if self.view_is_current(&view).await? {
                    return Ok(view);
                }
                debug!(%user_id, "Cached cart view has outdated course prices");
            }
            Ok(None) => {}
            Err(e) => warn!(%user_id, error = %e, "Ignoring unreadable cart view"),
        }

        let items = self.load_items(user_id).await?;
        let summary = self.summarize(user_id, &items).await?;

        if let Err(e) = self
            .cache
            .set(&view_key(user_id), &summary, Some(self.view_ttl))
            .await
        {
            warn!(%user_id, error = %e, "Failed to cache cart view");
        }
        Ok(summary)
    }

    /// Same as [`get_cart`](Self::get_cart) restricted to the selection.
    #[instrument(skip(self))]
    pub async fn get_selected_cart_items(&self, user_id: Uuid) -> Result<CartSummary, ServiceError> {
        let items = self.load_items(user_id).await?;
        let selected = self.load_selected(user_id).await?;
        let chosen: Vec<Uuid> = items
            .into_iter()
            .filter(|id| selected.contains(id))
            .collect();
        self.summarize(user_id, &chosen).await
    }

    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid) -> Result<(), ServiceError> {
        for key in [
            items_key(user_id),
            selected_key(user_id),
            voucher_key(user_id),
            view_key(user_id),
        ] {
            self.cache.del(&key).await?;
        }

        self.event_sender
            .send_or_log(Event::CartCleared { user_id })
            .await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn clear_selected_cart_items(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.cache.del(&selected_key(user_id)).await?;
        self.invalidate_view(user_id).await;
        Ok(())
    }

    /// Drops purchased courses from the database cart and the cached cart.
    /// Either copy may be missing. The voucher snapshot is always cleared.
    #[instrument(skip(self))]
    pub async fn remove_courses_from_database_cart(
        &self,
        user_id: Uuid,
        course_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        let removed = self.durable_carts.remove_courses(user_id, course_ids).await?;

        let mut items = self.load_items(user_id).await?;
        let before = items.len();
        items.retain(|id| !course_ids.contains(id));
        if items.len() != before {
            self.save_items(user_id, &items).await?;
        }

        let mut selected = self.load_selected(user_id).await?;
        let before = selected.len();
        selected.retain(|id| !course_ids.contains(id));
        if selected.len() != before {
            self.save_selected(user_id, &selected).await?;
        }

        self.cache.del(&voucher_key(user_id)).await?;
        self.invalidate_view(user_id).await;

        info!(%user_id, durable_rows = removed, "Removed purchased courses from cart");
        Ok(())
    }

    /// Applies `code` to the whole cart and stores the snapshot.
    #[instrument(skip(self))]
    pub async fn apply_voucher_to_cart(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<CartSummary, ServiceError> {
        let items = self.load_items(user_id).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let application = self.vouchers.apply_voucher(user_id, code, &items).await?;
        let snapshot = AppliedVoucher {
            code: application.voucher.code.clone(),
            voucher_id: application.voucher.id,
            discounted_courses: application.discounted_courses,
        };
        self.save_voucher(user_id, &snapshot).await?;
        self.invalidate_view(user_id).await;

        self.event_sender
            .send_or_log(Event::VoucherApplied {
                user_id,
                voucher_id: snapshot.voucher_id,
                total_discount: application.total_discount,
            })
            .await;

        self.get_cart(user_id).await
    }

    /// Picks the active voucher with the largest total discount for the
    /// current cart and stores it; clears the snapshot if none helps.
    #[instrument(skip(self))]
    pub async fn apply_best_voucher_automatically(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AppliedVoucher>, ServiceError> {
        let items = self.load_items(user_id).await?;
        if items.is_empty() {
            self.cache.del(&voucher_key(user_id)).await?;
            return Ok(None);
        }

        let candidates = self.vouchers.list_active().await?;
        let best = self.vouchers.find_best_voucher(&candidates, &items).await?;

        match best {
            Some(application) => {
                let snapshot = AppliedVoucher {
                    code: application.voucher.code.clone(),
                    voucher_id: application.voucher.id,
                    discounted_courses: application.discounted_courses,
                };
                self.save_voucher(user_id, &snapshot).await?;
                info!(%user_id, code = %snapshot.code, "Applied best voucher");
                Ok(Some(snapshot))
            }
            None => {
                self.cache.del(&voucher_key(user_id)).await?;
                Ok(None)
            }
        }
    }

    pub async fn applied_voucher(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AppliedVoucher>, ServiceError> {
        Ok(self.cache.get(&voucher_key(user_id)).await?)
    }

    pub async fn cart_course_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        self.load_items(user_id).await
    }

    /// A cached view is served only while every course still has the
    /// price and title it was rendered with.
    async fn view_is_current(&self, view: &CartSummary) -> Result<bool, ServiceError> {
        let courses = self.courses.find_by_ids(&view.course_ids()).await?;
        Ok(view.items.iter().all(|item| {
            courses.iter().any(|c| {
                c.id == item.course_id && c.price == item.original_price && c.title == item.title
            })
        }))
    }

    async fn refresh_best_voucher(&self, user_id: Uuid) {
        if let Err(e) = self.apply_best_voucher_automatically(user_id).await {
            warn!(%user_id, error = %e, "Automatic voucher selection failed");
        }
    }

    async fn summarize(&self, user_id: Uuid, course_ids: &[Uuid]) -> Result<CartSummary, ServiceError> {
        let selected = self.load_selected(user_id).await?;
        let voucher = self.applied_voucher(user_id).await?.map(|mut v| {
            v.retain_courses(course_ids);
            v
        });
        let courses = self.courses.find_by_ids(course_ids).await?;

        let mut items = Vec::with_capacity(course_ids.len());
        for id in course_ids {
            let Some(course) = courses.iter().find(|c| c.id == *id) else {
                warn!(%user_id, course_id = %id, "Cart references unknown course");
                continue;
            };
            items.push(price_item(course, voucher.as_ref(), selected.contains(id)));
        }

        let total_original_price = items.iter().map(|i| i.original_price).sum();
        let total_discount = items.iter().map(|i| i.discount_amount).sum();
        let total_final_price = items.iter().map(|i| i.final_price).sum();

        let voucher = voucher.filter(|v| !v.discounted_courses.is_empty());
        Ok(CartSummary {
            items,
            voucher_code: voucher.as_ref().map(|v| v.code.clone()),
            voucher_id: voucher.as_ref().map(|v| v.voucher_id),
            total_original_price,
            total_discount,
            total_final_price,
        })
    }

    async fn load_items(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self
            .cache
            .get::<Vec<Uuid>>(&items_key(user_id))
            .await?
            .unwrap_or_default())
    }

    async fn load_selected(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self
            .cache
            .get::<Vec<Uuid>>(&selected_key(user_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_items(&self, user_id: Uuid, items: &[Uuid]) -> Result<(), ServiceError> {
        Ok(self
            .cache
            .set(&items_key(user_id), items, Some(self.cart_ttl))
            .await?)
    }

    async fn save_selected(&self, user_id: Uuid, selected: &[Uuid]) -> Result<(), ServiceError> {
        Ok(self
            .cache
            .set(&selected_key(user_id), selected, Some(self.cart_ttl))
            .await?)
    }

    async fn save_voucher(
        &self,
        user_id: Uuid,
        voucher: &AppliedVoucher,
    ) -> Result<(), ServiceError> {
        Ok(self
            .cache
            .set(&voucher_key(user_id), voucher, Some(self.cart_ttl))
            .await?)
    }

    async fn invalidate_view(&self, user_id: Uuid) {
        if let Err(e) = self.cache.del(&view_key(user_id)).await {
            warn!(%user_id, error = %e, "Failed to drop cached cart view");
        }
    }
}

fn ensure_members(
    items: &[Uuid],
    requested: impl Iterator<Item = Uuid>,
) -> Result<(), ServiceError> {
    let invalid: Vec<String> = requested
        .filter(|id| !items.contains(id))
        .map(|id| id.to_string())
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(format!(
            "Invalid selection, courses not in cart: {}",
            invalid.join(", ")
        )))
    }
}

fn price_item(course: &course::Model, voucher: Option<&AppliedVoucher>, selected: bool) -> CartItemView {
    let discount_amount = voucher
        .map(|v| v.discount_for(course.id))
        .unwrap_or(Decimal::ZERO)
        .min(course.price)
        .max(Decimal::ZERO);
    CartItemView {
        course_id: course.id,
        title: course.title.clone(),
        original_price: course.price,
        discount_amount,
        final_price: course.price - discount_amount,
        selected,
    }
}
