//! sea-orm repositories against a migrated in-memory SQLite database.

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use course_market::{
    entities::{
        course, enrollment, order_detail,
        payment::{self, PaymentStatus},
        temporary_payment,
        voucher::{self, CreatorRole, DiscountType, VoucherScope},
        voucher_course,
    },
    errors::ServiceError,
    migrator::Migrator,
    repositories::{
        CartRepository, CourseRepository, EnrollmentRepository, PaymentRepository,
        RepositorySet, TemporaryPaymentRepository, VoucherRepository,
    },
};
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter,
};
use sea_orm_migration::MigratorTrait;
use serde_json::json;
use uuid::Uuid;

async fn setup() -> (Arc<DatabaseConnection>, RepositorySet) {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .expect("failed to open test database");
    Migrator::up(&db, None).await.expect("migrations apply");

    let db = Arc::new(db);
    let repos = RepositorySet::sea_orm(db.clone());
    (db, repos)
}

async fn seed_course(db: &DatabaseConnection, title: &str) -> course::Model {
    course::Model {
        id: Uuid::new_v4(),
        title: title.to_string(),
        price: dec!(250000),
        instructor_id: Uuid::new_v4(),
        category_id: None,
        created_at: Utc::now(),
    }
    .into_active_model()
    .insert(db)
    .await
    .expect("insert course")
}

async fn seed_voucher(
    db: &DatabaseConnection,
    code: &str,
    is_active: bool,
    end_offset: Duration,
) -> voucher::Model {
    let now = Utc::now();
    voucher::Model {
        id: Uuid::new_v4(),
        code: code.to_string(),
        scope: VoucherScope::SpecificCourses,
        discount_type: DiscountType::Fixed,
        discount_value: dec!(20000),
        max_discount: None,
        category_id: None,
        start_date: now - Duration::days(2),
        end_date: now + end_offset,
        is_active,
        max_usage: Some(10),
        usage_count: 0,
        creator_id: Uuid::new_v4(),
        creator_role: CreatorRole::Instructor,
        created_at: now,
    }
    .into_active_model()
    .insert(db)
    .await
    .expect("insert voucher")
}

fn payment_model(transaction_id: &str) -> payment::Model {
    let now = Utc::now();
    payment::Model {
        id: Uuid::new_v4(),
        order_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        amount: dec!(250000),
        currency: "VND".to_string(),
        amount_usd: Some(dec!(10)),
        exchange_rate: Some(dec!(0.00004)),
        status: PaymentStatus::Pending,
        transaction_id: transaction_id.to_string(),
        metadata: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn migrations_roll_back_and_reapply_on_sqlite() {
    let (db, repos) = setup().await;
    Migrator::down(&*db, None).await.expect("rollback");
    Migrator::up(&*db, None).await.expect("reapply");

    let course = course::Model {
        id: Uuid::new_v4(),
        title: "Pinning and Unpin".to_string(),
        price: dec!(199999.5),
        instructor_id: Uuid::new_v4(),
        category_id: None,
        created_at: Utc::now(),
    }
    .into_active_model()
    .insert(&*db)
    .await
    .expect("insert course");

    let found = repos.courses.find_by_id(course.id).await.unwrap().unwrap();
    assert_eq!(found.price, dec!(199999.5));
}

#[tokio::test]
async fn courses_are_found_by_id_and_unknown_ids_skipped() {
    let (db, repos) = setup().await;
    let a = seed_course(&db, "Ownership in Depth").await;
    let b = seed_course(&db, "Tokio Internals").await;

    let found = repos.courses.find_by_id(a.id).await.unwrap().unwrap();
    assert_eq!(found.title, "Ownership in Depth");
    assert_eq!(found.price, dec!(250000));

    let mut ids: Vec<Uuid> = repos
        .courses
        .find_by_ids(&[a.id, Uuid::new_v4(), b.id])
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);

    assert!(repos.courses.find_by_ids(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn only_active_vouchers_inside_their_window_are_listed() {
    let (db, repos) = setup().await;
    let live = seed_voucher(&db, "LIVE", true, Duration::days(3)).await;
    seed_voucher(&db, "OFF", false, Duration::days(3)).await;
    seed_voucher(&db, "OLD", true, Duration::days(-1)).await;

    let active = repos.vouchers.list_active(Utc::now()).await.unwrap();
    let codes: Vec<&str> = active.iter().map(|v| v.code.as_str()).collect();
    assert_eq!(codes, vec!["LIVE"]);

    let by_code = repos.vouchers.find_by_code("LIVE").await.unwrap().unwrap();
    assert_eq!(by_code.id, live.id);
    assert!(repos.vouchers.find_by_code("MISSING").await.unwrap().is_none());
}

#[tokio::test]
async fn usage_is_counted_on_voucher_and_bound_courses() {
    let (db, repos) = setup().await;
    let voucher = seed_voucher(&db, "BUNDLE", true, Duration::days(3)).await;
    let paid = seed_course(&db, "Paid Course").await;
    let other = seed_course(&db, "Other Course").await;

    for course_id in [paid.id, other.id] {
        voucher_course::Model {
            id: Uuid::new_v4(),
            voucher_id: voucher.id,
            course_id,
            discount_amount: dec!(20000),
            usage_count: 0,
        }
        .into_active_model()
        .insert(&*db)
        .await
        .expect("bind course");
    }

    let mut bound = repos.vouchers.course_ids(voucher.id).await.unwrap();
    bound.sort();
    let mut expected = vec![paid.id, other.id];
    expected.sort();
    assert_eq!(bound, expected);

    repos
        .vouchers
        .increment_usage(voucher.id, &[paid.id])
        .await
        .unwrap();

    let reloaded = voucher::Entity::find_by_id(voucher.id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.usage_count, 1);

    let rows = voucher_course::Entity::find()
        .filter(voucher_course::Column::VoucherId.eq(voucher.id))
        .all(&*db)
        .await
        .unwrap();
    for row in rows {
        let expected = if row.course_id == paid.id { 1 } else { 0 };
        assert_eq!(row.usage_count, expected, "course {}", row.course_id);
    }
}

#[tokio::test]
async fn duplicate_enrollment_is_a_conflict() {
    let (db, repos) = setup().await;
    let course = seed_course(&db, "Macros").await;
    let user_id = Uuid::new_v4();

    let enrollment = enrollment::Model {
        id: Uuid::new_v4(),
        user_id,
        course_id: course.id,
        payment_id: None,
        enrolled_at: Utc::now(),
    };
    repos.enrollments.insert(enrollment.clone()).await.unwrap();

    let found = repos
        .enrollments
        .find(user_id, course.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, enrollment.id);

    let again = repos
        .enrollments
        .insert(enrollment::Model {
            id: Uuid::new_v4(),
            ..enrollment
        })
        .await;
    assert_matches!(again, Err(ServiceError::Conflict(_)));
}

#[tokio::test]
async fn payment_save_inserts_then_updates() {
    let (_db, repos) = setup().await;
    let model = payment_model("5O190127TN364715T");

    repos.payments.save(model.clone()).await.unwrap();
    let stored = repos
        .payments
        .find_by_transaction_id("5O190127TN364715T")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);

    let completed = payment::Model {
        status: PaymentStatus::Completed,
        metadata: Some(json!({ "capture": { "status": "COMPLETED" } })),
        updated_at: Utc::now(),
        ..model
    };
    repos.payments.save(completed).await.unwrap();

    let stored = repos
        .payments
        .find_by_transaction_id("5O190127TN364715T")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
    assert_eq!(
        stored.metadata.unwrap()["capture"]["status"],
        "COMPLETED"
    );
    assert!(repos
        .payments
        .find_by_transaction_id("UNKNOWN")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn completion_flips_a_payment_only_once() {
    let (_db, repos) = setup().await;
    repos
        .payments
        .save(payment_model("3CD45678EF901234G"))
        .await
        .unwrap();

    let first = repos
        .payments
        .mark_completed(
            "3CD45678EF901234G",
            json!({ "status": "COMPLETED" }),
            Utc::now(),
        )
        .await
        .unwrap();
    let second = repos
        .payments
        .mark_completed(
            "3CD45678EF901234G",
            json!({ "status": "COMPLETED", "replay": true }),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(first);
    assert!(!second);

    let stored = repos
        .payments
        .find_by_transaction_id("3CD45678EF901234G")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
    assert!(stored.metadata.unwrap().get("replay").is_none());

    assert!(!repos
        .payments
        .mark_completed("UNKNOWN", json!({}), Utc::now())
        .await
        .unwrap());
}

#[tokio::test]
async fn order_detail_is_unique_per_payment_and_course() {
    let (_db, repos) = setup().await;
    let payment = repos
        .payments
        .save(payment_model("9AB12345CD678901E"))
        .await
        .unwrap();
    let course_id = Uuid::new_v4();

    let detail = order_detail::Model {
        id: Uuid::new_v4(),
        payment_id: payment.id,
        course_id,
        price: dec!(250000),
        discount: dec!(20000),
        final_price: dec!(230000),
        created_at: Utc::now(),
    };
    repos.payments.insert_order_detail(detail.clone()).await.unwrap();

    let duplicate = repos
        .payments
        .insert_order_detail(order_detail::Model {
            id: Uuid::new_v4(),
            ..detail
        })
        .await;
    assert_matches!(duplicate, Err(ServiceError::Conflict(_)));

    let details = repos.payments.find_order_details(payment.id).await.unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].final_price, dec!(230000));
}

#[tokio::test]
async fn temporary_payment_is_upserted_by_gateway_id() {
    let (_db, repos) = setup().await;
    let now = Utc::now();
    let snapshot = temporary_payment::Model {
        id: Uuid::new_v4(),
        payment_id: "7XY98765ZW432109A".to_string(),
        order_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        payment_data: json!({ "version": 1 }),
        expires_at: now + Duration::hours(24),
        created_at: now,
    };

    repos
        .temporary_payments
        .save(snapshot.clone())
        .await
        .unwrap();
    repos
        .temporary_payments
        .save(temporary_payment::Model {
            id: Uuid::new_v4(),
            payment_data: json!({ "version": 2 }),
            ..snapshot.clone()
        })
        .await
        .unwrap();

    let stored = repos
        .temporary_payments
        .find_by_payment_id(&snapshot.payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, snapshot.id);
    assert_eq!(stored.payment_data["version"], 2);

    assert!(repos
        .temporary_payments
        .delete_by_payment_id(&snapshot.payment_id)
        .await
        .unwrap());
    assert!(!repos
        .temporary_payments
        .delete_by_payment_id(&snapshot.payment_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn durable_cart_mirrors_adds_and_removals() {
    let (_db, repos) = setup().await;
    let user_id = Uuid::new_v4();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    assert_eq!(repos.carts.remove_courses(user_id, &[a]).await.unwrap(), 0);

    repos.carts.add_course(user_id, a).await.unwrap();
    repos.carts.add_course(user_id, b).await.unwrap();
    repos.carts.add_course(user_id, a).await.unwrap();
    repos.carts.add_course(user_id, c).await.unwrap();

    let mut ids = repos.carts.course_ids(user_id).await.unwrap();
    assert_eq!(ids.len(), 3);

    let removed = repos.carts.remove_courses(user_id, &[a, c]).await.unwrap();
    assert_eq!(removed, 2);
    ids = repos.carts.course_ids(user_id).await.unwrap();
    assert_eq!(ids, vec![b]);

    assert!(repos
        .carts
        .course_ids(Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
}
