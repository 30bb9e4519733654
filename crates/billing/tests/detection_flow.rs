//! Integration tests for the mismatch detection and correction flow
//!
//! These run against a real Postgres database with the workspace migrations
//! applied, and are therefore ignored by default.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/meterpay_test"
//! cargo test -p meterpay-billing -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use meterpay_billing::{run_sweep, MismatchDetector, SweepOptions};
use meterpay_shared::BillingCorrection;
use serde_json::json;
use sqlx::PgPool;
use time::Duration;
use uuid::Uuid;

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    meterpay_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Create a feature priced at `cost` and return its key.
async fn create_feature(pool: &PgPool, cost: i64) -> String {
    let key = format!("test-feature-{}", Uuid::new_v4());
    let feature_id = Uuid::new_v4();
    sqlx::query("INSERT INTO feature_items (id, item_key, item_name, is_active) VALUES ($1, $2, 'Test Feature', TRUE)")
        .bind(feature_id)
        .bind(&key)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO package_feature_settings (package_key, feature_id, cost_per_use) VALUES ('test-pkg', $1, $2)",
    )
    .bind(feature_id)
    .bind(cost)
    .execute(pool)
    .await
    .unwrap();
    key
}

async fn create_account(pool: &PgPool, total: i64, used: i64) -> Uuid {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO user_accounts (user_id, total_quota, used_quota) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(total)
        .bind(used)
        .execute(pool)
        .await
        .unwrap();
    user_id
}

async fn create_usage(pool: &PgPool, user_id: Uuid, feature_key: &str, amount: i64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO usage_records (id, user_id, record_type, amount, metadata) VALUES ($1, $2, 'conversation', $3, $4)",
    )
    .bind(id)
    .bind(user_id)
    .bind(amount)
    .bind(json!({"feature_key": feature_key, "cost_source": "package_settings"}))
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn used_quota(pool: &PgPool, user_id: Uuid) -> i64 {
    let (used,): (i64,) = sqlx::query_as("SELECT used_quota FROM user_accounts WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap();
    used
}

#[tokio::test]
#[ignore] // Requires database
async fn rerunning_detection_creates_no_duplicate_alerts() {
    let pool = setup_pool().await;
    let feature = create_feature(&pool, 10).await;
    let user_id = create_account(&pool, 100, 0).await;
    create_usage(&pool, user_id, &feature, 7).await;

    let detector = MismatchDetector::new(pool.clone());
    let first = detector.detect(Duration::hours(24)).await.unwrap();
    assert_eq!(first.new_alerts, 1);

    let second = detector.detect(Duration::hours(24)).await.unwrap();
    assert_eq!(second.new_alerts, 0, "second pass must not re-flag");
}

#[tokio::test]
#[ignore] // Requires database
async fn charge_correction_increases_used_quota() {
    let pool = setup_pool().await;
    let feature = create_feature(&pool, 10).await;
    let user_id = create_account(&pool, 100, 20).await;
    create_usage(&pool, user_id, &feature, 7).await; // undercharged by 3

    let summary = run_sweep(&pool, Duration::hours(24), SweepOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.corrections_successful, 1);
    assert_eq!(used_quota(&pool, user_id).await, 23);

    let correction: BillingCorrection = sqlx::query_as(
        "SELECT id, user_id, alert_id, correction_type, original_amount, expected_amount,
                correction_amount, status, error_message, created_at, completed_at
         FROM billing_corrections WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(correction.correction_type, "charge");
    assert_eq!(correction.correction_amount, 3);
    assert_eq!(correction.status, "completed");
    assert!(correction.completed_at.is_some());
}

#[tokio::test]
#[ignore] // Requires database
async fn refund_correction_floors_used_quota_at_zero() {
    let pool = setup_pool().await;
    let feature = create_feature(&pool, 10).await;
    let user_id = create_account(&pool, 100, 2).await;
    create_usage(&pool, user_id, &feature, 15).await; // overcharged by 5

    let summary = run_sweep(&pool, Duration::hours(24), SweepOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.corrections_successful, 1);
    assert_eq!(used_quota(&pool, user_id).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn dry_run_reports_intent_without_mutating() {
    let pool = setup_pool().await;
    let feature = create_feature(&pool, 10).await;
    let user_id = create_account(&pool, 100, 20).await;
    create_usage(&pool, user_id, &feature, 7).await;

    let options = SweepOptions {
        auto_correct: true,
        dry_run: true,
    };
    let summary = run_sweep(&pool, Duration::hours(24), options).await.unwrap();
    assert_eq!(summary.corrections_attempted, 1);
    assert_eq!(summary.corrections_successful, 0);
    assert_eq!(summary.pending_corrections, 1, "alert must stay pending");
    assert_eq!(used_quota(&pool, user_id).await, 20, "ledger untouched");

    let (corrections,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_corrections WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(corrections, 0, "no correction rows in dry run");
}

#[tokio::test]
#[ignore] // Requires database
async fn exempt_records_are_never_flagged() {
    let pool = setup_pool().await;
    let feature = create_feature(&pool, 10).await;
    let user_id = create_account(&pool, 100, 0).await;

    sqlx::query(
        "INSERT INTO usage_records (user_id, record_type, amount, metadata) VALUES ($1, 'conversation', 99, $2)",
    )
    .bind(user_id)
    .bind(json!({"feature_key": feature, "free_quota_used": true}))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO usage_records (user_id, record_type, amount, metadata) VALUES ($1, 'conversation', 99, $2)",
    )
    .bind(user_id)
    .bind(json!({"feature_key": feature, "cost_source": "explicit_amount"}))
    .execute(&pool)
    .await
    .unwrap();

    let detector = MismatchDetector::new(pool.clone());
    let report = detector.detect(Duration::hours(24)).await.unwrap();
    let (alerts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cost_alerts WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(alerts, 0);
    assert!(report.checked_records >= 2);
}

#[tokio::test]
#[ignore] // Requires database
async fn one_bad_alert_does_not_abort_the_batch() {
    let pool = setup_pool().await;
    let feature = create_feature(&pool, 10).await;

    // Mismatch for a user with no account row; its correction will fail.
    let ghost_user = Uuid::new_v4();
    create_usage(&pool, ghost_user, &feature, 7).await;

    let user_id = create_account(&pool, 100, 0).await;

    // Already-consistent alert that only needs the skipped mark.
    let consistent_usage = create_usage(&pool, user_id, &feature, 10).await;
    sqlx::query(
        "INSERT INTO cost_alerts (user_id, alert_type, usage_record_id, expected_amount, actual_amount)
         VALUES ($1, 'billing_mismatch', $2, 10, 10)",
    )
    .bind(user_id)
    .bind(consistent_usage)
    .execute(&pool)
    .await
    .unwrap();

    // Real mismatch that must still be corrected after the failure.
    create_usage(&pool, user_id, &feature, 7).await;

    let summary = run_sweep(&pool, Duration::hours(24), SweepOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.corrections_failed, 1);
    assert_eq!(summary.corrections_successful, 1);
    assert_eq!(used_quota(&pool, user_id).await, 3);

    let (status,): (String,) = sqlx::query_as(
        "SELECT correction_status FROM cost_alerts WHERE usage_record_id = $1",
    )
    .bind(consistent_usage)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "skipped");
}
