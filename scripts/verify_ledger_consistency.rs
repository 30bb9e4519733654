#!/usr/bin/env rust-script
//! Ledger Consistency Verification Script
//!
//! Read-only checks over the billing tables. Finds drift the automated sweep
//! cannot repair on its own so an operator can follow up.
//!
//! ## Usage
//! ```bash
//! cargo run --bin verify_ledger_consistency
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string

use std::env;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("MeterPay Ledger Consistency Verification");
    println!("=========================================\n");

    // Load environment variables
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;
    println!("Connected to database\n");

    let mut issues = 0;

    // ========================================================================
    // Check 1: Accounts where used_quota exceeds total_quota
    // ========================================================================
    println!("Check 1: Accounts with used_quota above total_quota...");

    let overdrawn: Vec<(uuid::Uuid, i64, i64)> = sqlx::query_as(
        r#"
        SELECT user_id, total_quota, used_quota
        FROM user_accounts
        WHERE used_quota > total_quota
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if overdrawn.is_empty() {
        println!("  OK: no overdrawn accounts");
    } else {
        issues += overdrawn.len();
        println!("  Found {} overdrawn accounts:", overdrawn.len());
        for (user_id, total, used) in &overdrawn {
            println!("    - {}: used {} of {}", user_id, used, total);
        }
    }

    // ========================================================================
    // Check 2: Alerts stuck in pending
    // ========================================================================
    println!("\nCheck 2: Alerts pending for more than a day...");

    let (stale_alerts,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM cost_alerts
        WHERE correction_status = 'pending'
          AND created_at < NOW() - INTERVAL '1 day'
        "#,
    )
    .fetch_one(&pool)
    .await?;

    if stale_alerts == 0 {
        println!("  OK: no stale pending alerts");
    } else {
        issues += stale_alerts as usize;
        println!(
            "  Found {} pending alerts older than a day (is the worker running?)",
            stale_alerts
        );
    }

    // ========================================================================
    // Check 3: Failed corrections awaiting manual review
    // ========================================================================
    println!("\nCheck 3: Failed corrections...");

    let failed_corrections: Vec<(uuid::Uuid, uuid::Uuid, Option<String>)> = sqlx::query_as(
        r#"
        SELECT id, user_id, error_message
        FROM billing_corrections
        WHERE status = 'failed'
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if failed_corrections.is_empty() {
        println!("  OK: no failed corrections");
    } else {
        issues += failed_corrections.len();
        println!("  Found {} failed corrections:", failed_corrections.len());
        for (id, user_id, message) in &failed_corrections {
            println!(
                "    - {} (user {}): {}",
                id,
                user_id,
                message.as_deref().unwrap_or("no error recorded")
            );
        }
    }

    // ========================================================================
    // Check 4: Completed corrections without a compensating usage record
    // ========================================================================
    println!("\nCheck 4: Completed corrections missing their audit usage record...");

    let (orphaned,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM billing_corrections c
        WHERE c.status = 'completed'
          AND NOT EXISTS (
              SELECT 1 FROM usage_records r
              WHERE r.user_id = c.user_id
                AND r.record_type IN ('correction_charge', 'correction_refund')
                AND r.metadata ->> 'alert_id' = c.alert_id::text
          )
        "#,
    )
    .fetch_one(&pool)
    .await?;

    if orphaned == 0 {
        println!("  OK: every completed correction has its usage record");
    } else {
        issues += orphaned as usize;
        println!("  Found {} corrections without an audit record", orphaned);
    }

    // ========================================================================
    // Check 5: Paid subscription orders without a subscription row
    // ========================================================================
    println!("\nCheck 5: Paid subscription orders without a subscription...");

    let missing_subs: Vec<(String, uuid::Uuid)> = sqlx::query_as(
        r#"
        SELECT o.order_no, o.user_id
        FROM orders o
        JOIN packages p ON p.package_key = o.package_key
        WHERE o.status = 'paid'
          AND p.kind = 'subscription'
          AND NOT EXISTS (
              SELECT 1 FROM subscriptions s WHERE s.user_id = o.user_id
          )
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if missing_subs.is_empty() {
        println!("  OK: all paid subscription orders have subscriptions");
    } else {
        issues += missing_subs.len();
        println!(
            "  Found {} paid orders without a subscription (reconcile them to self-heal):",
            missing_subs.len()
        );
        for (order_no, user_id) in &missing_subs {
            println!("    - {} (user {})", order_no, user_id);
        }
    }

    // ========================================================================
    // Summary
    // ========================================================================
    println!("\n=========================================");
    if issues == 0 {
        println!("All checks passed");
    } else {
        println!("{} issues found - see details above", issues);
    }
    println!("=========================================");

    Ok(())
}
