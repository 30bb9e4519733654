#!/usr/bin/env rust-script
//! Pending Order Reconciliation Script
//!
//! Sweeps orders stuck in `pending` and reconciles each one against the
//! payment gateway through the running API.
//!
//! ## Usage
//! ```bash
//! # Dry run (list stuck orders without touching them)
//! cargo run --bin reconcile_pending_orders --dry-run
//!
//! # Apply (force a gateway query per order)
//! cargo run --bin reconcile_pending_orders --apply
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - API_BASE_URL: Base URL of the running API (default http://localhost:3000)
//! - STUCK_ORDER_MINUTES: Minimum order age to sweep (default 30)

use std::env;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("MeterPay Pending Order Reconciliation");
    println!("======================================\n");

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let dry_run = !args.contains(&"--apply".to_string());

    if dry_run {
        println!("DRY RUN MODE - No changes will be applied");
        println!("Use --apply flag to reconcile the listed orders\n");
    } else {
        println!("LIVE MODE - Stuck orders will be queried against the gateway\n");
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let api_base_url =
        env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let stuck_minutes: i32 = env::var("STUCK_ORDER_MINUTES")
        .unwrap_or_else(|_| "30".to_string())
        .parse()
        .unwrap_or(30);

    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;
    println!("Connected to database\n");

    // ========================================================================
    // Find orders stuck in pending
    // ========================================================================
    println!(
        "Scanning for orders pending longer than {} minutes...",
        stuck_minutes
    );

    let stuck_orders: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT order_no, package_key, amount
        FROM orders
        WHERE status = 'pending'
          AND created_at < NOW() - make_interval(mins => $1)
        ORDER BY created_at ASC
        "#,
    )
    .bind(stuck_minutes)
    .fetch_all(&pool)
    .await?;

    if stuck_orders.is_empty() {
        println!("  No stuck orders found!");
        return Ok(());
    }

    println!("  Found {} stuck orders:\n", stuck_orders.len());
    for (i, (order_no, package_key, amount)) in stuck_orders.iter().enumerate() {
        println!("{}. {} ({}, {} minor units)", i + 1, order_no, package_key, amount);
    }

    if dry_run {
        println!("\nThis was a dry run. No orders were reconciled.");
        println!("Run with --apply flag to reconcile them.");
        return Ok(());
    }

    // ========================================================================
    // Reconcile each order through the API
    // ========================================================================
    println!("\n======================================");
    println!("Reconciling");
    println!("======================================\n");

    let client = reqwest::Client::new();
    let mut confirmed = 0;
    let mut still_pending = 0;
    let mut failed = 0;

    for (order_no, _, _) in &stuck_orders {
        let response = client
            .post(format!("{}/api/orders/reconcile", api_base_url))
            .json(&serde_json::json!({
                "order_no": order_no,
                "force_gateway_query": true,
            }))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().await?;
                let status = body.get("status").and_then(|s| s.as_str()).unwrap_or("?");
                if status == "paid" {
                    confirmed += 1;
                    println!("  {} -> paid", order_no);
                } else {
                    still_pending += 1;
                    println!("  {} -> still pending", order_no);
                }
            }
            Ok(resp) => {
                failed += 1;
                println!("  {} -> API returned {}", order_no, resp.status());
            }
            Err(e) => {
                failed += 1;
                println!("  {} -> request failed: {}", order_no, e);
            }
        }
    }

    println!("\n======================================");
    println!("Reconciliation Complete");
    println!("======================================");
    println!(
        "Confirmed paid: {} / Still pending: {} / Failed: {}",
        confirmed, still_pending, failed
    );

    Ok(())
}
