//! MeterPay API server

use meterpay_api::{routes::create_router, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meterpay_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let pool = meterpay_shared::create_pool(&config.database_url).await?;

    meterpay_shared::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    let state = AppState::new(pool, config.clone());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "MeterPay API listening");
    axum::serve(listener, router).await?;

    Ok(())
}
