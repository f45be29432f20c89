use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    api::AppState,
    config::{AppConfig, StorageBackend},
    error::{AppError, AppResult},
    identity::{ActorProvider, StaticActor},
    ledger::{expenses::ExpenseService, InMemorySettlementStore, PgSettlementStore, SettlementStore},
    reconciliation::ReconciliationEngine,
};

pub async fn initialize_app_state(config: &AppConfig) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let (store, pool): (Arc<dyn SettlementStore>, Option<PgPool>) = match config.storage_backend {
        StorageBackend::Postgres => {
            let database_url = config.database_url.as_deref().ok_or_else(|| {
                AppError::Config("DATABASE_URL must be set for the postgres backend".to_string())
            })?;
            let pool = initialize_database(database_url, config.db_max_connections).await?;
            (
                Arc::new(PgSettlementStore::new(pool.clone())) as Arc<dyn SettlementStore>,
                Some(pool),
            )
        }
        StorageBackend::Memory => {
            info!("⚠️  Using in-memory settlement store; data is lost on restart");
            (Arc::new(InMemorySettlementStore::new()) as Arc<dyn SettlementStore>, None)
        }
    };

    let actor: Arc<dyn ActorProvider> = Arc::new(StaticActor::new(config.default_actor.clone()));

    let engine = ReconciliationEngine::new(config.reconciliation(), store.clone(), actor.clone());
    info!(
        "✅ Reconciliation engine initialized (completion attempts: {}, backoff: {}ms)",
        config.completion_max_attempts, config.completion_backoff_ms
    );

    let expenses = ExpenseService::new(store, actor);

    Ok(AppState {
        engine,
        expenses,
        default_actor: config.default_actor.clone(),
        pool,
    })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
