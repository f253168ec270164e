//! # Database Migration Support
//!
//! Schema for the `processable_objects` table, embedded from `migrations/`.
//!
//! ```rust,ignore
//! #[sqlx::test(migrator = "processing_engine::database::migrator::MIGRATOR")]
//! async fn test_feature(pool: PgPool) { /* ... */ }
//! ```

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

/// Migrator containing every migration in the crate's `migrations/` directory
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running processable object migrations");
    MIGRATOR.run(pool).await?;
    info!("Migrations complete");
    Ok(())
}
