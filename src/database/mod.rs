//! # Database Operations
//!
//! PostgreSQL connection handling for the persistent object store.
//!
//! - [`connection`] - pool construction from [`DatabaseConfig`](crate::config::DatabaseConfig)
//! - [`migrator`] - embedded schema migrations for `processable_objects`
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use processing_engine::config::DatabaseConfig;
//! use processing_engine::database::{migrator, DatabaseConnection};
//! use processing_engine::store::PostgresObjectStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! migrator::run_migrations(connection.pool()).await?;
//! let store = PostgresObjectStore::new(connection.pool().clone());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod migrator;

pub use connection::DatabaseConnection;
