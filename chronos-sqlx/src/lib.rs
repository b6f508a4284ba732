//! A PostgreSQL backend for [`chronos`].
//!
//! Jobs and their execution logs are kept in the `chronos_jobs` and `chronos_execution_logs`
//! tables. Run [`PgBackend::run_migrations`] once before starting an engine.
//!
//! ```no_run
//! # use chronos::prelude::*;
//! # use chronos_sqlx::PgBackend;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgresql://localhost/chronos").await?;
//! let backend = PgBackend::from(pool);
//! backend.run_migrations().await?;
//!
//! let chronos = Chronos::new(backend).start();
//! # chronos.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
use chronos::backend::StoreError;
use sqlx::PgPool;

mod backend;
mod query;
mod types;

/// A [`chronos::backend::Backend`] storing jobs in PostgreSQL.
///
/// Clones share the same connection pool.
#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
}

impl From<PgPool> for PgBackend {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgBackend {
    fn from(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

impl std::ops::Deref for PgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl PgBackend {
    /// Creates or upgrades the tables used by the backend.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        tracing::info!("Running chronos migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Unavailable(Box::new(error)))
    }
}

fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Decode(error) => StoreError::Corrupt(error.to_string()),
        error @ sqlx::Error::ColumnDecode { .. } => StoreError::Corrupt(error.to_string()),
        error => StoreError::Unavailable(Box::new(error)),
    }
}
