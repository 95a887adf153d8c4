//! Postgres storage for a SiteBridge installation
//!
//! `Repository` implements the installation store traits over SeaORM.
//! A transfer reads back what it has just written (matches, metadata keys,
//! fresh entities in the fixup pass), so every store call runs on the
//! primary. The optional replica only serves the export listing.

pub mod models;
mod repository;

pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Primary connection plus an optional lagging replica
#[derive(Clone)]
pub struct DbPool {
    primary: Arc<DatabaseConnection>,
    replica: Option<Arc<DatabaseConnection>>,
}

impl DbPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let primary = connect(config, &config.url, "primary").await?;
        let replica = match config.read_url.as_deref() {
            Some(url) => Some(connect(config, url, "replica").await?),
            None => None,
        };
        Ok(Self { primary: Arc::new(primary), replica: replica.map(Arc::new) })
    }

    #[cfg(test)]
    pub(crate) fn from_connections(primary: DatabaseConnection, replica: Option<DatabaseConnection>) -> Self {
        Self { primary: Arc::new(primary), replica: replica.map(Arc::new) }
    }

    /// Connection for transfers; sees every committed write
    pub fn primary(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Connection for listings (replica if configured)
    pub fn listing(&self) -> &DatabaseConnection {
        self.replica.as_deref().unwrap_or(&self.primary)
    }

    /// Apply pending schema migrations on the primary
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(self.primary.get_postgres_connection_pool())
            .await?;
        Ok(())
    }

    /// Check both connections answer
    pub async fn ping(&self) -> Result<()> {
        ping(&self.primary, "primary").await?;
        if let Some(replica) = &self.replica {
            ping(replica, "replica").await?;
        }
        Ok(())
    }
}

async fn connect(config: &DatabaseConfig, url: &str, role: &str) -> Result<DatabaseConnection> {
    info!(role, "Connecting to database...");

    let mut opts = ConnectOptions::new(url);
    opts.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .sqlx_logging(true);

    let conn = Database::connect(opts)
        .await
        .map_err(|e| AppError::DatabaseConnection {
            message: format!("Failed to connect to {}: {}", role, e),
        })?;
    info!(role, "Database connection established");
    Ok(conn)
}

async fn ping(conn: &DatabaseConnection, role: &str) -> Result<()> {
    conn.execute_unprepared("SELECT 1")
        .await
        .map_err(|e| AppError::DatabaseConnection {
            message: format!("{} ping failed: {}", role, e),
        })?;
    Ok(())
}
