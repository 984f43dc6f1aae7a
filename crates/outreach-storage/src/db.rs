//! PostgreSQL pool for the outreach tables

use outreach_common::config::DatabaseConfig;
use outreach_common::{Error, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const APPLICATION_NAME: &str = "outreach";

/// Shared handle to the outreach database
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect using the `database` config section
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = connect_options(config)?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    /// Wrap an already connected pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        debug!(idle = self.pool.num_idle(), size = self.pool.size(), "Database reachable");
        Ok(())
    }
}

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "Backend {:?} has no connection pool",
            config.backend
        )));
    }
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| Error::Config("database.url is required for postgres".to_string()))?;

    PgConnectOptions::from_str(url)
        .map(|options| options.application_name(APPLICATION_NAME))
        .map_err(|e| Error::Config(format!("Invalid database.url: {}", e)))
}

/// Map a sqlx error into the crate error
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}
