//! SeaORM pool construction and the database health probe.

use std::time::Duration;

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use tokio::time::sleep;

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Open the connection pool, retrying transient connect failures with a
/// doubling delay before giving up.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        }
        .into());
    }

    let mut options = ConnectOptions::new(&cfg.database_url);
    options
        .max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let mut delay = INITIAL_RETRY_DELAY;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match Database::connect(options.clone()).await {
            Ok(pool) => {
                tracing::info!(attempt, "Database pool ready");
                return Ok(pool);
            }
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                tracing::warn!(
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Database connect failed; retrying"
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                tracing::error!(attempts = CONNECT_ATTEMPTS, error = %err, "Giving up on database connect");
                return Err(DatabaseError::ConnectionFailed { source: err }.into());
            }
        }
    }

    unreachable!("connect loop returns on success or final attempt")
}

/// Round-trip `SELECT 1` so the health endpoint reflects pool liveness.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    use sea_orm::Statement;

    let probe = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(probe)
        .await
        .context("Database health check failed")?;

    Ok(())
}
