use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

const CONNECT_ATTEMPTS: u32 = 5;

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Setting up database connection pool");
    tracing::info!("Database URL: {}", mask_database_url(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);

    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        tracing::info!("Connection attempt {} of {}", attempt, CONNECT_ATTEMPTS);

        match tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), pool.get()).await
        {
            Ok(Ok(_conn)) => {
                tracing::info!("Database connection established");
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => {
                tracing::warn!("Database connection failed on attempt {}: {}", attempt, e);
                last_error = Some(anyhow!("Database connection failed: {}", e));
            }
            Err(_) => {
                tracing::warn!("Database connection timed out on attempt {}", attempt);
                last_error = Some(anyhow!("Database connection timed out"));
            }
        }

        if attempt < CONNECT_ATTEMPTS {
            let wait_time = Duration::from_secs(2_u64.pow(attempt - 1));
            tracing::info!("Waiting {:?} before retry...", wait_time);
            tokio::time::sleep(wait_time).await;
        }
    }

    tracing::error!("All database connection attempts failed");
    Err(last_error.unwrap_or_else(|| {
        anyhow!(
            "Failed to establish database connection after {} attempts",
            CONNECT_ATTEMPTS
        )
    }))
}

/// Hides the password part of a connection URL for logging.
pub fn mask_database_url(url: &str) -> String {
    match url.rfind('@') {
        Some(at_pos) => {
            let (before_at, after_at) = url.split_at(at_pos);
            let scheme_end = before_at.find("://").map(|p| p + 3).unwrap_or(0);
            match before_at[scheme_end..].find(':') {
                Some(colon_pos) => {
                    format!("{}:****{}", &before_at[..scheme_end + colon_pos], after_at)
                }
                None => url.to_string(),
            }
        }
        None => url.to_string(),
    }
}
