//! SQLite connection pool with WAL mode.
//!
//! One process-wide pool; its capacity bounds overall concurrency
//! (worker pool + request handlers + a small buffer). The graph facade
//! is the only component issuing graph queries through it.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;
use crate::error::KgResult;

pub async fn connect(config: &Config) -> KgResult<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    // workers + request handlers + buffer
    let pool_size = (config.jobs.workers + 8) as u32;

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .connect_with(options)
        .await?;

    Ok(pool)
}
