pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod time;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

/// Migrations embedded in the binary.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// How often expired subscriptions are swept.
    pub sweep_interval: Duration,
    /// Default tracing filter when RUST_LOG is not set.
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        use std::env::var;

        let database_url =
            var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let sweep_interval = match var("SWEEP_INTERVAL_SECS") {
            Ok(value) => match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "SWEEP_INTERVAL_SECS",
                        value,
                    });
                }
            },
            Err(_) => Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        };

        let log_level =
            var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        Ok(Config {
            database_url,
            sweep_interval,
            log_level,
        })
    }
}

/// Connect to the database and bring the schema up to date.
pub async fn connect_and_migrate(config: &Config) -> anyhow::Result<PgPool> {
    use anyhow::Context;

    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the database")?;

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    Ok(pool)
}
