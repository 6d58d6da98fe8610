//! Persistence Layer
//!
//! SQLite storage for user configurations, the trade ledger and the audit log,
//! accessed asynchronously through sqlx.
//!
//! # Features
//! - Per-user serialized writes (see [`key_lock::KeyedLocks`])
//! - One OPEN trade per user, enforced by a partial unique index
//! - Idempotent schema migrations at startup
//!
//! # Database Schema
//!
//! ## User Configs Table
//! - user_id: Text primary key
//! - symbol: Traded instrument (e.g., "BTCUSDT")
//! - risk_params: JSON object of numeric strategy parameters
//! - schema_version: Version of the risk_params layout
//! - active: Loop opt-in flag
//! - subscription_expiry: Optional timestamp
//! - config_error: Last validation error seen by the scheduler
//!
//! ## Trades Table
//! - trade_id: Autoincrement, never reused
//! - user_id, symbol, side ("buy"/"sell"), leverage
//! - entry_price, exit_price, quantity, pnl
//! - status: "OPEN", "CLOSED", "FAILED"
//! - opened_at, closed_at
//! - entry_order_id, exit_order_id, failure_reason
//! - exit_client_order_id: Client id of an exit order whose outcome is not yet known
//!
//! ## Audit Log Table
//! - id: Serial
//! - event_type: Event type (entry_confirmed, exit_rejected, loop_stopped, etc.)
//! - user_id
//! - symbol: Optional trading pair
//! - details: JSON details
//! - timestamp: Timestamp

pub mod audit_log;
pub mod key_lock;
pub mod ledger_repository;
pub mod models;
pub mod settings_repository;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub use audit_log::AuditLogRepository;
pub use ledger_repository::SqliteTradeLedger;
pub use settings_repository::SqliteSettingsStore;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize the database connection pool with default settings
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g., "sqlite://data/tradeloop.db" or "sqlite::memory:")
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    init_database_with(&DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    })
    .await
}

/// Initialize the database connection pool
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    // Ensure data directory exists
    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let in_memory = config.url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }
    if !config.log_queries {
        options = options.disable_statement_logging();
    }

    // Every connection to `:memory:` is a separate database: pin a single one.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_configs (
            user_id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            risk_params TEXT NOT NULL,
            schema_version INTEGER NOT NULL DEFAULT 1,
            active BOOLEAN NOT NULL DEFAULT 0,
            subscription_expiry DATETIME,
            config_error TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create user_configs table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            trade_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
            entry_price REAL NOT NULL,
            exit_price REAL,
            quantity REAL NOT NULL,
            leverage REAL NOT NULL DEFAULT 1.0,
            status TEXT NOT NULL CHECK(status IN ('OPEN', 'CLOSED', 'FAILED')),
            opened_at DATETIME NOT NULL,
            closed_at DATETIME,
            pnl REAL,
            entry_order_id TEXT,
            exit_order_id TEXT,
            exit_client_order_id TEXT,
            failure_reason TEXT,
            CHECK(pnl IS NULL OR status = 'CLOSED')
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            user_id TEXT NOT NULL,
            symbol TEXT,
            details TEXT NOT NULL,
            timestamp DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create audit_log table: {}", e))
    })?;

    // The open slot: at most one OPEN trade per user
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_open_per_user ON trades(user_id) WHERE status = 'OPEN'",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_id, trade_id)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_user_configs_active ON user_configs(active)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_user_time ON audit_log(user_id, timestamp)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradeloop.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradeloop.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let url = std::env::var("DATABASE_URL").unwrap_or(defaults.url);

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_queries);

        Self {
            url,
            max_connections,
            log_queries,
        }
    }
}
