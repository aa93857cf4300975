use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge, histogram};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, TransactionTrait};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
    /// Log every statement through sqlx
    pub sqlx_logging: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
            sqlx_logging: false,
        }
    }
}

impl DbConfig {
    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }
}

impl From<&AppConfig> for DbConfig {
    /// SQLite allows a single writer per file, so its pool is pinned to one
    /// connection and transactions queue on acquire instead of failing with
    /// `database is locked`.
    fn from(cfg: &AppConfig) -> Self {
        let mut db_cfg = Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: cfg.db_connect_timeout(),
            idle_timeout: cfg.db_idle_timeout(),
            acquire_timeout: cfg.db_acquire_timeout(),
            sqlx_logging: cfg.log_level.eq_ignore_ascii_case("trace"),
        };
        if db_cfg.is_sqlite() && db_cfg.max_connections > 1 {
            warn!(
                requested = db_cfg.max_connections,
                "SQLite pool limited to a single connection"
            );
            db_cfg.max_connections = 1;
            db_cfg.min_connections = 1;
        }
        db_cfg
    }
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `ServiceError::DatabaseError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(config.sqlx_logging);

    gauge!("order_ledger_db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection establishment failed: {}", e);
        ServiceError::DatabaseError(e)
    })?;

    info!("Database connection pool established successfully");
    Ok(pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Runs the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Running database migrations");
    let start = Instant::now();

    let result = crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(ServiceError::DatabaseError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!(
            "Database migrations completed successfully in {:?}",
            elapsed
        ),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    debug!("Checking database connection");
    let start = Instant::now();

    let result = pool.ping().await.map_err(ServiceError::DatabaseError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
            gauge!("order_ledger_db.connection_latency", elapsed.as_millis() as f64);
        }
        Err(e) => {
            error!(
                "Database connection check failed after {:?}: {}",
                elapsed, e
            );
            counter!("order_ledger_db.connection_failures", 1);
        }
    }

    result
}

/// Closes the database connection pool
pub async fn close_pool(pool: DbPool) -> Result<(), ServiceError> {
    info!("Closing database connection pool");
    pool.close().await.map_err(ServiceError::DatabaseError)
}

/// An open unit of work.
///
/// Every engine operation runs its writes against [`UnitOfWork::conn`] and
/// then hands its outcome to [`UnitOfWork::finish`], which commits on `Ok`
/// and rolls back on `Err`. Dropping it without finishing rolls back too.
pub struct UnitOfWork {
    txn: DatabaseTransaction,
    id: Uuid,
    started: Instant,
}

impl UnitOfWork {
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub async fn finish<T>(self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        let Self { txn, id, started } = self;
        match result {
            Ok(value) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                let elapsed = started.elapsed();
                histogram!("order_ledger_db.transaction.duration", elapsed);
                counter!("order_ledger_db.transaction.committed", 1);
                debug!(transaction_id = %id, "Transaction committed in {:?}", elapsed);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(transaction_id = %id, error = %rollback_err, "Rollback failed");
                }
                counter!("order_ledger_db.transaction.rolled_back", 1);
                warn!(
                    transaction_id = %id,
                    error = %err,
                    "Transaction rolled back after {:?}",
                    started.elapsed()
                );
                Err(err)
            }
        }
    }
}

/// Opens a transaction on the pool.
pub async fn begin(pool: &DbPool) -> Result<UnitOfWork, ServiceError> {
    let txn = pool.begin().await.map_err(ServiceError::db_error)?;
    let id = Uuid::new_v4();
    counter!("order_ledger_db.transaction.started", 1);
    debug!(transaction_id = %id, "Starting database transaction");
    Ok(UnitOfWork {
        txn,
        id,
        started: Instant::now(),
    })
}
