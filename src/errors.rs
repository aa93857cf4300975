use sea_orm::error::{DbErr, RuntimeErr, SqlErr};
use serde::Serialize;

/// Errors surfaced by the order/inventory engine.
///
/// The variants line up with the failure classes callers have to tell apart:
/// validation failures are rejected before any write, conflicts are safe to
/// resubmit, and ledger inconsistencies always abort the enclosing transaction.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ledger inconsistency for order {order_id}, product {product_id}: {message}")]
    LedgerInconsistency {
        order_id: i32,
        product_id: i32,
        message: String,
    },

    #[error("Reconciliation failed for order {order_id} ({order_number}): {message}")]
    ReconciliationFailed {
        order_id: i32,
        order_number: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    ///
    /// Unique-constraint violations become [`ServiceError::Conflict`] so that a
    /// duplicate order or invoice number is reported as retryable. So does a
    /// SQLite writer that lost the race for the database lock.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        let err = error.into_db_err();
        if let Some(SqlErr::UniqueConstraintViolation(detail)) = err.sql_err() {
            return ServiceError::Conflict(detail);
        }
        if is_lock_contention(&err) {
            return ServiceError::Conflict(format!("database is busy: {}", err));
        }
        ServiceError::DatabaseError(err)
    }

    /// Wraps a ledger failure with the order and product it happened on.
    ///
    /// Already-typed ledger errors pass through untouched.
    pub fn ledger(order_id: i32, product_id: i32, source: ServiceError) -> Self {
        match source {
            ServiceError::LedgerInconsistency { .. } => source,
            other => ServiceError::LedgerInconsistency {
                order_id,
                product_id,
                message: other.to_string(),
            },
        }
    }

    /// Whether the caller may resubmit the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Stable machine-readable code for the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Conflict(_) => "conflict",
            Self::LedgerInconsistency { .. } => "ledger_inconsistency",
            Self::ReconciliationFailed { .. } => "reconciliation_failed",
            Self::ConfigError(_) => "config_error",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }
}

// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_BUSY_SNAPSHOT.
fn is_lock_contention(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => e
            .as_database_error()
            .and_then(|db| db.code())
            .map_or(false, |code| matches!(code.as_ref(), "5" | "6" | "517")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(ServiceError::Conflict("dup".into()).is_retryable());
        assert!(!ServiceError::ValidationError("x".into()).is_retryable());
        assert!(!ServiceError::LedgerInconsistency {
            order_id: 1,
            product_id: 2,
            message: "boom".into(),
        }
        .is_retryable());
    }

    #[test]
    fn ledger_wraps_with_order_and_product() {
        let err = ServiceError::ledger(7, 42, ServiceError::NotFound("product 42".into()));
        match err {
            ServiceError::LedgerInconsistency {
                order_id,
                product_id,
                message,
            } => {
                assert_eq!(order_id, 7);
                assert_eq!(product_id, 42);
                assert!(message.contains("product 42"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ledger_does_not_double_wrap() {
        let inner = ServiceError::LedgerInconsistency {
            order_id: 1,
            product_id: 2,
            message: "original".into(),
        };
        let err = ServiceError::ledger(9, 9, inner);
        assert_eq!(err.to_string(), "Ledger inconsistency for order 1, product 2: original");
    }

    #[test]
    fn custom_db_errors_stay_database_errors() {
        let err = ServiceError::db_error("connection reset");
        assert_eq!(err.code(), "database_error");
    }

    #[test]
    fn display_messages_are_user_facing() {
        assert_eq!(
            ServiceError::NotFound("Order 5 not found".into()).to_string(),
            "Not found: Order 5 not found"
        );
        assert_eq!(
            ServiceError::ValidationError("items must not be empty".into()).to_string(),
            "Validation error: items must not be empty"
        );
    }
}
