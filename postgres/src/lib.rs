//! `PostgreSQL` ledgers for stockflow.
//!
//! [`PostgresLedger`] implements the three ledger traits of `stockflow-core`
//! over one connection pool:
//!
//! - `products`: one row per product, stock invariant enforced by `CHECK`
//!   constraints, mutated only by version-conditioned `UPDATE`s
//! - `reservations`: holds, unique on `correlation_id`, indexed for the
//!   sweeper's expiry scan and for per-user listings
//! - `applied_events`: IDs of events whose stock write committed
//! - `inventory_events`: append-only audit of consumed events keyed by event ID
//!
//! A stock compare-and-set, its reservation change and the applied event ID
//! run in one transaction, so a redelivered event cannot be applied twice.
//!
//! # Example
//!
//! ```no_run
//! use stockflow_postgres::PostgresLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = PostgresLedger::connect("postgres://localhost/stockflow", 10).await?;
//! ledger.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use stockflow_core::ledger::LedgerError;

mod audit;
mod reservations;
pub mod schema;
mod stock;

/// Stock, reservation and audit ledger backed by `PostgreSQL`.
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with at most `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(database_error)?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Create tables and indexes if missing. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        schema::apply(&self.pool).await
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every connection. Further operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const UNIQUE_VIOLATION: &str = "23505";
const CHECK_VIOLATION: &str = "23514";

/// Map a driver error, classifying constraint violations.
pub(crate) fn database_error(e: sqlx::Error) -> LedgerError {
    let code = e
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned());
    match code.as_deref() {
        Some(UNIQUE_VIOLATION) => LedgerError::Duplicate {
            entity: "row",
            id: e.to_string(),
        },
        Some(CHECK_VIOLATION) => LedgerError::InvariantViolation(e.to_string()),
        _ => LedgerError::Database(e.to_string()),
    }
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{column} out of range: {value}")))
}

pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{column} out of range: {value}")))
}

pub(crate) fn to_i64(value: u64, column: &str) -> Result<i64, LedgerError> {
    i64::try_from(value)
        .map_err(|_| LedgerError::InvariantViolation(format!("{column} out of range: {value}")))
}

pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
