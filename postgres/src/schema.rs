//! Table bootstrap.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and run in order.

use crate::database_error;
use sqlx::PgPool;
use stockflow_core::ledger::LedgerError;

/// DDL applied by [`apply`].
pub const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY,
        total_stock BIGINT NOT NULL,
        available_stock BIGINT NOT NULL,
        reserved_stock BIGINT NOT NULL,
        version BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT products_stock_non_negative
            CHECK (total_stock >= 0 AND available_stock >= 0 AND reserved_stock >= 0),
        CONSTRAINT products_stock_balanced
            CHECK (total_stock = available_stock + reserved_stock)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS reservations (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        product_id TEXT NOT NULL REFERENCES products(id),
        quantity BIGINT NOT NULL CHECK (quantity > 0),
        reserved_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('ACTIVE', 'CONFIRMED', 'RELEASED', 'EXPIRED')),
        correlation_id UUID NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_correlation ON reservations(correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_reservations_active_expiry ON reservations(expires_at) WHERE status = 'ACTIVE'",
    "CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations(user_id, reserved_at DESC)",
    r"
    CREATE TABLE IF NOT EXISTS applied_events (
        event_id UUID PRIMARY KEY,
        product_id TEXT NOT NULL REFERENCES products(id),
        applied_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS inventory_events (
        event_id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        product_id TEXT NOT NULL,
        user_id TEXT,
        quantity BIGINT NOT NULL,
        correlation_id UUID NOT NULL,
        outcome TEXT NOT NULL CHECK (outcome IN ('APPLIED', 'IGNORED', 'REJECTED')),
        detail TEXT,
        metadata JSONB,
        occurred_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_inventory_events_product ON inventory_events(product_id, processed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_inventory_events_correlation ON inventory_events(correlation_id)",
];

/// Run every statement in [`STATEMENTS`].
///
/// # Errors
///
/// Returns [`LedgerError::Database`] on the first failing statement.
pub async fn apply(pool: &PgPool) -> Result<(), LedgerError> {
    let mut conn = pool.acquire().await.map_err(database_error)?;
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(database_error)?;
    }
    tracing::info!(statements = STATEMENTS.len(), "Inventory schema applied");
    Ok(())
}
