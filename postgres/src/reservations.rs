//! `reservations` table: read side of the reservation ledger.
//!
//! Rows are written only by [`StockLedger::compare_and_set`](stockflow_core::ledger::StockLedger::compare_and_set),
//! inside the same transaction as the stock change they account for.

use crate::{PostgresLedger, database_error, limit_param, to_u32};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use stockflow_core::ledger::{LedgerError, LedgerFuture, ReservationLedger};
use stockflow_core::reservation::{Reservation, ReservationStatus};
use stockflow_core::types::{CorrelationId, ProductId, ReservationId, UserId};
use uuid::Uuid;

fn row_to_reservation(row: &PgRow) -> Result<Reservation, LedgerError> {
    let status: String = row.try_get("status").map_err(database_error)?;
    let quantity: i64 = row.try_get("quantity").map_err(database_error)?;

    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id").map_err(database_error)?),
        user_id: UserId::new(row.try_get::<String, _>("user_id").map_err(database_error)?),
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(database_error)?),
        quantity: to_u32(quantity, "quantity")?,
        reserved_at: row.try_get("reserved_at").map_err(database_error)?,
        expires_at: row.try_get("expires_at").map_err(database_error)?,
        status: ReservationStatus::parse(&status)?,
        correlation_id: CorrelationId::from_uuid(
            row.try_get::<Uuid, _>("correlation_id").map_err(database_error)?,
        ),
    })
}

impl PostgresLedger {
    async fn reservation_where_uuid(
        &self,
        query: &'static str,
        key: Uuid,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn reservations_for_user(&self, user_id: &UserId) -> Result<Vec<Reservation>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, product_id, quantity, reserved_at, expires_at, status, correlation_id
            FROM reservations
            WHERE user_id = $1
            ORDER BY reserved_at DESC
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;
        rows.iter().map(row_to_reservation).collect()
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, product_id, quantity, reserved_at, expires_at, status, correlation_id
            FROM reservations
            WHERE status = 'ACTIVE' AND expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;
        rows.iter().map(row_to_reservation).collect()
    }
}

impl ReservationLedger for PostgresLedger {
    fn load_reservation(&self, id: ReservationId) -> LedgerFuture<'_, Option<Reservation>> {
        Box::pin(self.reservation_where_uuid(
            r"
            SELECT id, user_id, product_id, quantity, reserved_at, expires_at, status, correlation_id
            FROM reservations
            WHERE id = $1
            ",
            *id.as_uuid(),
        ))
    }

    fn find_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> LedgerFuture<'_, Option<Reservation>> {
        Box::pin(self.reservation_where_uuid(
            r"
            SELECT id, user_id, product_id, quantity, reserved_at, expires_at, status, correlation_id
            FROM reservations
            WHERE correlation_id = $1
            ",
            *correlation_id.as_uuid(),
        ))
    }

    fn list_for_user<'a>(&'a self, user_id: &'a UserId) -> LedgerFuture<'a, Vec<Reservation>> {
        Box::pin(self.reservations_for_user(user_id))
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> LedgerFuture<'_, Vec<Reservation>> {
        Box::pin(self.expired_reservations(now, limit))
    }
}
