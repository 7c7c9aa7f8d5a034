//! `products` table: the stock ledger.

use crate::{PostgresLedger, database_error, to_i64, to_u32, to_u64};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use stockflow_core::ledger::{LedgerError, LedgerFuture, ReservationChange, StockLedger, StockWrite};
use stockflow_core::reservation::{Reservation, ReservationStatus};
use stockflow_core::stock::{StockCounts, StockRecord};
use stockflow_core::types::{ProductId, ReservationId};

const SELECT_PRODUCT: &str = r"
    SELECT id, total_stock, available_stock, reserved_stock, version, updated_at
    FROM products
    WHERE id = $1
";

const SELECT_ALL_PRODUCTS: &str = r"
    SELECT id, total_stock, available_stock, reserved_stock, version, updated_at
    FROM products
    ORDER BY id
";

fn row_to_stock(row: &PgRow) -> Result<StockRecord, LedgerError> {
    let get_i64 = |column: &str| row.try_get::<i64, _>(column).map_err(database_error);

    let counts = StockCounts::new(
        to_u32(get_i64("total_stock")?, "total_stock")?,
        to_u32(get_i64("available_stock")?, "available_stock")?,
        to_u32(get_i64("reserved_stock")?, "reserved_stock")?,
    )
    .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

    Ok(StockRecord {
        product_id: ProductId::new(row.try_get::<String, _>("id").map_err(database_error)?),
        counts,
        version: to_u64(get_i64("version")?, "version")?,
        updated_at: row.try_get("updated_at").map_err(database_error)?,
    })
}

impl PostgresLedger {
    async fn insert_product(&self, record: StockRecord) -> Result<StockRecord, LedgerError> {
        let row = sqlx::query(
            r"
            INSERT INTO products (id, total_stock, available_stock, reserved_stock, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING id, total_stock, available_stock, reserved_stock, version, updated_at
            ",
        )
        .bind(record.product_id.as_str())
        .bind(i64::from(record.counts.total()))
        .bind(i64::from(record.counts.available()))
        .bind(i64::from(record.counts.reserved()))
        .bind(to_i64(record.version, "version")?)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match database_error(e) {
            LedgerError::Duplicate { .. } => LedgerError::Duplicate {
                entity: "product",
                id: record.product_id.to_string(),
            },
            other => other,
        })?;

        tracing::info!(product_id = %record.product_id, total = record.counts.total(), "Product registered");
        row_to_stock(&row)
    }

    async fn select_product(&self, product_id: &ProductId) -> Result<Option<StockRecord>, LedgerError> {
        let row = sqlx::query(SELECT_PRODUCT)
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;
        row.as_ref().map(row_to_stock).transpose()
    }

    async fn select_all_products(&self) -> Result<Vec<StockRecord>, LedgerError> {
        let rows = sqlx::query(SELECT_ALL_PRODUCTS)
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;
        rows.iter().map(row_to_stock).collect()
    }

    async fn conditional_write(&self, write: StockWrite) -> Result<StockRecord, LedgerError> {
        let counts = write.counts;
        // Unsigned counts cannot go negative; balance is re-checked before the
        // write and again by the table constraint.
        StockCounts::new(counts.total(), counts.available(), counts.reserved())
            .map_err(|e| LedgerError::InvariantViolation(e.to_string()))?;

        let expected = to_i64(write.expected_version, "version")?;
        let mut tx = self.pool.begin().await.map_err(database_error)?;

        let claimed = sqlx::query(
            r"
            INSERT INTO applied_events (event_id, product_id, applied_at)
            SELECT $1, id, $3 FROM products WHERE id = $2
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(*write.event_id.as_uuid())
        .bind(write.product_id.as_str())
        .bind(write.at)
        .execute(&mut *tx)
        .await
        .map_err(database_error)?
        .rows_affected();

        if claimed == 0 {
            let replayed: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM applied_events WHERE event_id = $1)")
                    .bind(*write.event_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(database_error)?;
            if replayed {
                tx.rollback().await.map_err(database_error)?;
                return Err(LedgerError::AlreadyApplied {
                    event_id: write.event_id,
                });
            }
            // Unknown product: fall through so the UPDATE reports it.
        }

        let updated = sqlx::query(
            r"
            UPDATE products
            SET total_stock = $3, available_stock = $4, reserved_stock = $5,
                version = version + 1, updated_at = $6
            WHERE id = $1 AND version = $2
            RETURNING id, total_stock, available_stock, reserved_stock, version, updated_at
            ",
        )
        .bind(write.product_id.as_str())
        .bind(expected)
        .bind(i64::from(counts.total()))
        .bind(i64::from(counts.available()))
        .bind(i64::from(counts.reserved()))
        .bind(write.at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database_error)?;

        let Some(row) = updated else {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM products WHERE id = $1")
                .bind(write.product_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(database_error)?;
            tx.rollback().await.map_err(database_error)?;

            return Err(match actual {
                None => LedgerError::NotFound {
                    entity: "product",
                    id: write.product_id.to_string(),
                },
                Some(actual) => {
                    metrics::counter!("stockflow_cas_conflicts_total").increment(1);
                    LedgerError::ConcurrencyConflict {
                        product_id: write.product_id,
                        expected: write.expected_version,
                        actual: to_u64(actual, "version")?,
                    }
                }
            });
        };
        let record = row_to_stock(&row)?;

        match write.reservation {
            Some(ReservationChange::Open(reservation)) => {
                insert_reservation(&mut tx, &reservation).await?;
            }
            Some(ReservationChange::Close { reservation_id, to }) => {
                close_reservation(&mut tx, reservation_id, to).await?;
            }
            None => {}
        }

        tx.commit().await.map_err(database_error)?;
        Ok(record)
    }
}

async fn insert_reservation(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &Reservation,
) -> Result<(), LedgerError> {
    sqlx::query(
        r"
        INSERT INTO reservations (id, user_id, product_id, quantity, reserved_at, expires_at, status, correlation_id, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $5)
        ",
    )
    .bind(*reservation.id.as_uuid())
    .bind(reservation.user_id.as_str())
    .bind(reservation.product_id.as_str())
    .bind(i64::from(reservation.quantity))
    .bind(reservation.reserved_at)
    .bind(reservation.expires_at)
    .bind(reservation.status.as_str())
    .bind(*reservation.correlation_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| match database_error(e) {
        LedgerError::Duplicate { .. } => LedgerError::Duplicate {
            entity: "reservation",
            id: reservation.correlation_id.to_string(),
        },
        other => other,
    })?;
    Ok(())
}

async fn close_reservation(
    tx: &mut Transaction<'_, Postgres>,
    reservation_id: ReservationId,
    to: ReservationStatus,
) -> Result<(), LedgerError> {
    let result = sqlx::query(
        r"
        UPDATE reservations
        SET status = $2, updated_at = now()
        WHERE id = $1 AND status = 'ACTIVE'
        ",
    )
    .bind(*reservation_id.as_uuid())
    .bind(to.as_str())
    .execute(&mut **tx)
    .await
    .map_err(database_error)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let actual: Option<String> = sqlx::query_scalar("SELECT status FROM reservations WHERE id = $1")
        .bind(*reservation_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(database_error)?;
    match actual {
        None => Err(LedgerError::NotFound {
            entity: "reservation",
            id: reservation_id.to_string(),
        }),
        Some(status) => Err(LedgerError::InvalidTransition {
            reservation_id,
            expected: ReservationStatus::Active,
            actual: ReservationStatus::parse(&status)?,
        }),
    }
}

impl StockLedger for PostgresLedger {
    fn create_product(&self, record: StockRecord) -> LedgerFuture<'_, StockRecord> {
        Box::pin(self.insert_product(record))
    }

    fn load_stock<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>> {
        Box::pin(self.select_product(product_id))
    }

    fn list_stock(&self) -> LedgerFuture<'_, Vec<StockRecord>> {
        Box::pin(self.select_all_products())
    }

    fn compare_and_set(&self, write: StockWrite) -> LedgerFuture<'_, StockRecord> {
        Box::pin(self.conditional_write(write))
    }
}
