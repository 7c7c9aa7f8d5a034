//! `inventory_events` table: append-only audit of consumed events.

use crate::{PostgresLedger, database_error, limit_param, to_u32};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgRow;
use stockflow_core::event::EventType;
use stockflow_core::ledger::{AuditEntry, AuditOutcome, EventAuditLog, LedgerError, LedgerFuture};
use stockflow_core::types::{CorrelationId, EventId, ProductId, UserId};
use uuid::Uuid;

impl PostgresLedger {
    async fn insert_audit(&self, entry: AuditEntry) -> Result<(), LedgerError> {
        let metadata = (!entry.metadata.is_empty()).then(|| Value::Object(entry.metadata.clone()));

        let inserted = sqlx::query(
            r"
            INSERT INTO inventory_events (
                event_id, event_type, product_id, user_id, quantity, correlation_id,
                outcome, detail, metadata, occurred_at, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(*entry.event_id.as_uuid())
        .bind(entry.event_type.as_str())
        .bind(entry.product_id.as_str())
        .bind(entry.user_id.as_ref().map(UserId::as_str))
        .bind(i64::from(entry.quantity))
        .bind(*entry.correlation_id.as_uuid())
        .bind(entry.outcome.as_str())
        .bind(entry.detail.as_deref())
        .bind(metadata)
        .bind(entry.occurred_at)
        .bind(entry.processed_at)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if inserted.rows_affected() == 0 {
            tracing::debug!(event_id = %entry.event_id, "Event already audited");
        }
        Ok(())
    }

    async fn audit_history(
        &self,
        product_id: &ProductId,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT
                event_id, event_type, product_id, user_id, quantity, correlation_id,
                outcome, detail, metadata, occurred_at, processed_at
            FROM inventory_events
            WHERE product_id = $1
            ORDER BY processed_at DESC
            LIMIT $2
            ",
        )
        .bind(product_id.as_str())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        rows.iter().map(row_to_entry).collect()
    }
}

fn row_to_entry(row: &PgRow) -> Result<AuditEntry, LedgerError> {
    let event_type: String = row.try_get("event_type").map_err(database_error)?;
    let outcome: String = row.try_get("outcome").map_err(database_error)?;
    let quantity: i64 = row.try_get("quantity").map_err(database_error)?;
    let user_id: Option<String> = row.try_get("user_id").map_err(database_error)?;
    let metadata: Option<Value> = row.try_get("metadata").map_err(database_error)?;
    let metadata = match metadata {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };

    Ok(AuditEntry {
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id").map_err(database_error)?),
        event_type: EventType::parse(&event_type)?,
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(database_error)?),
        user_id: user_id.map(UserId::new),
        quantity: to_u32(quantity, "quantity")?,
        correlation_id: CorrelationId::from_uuid(
            row.try_get::<Uuid, _>("correlation_id").map_err(database_error)?,
        ),
        outcome: AuditOutcome::parse(&outcome)?,
        detail: row.try_get("detail").map_err(database_error)?,
        metadata,
        occurred_at: row.try_get("occurred_at").map_err(database_error)?,
        processed_at: row.try_get("processed_at").map_err(database_error)?,
    })
}

impl EventAuditLog for PostgresLedger {
    fn record(&self, entry: AuditEntry) -> LedgerFuture<'_, ()> {
        Box::pin(self.insert_audit(entry))
    }

    fn history<'a>(
        &'a self,
        product_id: &'a ProductId,
        limit: usize,
    ) -> LedgerFuture<'a, Vec<AuditEntry>> {
        Box::pin(self.audit_history(product_id, limit))
    }
}
