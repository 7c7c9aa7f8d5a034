//! Inventory events and state snapshots as they travel over the event channel.
//!
//! Bodies are JSON with camelCase field names. Event messages are keyed by
//! product ID and carry `eventType` and `correlationId` headers; state
//! messages are keyed the same way and carry a `version` header.

use crate::channel::Message;
use crate::stock::StockRecord;
use crate::types::{CorrelationId, EventId, ProductId, UnknownVariant, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Header carrying the event type tag.
pub const HEADER_EVENT_TYPE: &str = "eventType";
/// Header carrying the correlation ID.
pub const HEADER_CORRELATION_ID: &str = "correlationId";
/// Header carrying the state version on the state topic.
pub const HEADER_VERSION: &str = "version";

/// Well-known metadata keys.
pub mod metadata {
    /// Why a RELEASE was issued
    pub const REASON: &str = "reason";
    /// `reason` value used by the expiration sweeper
    pub const REASON_EXPIRED: &str = "expired";
    /// Order identifier echoed on RESERVE
    pub const ORDER_ID: &str = "orderId";
    /// Estimated hold deadline echoed on RESERVE
    pub const RESERVED_UNTIL: &str = "reservedUntil";
    /// Result of an availability check
    pub const AVAILABLE: &str = "available";
    /// Quantity asked for by an availability check
    pub const REQUESTED: &str = "requested";
}

/// Errors encoding or decoding channel payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Serialization failed
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// The payload is not a valid event or state body
    #[error("Failed to decode payload: {0}")]
    Decode(String),
}

/// The closed set of inventory event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Read-only availability check
    #[serde(rename = "INVENTORY_CHECK")]
    Check,
    /// Request to hold stock
    #[serde(rename = "INVENTORY_RESERVE")]
    Reserve,
    /// Complete a hold; its stock leaves the system
    #[serde(rename = "INVENTORY_CONFIRM")]
    Confirm,
    /// Give a hold back to available stock
    #[serde(rename = "INVENTORY_RELEASE")]
    Release,
    /// Add new units
    #[serde(rename = "INVENTORY_RESTOCK")]
    Restock,
}

impl EventType {
    /// Wire tag, also used as the `eventType` header value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "INVENTORY_CHECK",
            Self::Reserve => "INVENTORY_RESERVE",
            Self::Confirm => "INVENTORY_CONFIRM",
            Self::Release => "INVENTORY_RELEASE",
            Self::Restock => "INVENTORY_RESTOCK",
        }
    }

    /// Short lowercase label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Reserve => "reserve",
            Self::Confirm => "confirm",
            Self::Release => "release",
            Self::Restock => "restock",
        }
    }

    /// Parse a wire tag.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownVariant`] for unknown tags.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "INVENTORY_CHECK" => Ok(Self::Check),
            "INVENTORY_RESERVE" => Ok(Self::Reserve),
            "INVENTORY_CONFIRM" => Ok(Self::Confirm),
            "INVENTORY_RELEASE" => Ok(Self::Release),
            "INVENTORY_RESTOCK" => Ok(Self::Restock),
            _ => Err(UnknownVariant {
                kind: "event type",
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable inventory event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEvent {
    /// Unique event identity
    pub event_id: EventId,
    /// What kind of transition is requested
    pub event_type: EventType,
    /// Product the event touches; also the partition key
    pub product_id: ProductId,
    /// Requesting or owning user, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Units involved
    pub quantity: u32,
    /// Publication time
    pub timestamp: DateTime<Utc>,
    /// Purchase flow this event belongs to
    pub correlation_id: CorrelationId,
    /// Free-form annotations
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl InventoryEvent {
    /// A bare event of the given type.
    #[must_use]
    pub fn new(
        event_type: EventType,
        product_id: ProductId,
        quantity: u32,
        correlation_id: CorrelationId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            product_id,
            user_id: None,
            quantity,
            timestamp,
            correlation_id,
            metadata: Map::new(),
        }
    }

    /// Availability check with its result recorded in metadata.
    #[must_use]
    pub fn check(
        product_id: ProductId,
        requested: u32,
        available: bool,
        user_id: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::new(EventType::Check, product_id, requested, CorrelationId::new(), now)
            .with_metadata(metadata::AVAILABLE, Value::Bool(available))
            .with_metadata(metadata::REQUESTED, Value::from(requested));
        event.user_id = user_id;
        event
    }

    /// Request a hold for `user_id` under `order_id`.
    #[must_use]
    pub fn reserve(
        product_id: ProductId,
        quantity: u32,
        user_id: UserId,
        order_id: CorrelationId,
        reserved_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(EventType::Reserve, product_id, quantity, order_id, now)
            .with_user(user_id)
            .with_metadata(metadata::ORDER_ID, Value::String(order_id.to_string()))
            .with_metadata(
                metadata::RESERVED_UNTIL,
                Value::String(reserved_until.to_rfc3339()),
            )
    }

    /// Confirm the hold identified by `order_id`.
    #[must_use]
    pub fn confirm(
        product_id: ProductId,
        quantity: u32,
        user_id: UserId,
        order_id: CorrelationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(EventType::Confirm, product_id, quantity, order_id, now).with_user(user_id)
    }

    /// Release the hold identified by `order_id`.
    #[must_use]
    pub fn release(
        product_id: ProductId,
        quantity: u32,
        user_id: UserId,
        order_id: CorrelationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(EventType::Release, product_id, quantity, order_id, now).with_user(user_id)
    }

    /// Add `quantity` units to a product.
    #[must_use]
    pub fn restock(product_id: ProductId, quantity: u32, now: DateTime<Utc>) -> Self {
        Self::new(EventType::Restock, product_id, quantity, CorrelationId::new(), now)
    }

    /// Set the user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// String metadata value, if present.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Whether this is a RELEASE issued by the expiration sweeper.
    #[must_use]
    pub fn is_expiry_release(&self) -> bool {
        self.event_type == EventType::Release
            && self.metadata_str(metadata::REASON) == Some(metadata::REASON_EXPIRED)
    }

    /// Serialize the body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// Deserialize a body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] for malformed payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Decode(e.to_string()))
    }

    /// Channel message keyed by product with type and correlation headers.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn to_message(&self) -> Result<Message, EventError> {
        Ok(Message::new(self.product_id.as_str(), self.encode()?)
            .with_header(HEADER_EVENT_TYPE, self.event_type.as_str())
            .with_header(HEADER_CORRELATION_ID, self.correlation_id.to_string()))
    }
}

/// Published stock snapshot of one product.
///
/// This is both the body of the state topic and the entry type of the
/// coordinator's in-memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryState {
    /// Product identity
    pub product_id: ProductId,
    /// Units that can be reserved
    pub available_stock: u32,
    /// Units held by active reservations
    pub reserved_stock: u32,
    /// `available + reserved`
    pub total_stock: u32,
    /// Ledger version this snapshot was taken at
    pub version: u64,
    /// Time of the mutation that produced this version
    pub last_updated: DateTime<Utc>,
}

impl InventoryState {
    /// Whether `quantity` units are available.
    #[must_use]
    pub const fn is_available(&self, quantity: u32) -> bool {
        self.available_stock >= quantity
    }

    /// Channel message keyed by product with a version header.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn to_message(&self) -> Result<Message, EventError> {
        let payload = serde_json::to_vec(self).map_err(|e| EventError::Encode(e.to_string()))?;
        Ok(Message::new(self.product_id.as_str(), payload)
            .with_header(HEADER_VERSION, self.version.to_string()))
    }

    /// Deserialize a state body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] for malformed payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Decode(e.to_string()))
    }
}

impl From<&StockRecord> for InventoryState {
    fn from(record: &StockRecord) -> Self {
        Self {
            product_id: record.product_id.clone(),
            available_stock: record.counts.available(),
            reserved_stock: record.counts.reserved(),
            total_stock: record.counts.total(),
            version: record.version,
            last_updated: record.updated_at,
        }
    }
}
