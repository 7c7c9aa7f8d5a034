//! Per-product stock counts and their transitions.
//!
//! Every transition is a pure function from one [`StockCounts`] to the next and
//! is checked: it either returns counts that satisfy
//! `total = available + reserved` or an error, never wrapped or negative values.

use crate::types::ProductId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by stock arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Quantities must be strictly positive.
    #[error("Quantity must be greater than zero")]
    ZeroQuantity,

    /// Not enough available stock to place a hold.
    #[error("Insufficient stock: requested {requested}, available {available}")]
    Insufficient {
        /// Requested quantity
        requested: u32,
        /// Available quantity at the time of the check
        available: u32,
    },

    /// Releasing or confirming more than is currently reserved.
    #[error("Reserved stock underflow: requested {requested}, reserved {reserved}")]
    ReservedUnderflow {
        /// Quantity being confirmed or released
        requested: u32,
        /// Quantity currently reserved
        reserved: u32,
    },

    /// A count would exceed `u32::MAX`.
    #[error("Stock overflow")]
    Overflow,

    /// Counts do not balance.
    #[error("Stock invariant violated: total {total} != available {available} + reserved {reserved}")]
    Unbalanced {
        /// Total stock
        total: u32,
        /// Available stock
        available: u32,
        /// Reserved stock
        reserved: u32,
    },
}

/// The three stock counts of a product.
///
/// Counts are unsigned, so non-negativity holds by construction; balance is
/// checked by [`StockCounts::new`] and preserved by every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCounts")]
pub struct StockCounts {
    total: u32,
    available: u32,
    reserved: u32,
}

/// Unchecked wire form of [`StockCounts`].
#[derive(Deserialize)]
struct RawCounts {
    total: u32,
    available: u32,
    reserved: u32,
}

impl TryFrom<RawCounts> for StockCounts {
    type Error = StockError;

    fn try_from(raw: RawCounts) -> Result<Self, Self::Error> {
        Self::new(raw.total, raw.available, raw.reserved)
    }
}

impl StockCounts {
    /// Build balanced counts.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Unbalanced`] if `total != available + reserved`.
    pub fn new(total: u32, available: u32, reserved: u32) -> Result<Self, StockError> {
        let balanced = available
            .checked_add(reserved)
            .is_some_and(|sum| sum == total);
        if balanced {
            Ok(Self {
                total,
                available,
                reserved,
            })
        } else {
            Err(StockError::Unbalanced {
                total,
                available,
                reserved,
            })
        }
    }

    /// Fresh stock with nothing reserved.
    #[must_use]
    pub const fn with_total(total: u32) -> Self {
        Self {
            total,
            available: total,
            reserved: 0,
        }
    }

    /// Total stock
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }

    /// Stock that can still be reserved
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.available
    }

    /// Stock held by active reservations
    #[must_use]
    pub const fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Move `quantity` from available to reserved.
    ///
    /// # Errors
    ///
    /// [`StockError::ZeroQuantity`] or [`StockError::Insufficient`].
    pub const fn reserve(self, quantity: u32) -> Result<Self, StockError> {
        if quantity == 0 {
            return Err(StockError::ZeroQuantity);
        }
        if self.available < quantity {
            return Err(StockError::Insufficient {
                requested: quantity,
                available: self.available,
            });
        }
        Ok(Self {
            total: self.total,
            available: self.available - quantity,
            reserved: self.reserved + quantity,
        })
    }

    /// Reserved stock leaves the system: `reserved` and `total` both drop.
    ///
    /// # Errors
    ///
    /// [`StockError::ZeroQuantity`] or [`StockError::ReservedUnderflow`].
    pub const fn confirm(self, quantity: u32) -> Result<Self, StockError> {
        if quantity == 0 {
            return Err(StockError::ZeroQuantity);
        }
        if self.reserved < quantity {
            return Err(StockError::ReservedUnderflow {
                requested: quantity,
                reserved: self.reserved,
            });
        }
        Ok(Self {
            total: self.total - quantity,
            available: self.available,
            reserved: self.reserved - quantity,
        })
    }

    /// Move `quantity` from reserved back to available.
    ///
    /// # Errors
    ///
    /// [`StockError::ZeroQuantity`] or [`StockError::ReservedUnderflow`].
    pub const fn release(self, quantity: u32) -> Result<Self, StockError> {
        if quantity == 0 {
            return Err(StockError::ZeroQuantity);
        }
        if self.reserved < quantity {
            return Err(StockError::ReservedUnderflow {
                requested: quantity,
                reserved: self.reserved,
            });
        }
        Ok(Self {
            total: self.total,
            available: self.available + quantity,
            reserved: self.reserved - quantity,
        })
    }

    /// Add new units to both total and available.
    ///
    /// # Errors
    ///
    /// [`StockError::ZeroQuantity`] or [`StockError::Overflow`].
    pub const fn restock(self, quantity: u32) -> Result<Self, StockError> {
        if quantity == 0 {
            return Err(StockError::ZeroQuantity);
        }
        // available <= total, so checking total covers both.
        match self.total.checked_add(quantity) {
            Some(total) => Ok(Self {
                total,
                available: self.available + quantity,
                reserved: self.reserved,
            }),
            None => Err(StockError::Overflow),
        }
    }
}

/// Durable stock record of one product, as held by the stock ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    /// Product identity
    pub product_id: ProductId,
    /// Current counts
    pub counts: StockCounts,
    /// Incremented on every successful mutation
    pub version: u64,
    /// Time of the last mutation
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// A newly registered product: everything available, version 1.
    #[must_use]
    pub fn new(product_id: ProductId, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            counts: StockCounts::with_total(total),
            version: 1,
            updated_at: now,
        }
    }
}
