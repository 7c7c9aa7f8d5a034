//! In-memory stock snapshots.
//!
//! The cache is not authoritative: entries are filled from the stock ledger
//! on miss and replaced after every applied mutation. One lock guards the
//! whole map, so a reader sees either the old or the new snapshot, never a
//! mix.

use parking_lot::RwLock;
use std::collections::HashMap;
use stockflow_core::event::InventoryState;
use stockflow_core::types::ProductId;

/// Map of product ID to its latest known snapshot.
#[derive(Debug, Default)]
pub struct StockCache {
    entries: RwLock<HashMap<ProductId, InventoryState>>,
}

impl StockCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `product_id`, if cached.
    #[must_use]
    pub fn get(&self, product_id: &ProductId) -> Option<InventoryState> {
        self.entries.read().get(product_id).cloned()
    }

    /// Store `state` unless a newer version is already cached.
    ///
    /// Returns whether the entry was written.
    pub fn upsert(&self, state: InventoryState) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&state.product_id) {
            Some(current) if current.version > state.version => false,
            _ => {
                entries.insert(state.product_id.clone(), state);
                true
            },
        }
    }

    /// Drop the entry for `product_id`.
    pub fn invalidate(&self, product_id: &ProductId) {
        self.entries.write().remove(product_id);
    }

    /// Number of cached products.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn state(version: u64, available: u32) -> InventoryState {
        InventoryState {
            product_id: ProductId::new("sku-1"),
            available_stock: available,
            reserved_stock: 10 - available,
            total_stock: 10,
            version,
            last_updated: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn newer_versions_replace_older_ones() {
        let cache = StockCache::new();
        assert!(cache.upsert(state(1, 10)));
        assert!(cache.upsert(state(2, 7)));
        assert_eq!(cache.get(&ProductId::new("sku-1")).map(|s| s.available_stock), Some(7));
    }

    #[test]
    fn stale_fill_does_not_overwrite_newer_write() {
        let cache = StockCache::new();
        cache.upsert(state(3, 4));
        assert!(!cache.upsert(state(2, 9)));
        assert_eq!(cache.get(&ProductId::new("sku-1")).map(|s| s.version), Some(3));
    }

    #[test]
    fn invalidate_removes_the_entry() {
        let cache = StockCache::new();
        cache.upsert(state(1, 10));
        cache.invalidate(&ProductId::new("sku-1"));
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }
}
