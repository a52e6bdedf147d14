//! Index advisor
//!
//! Ensures a composite index exists for a (label, dimension-key-set) before
//! the first merge that relies on it, and memoizes confirmed successes for
//! the life of the process. "Already exists" from the store counts as
//! success; any other failure is reported to the caller as retryable and is
//! deliberately NOT cached, so the next message tries again.

use crate::{GraphStore, StoreError};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

/// Canonical cache key: label plus sorted dimension names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub label: String,
    pub properties: Vec<String>,
}

impl IndexKey {
    pub fn new(label: &str, dimension_keys: &[String]) -> Self {
        let mut properties = dimension_keys.to_vec();
        properties.sort();
        properties.dedup();
        Self {
            label: label.to_owned(),
            properties,
        }
    }
}

/// Process-lifetime index cache. Entries are rebuilt (idempotently) after a
/// restart.
#[derive(Debug, Default)]
pub struct IndexAdvisor {
    cache: Mutex<HashSet<IndexKey>>,
}

impl IndexAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a composite index exists for every label in `labels` over the
    /// given dimension keys.
    pub async fn ensure(
        &self,
        store: &dyn GraphStore,
        labels: &[String],
        dimension_keys: &[String],
    ) -> Result<(), StoreError> {
        for label in labels {
            let key = IndexKey::new(label, dimension_keys);
            if self.cache.lock().contains(&key) {
                continue;
            }
            match store.create_index(&key.label, &key.properties).await {
                Ok(()) => {
                    debug!(label = %key.label, props = ?key.properties, "index created");
                }
                Err(err) if err.is_already_exists() => {
                    debug!(label = %key.label, "index already present");
                }
                // Unconfirmed: leave the cache alone so the next message
                // retries the creation.
                Err(err) => return Err(err),
            }
            self.cache.lock().insert(key);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, label: &str, dimension_keys: &[String]) -> bool {
        self.cache
            .lock()
            .contains(&IndexKey::new(label, dimension_keys))
    }
}
