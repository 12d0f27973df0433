use crate::{error::Result, models::*};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub mod csv;

pub use self::csv::CsvFileAdapter;

/// Interface to an external policy/tuple source
#[async_trait]
pub trait PolicyAdapter: Send + Sync {
    /// Load every stored row
    async fn load(&self) -> Result<Vec<StoredRule>>;

    /// Persist a batch (deletes first, then writes). Either the whole batch
    /// is stored or an error is returned and nothing is.
    async fn write(&self, batch: &WriteBatch) -> Result<()>;
}

/// In-memory adapter for testing and development
pub struct InMemoryAdapter {
    /// Row -> number of stored copies
    rows: Arc<DashMap<StoredRule, usize>>,
    batch_lock: tokio::sync::Mutex<()>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            batch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = StoredRule>,
    {
        let adapter = Self::new();
        for row in rows {
            *adapter.rows.entry(row).or_insert(0) += 1;
        }
        adapter
    }

    pub fn len(&self) -> usize {
        self.rows.iter().map(|entry| *entry.value()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, row: &StoredRule) -> bool {
        self.rows.contains_key(row)
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyAdapter for InMemoryAdapter {
    async fn load(&self) -> Result<Vec<StoredRule>> {
        let _guard = self.batch_lock.lock().await;
        let mut rows = Vec::new();
        for entry in self.rows.iter() {
            for _ in 0..*entry.value() {
                rows.push(entry.key().clone());
            }
        }
        // DashMap iteration order is arbitrary
        rows.sort_by(|a, b| (&a.ptype, &a.values).cmp(&(&b.ptype, &b.values)));
        Ok(rows)
    }

    async fn write(&self, batch: &WriteBatch) -> Result<()> {
        let _guard = self.batch_lock.lock().await;
        for row in &batch.deletes {
            self.rows.remove(row);
        }
        for row in &batch.writes {
            *self.rows.entry(row.clone()).or_insert(0) += 1;
        }
        debug!(
            writes = batch.writes.len(),
            deletes = batch.deletes.len(),
            "Applied batch to in-memory adapter"
        );
        Ok(())
    }
}
