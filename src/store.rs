use crate::{
    error::Result,
    model::{TradeEntry, TradeId},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Durable trade ledger.
///
/// `save` replaces the whole entry atomically; a failed save must leave the previously
/// stored entry intact.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save(&self, entry: &TradeEntry) -> Result<()>;

    async fn load(&self, trade_id: &TradeId) -> Result<Option<TradeEntry>>;

    async fn list_non_terminal(&self) -> Result<Vec<TradeEntry>>;

    async fn list_all(&self) -> Result<Vec<TradeEntry>>;
}

/// In-process store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<TradeId, TradeEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save(&self, entry: &TradeEntry) -> Result<()> {
        self.entries.write().insert(entry.trade_id.clone(), entry.clone());
        Ok(())
    }

    async fn load(&self, trade_id: &TradeId) -> Result<Option<TradeEntry>> {
        Ok(self.entries.read().get(trade_id).cloned())
    }

    async fn list_non_terminal(&self) -> Result<Vec<TradeEntry>> {
        let mut entries: Vec<TradeEntry> = self
            .entries
            .read()
            .values()
            .filter(|entry| !entry.is_terminal())
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn list_all(&self) -> Result<Vec<TradeEntry>> {
        let mut entries: Vec<TradeEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }
}
