use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::engine::types::{Quote, QuoteUpdate};

/// Latest quote per contract id.
///
/// The gateway's ingestion task is the only writer. Readers take a cloned
/// snapshot so a tick never sees a half-applied update set.
#[derive(Debug, Clone, Default)]
pub struct QuoteBook {
    inner: Arc<RwLock<AHashMap<i64, Quote>>>,
}

pub type QuoteSnapshot = AHashMap<i64, Quote>;

impl QuoteBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Keeps any quote that already arrived.
    pub fn track(&self, con_id: i64) {
        self.inner.write().entry(con_id).or_insert_with(|| Quote::empty(con_id));
    }

    pub fn untrack(&self, con_id: i64) {
        self.inner.write().remove(&con_id);
    }

    /// Merge a partial update: fields missing from the message keep their previous value.
    /// Updates for contracts that were never tracked are dropped; returns whether it applied.
    pub fn apply(&self, update: QuoteUpdate) -> bool {
        let mut guard = self.inner.write();
        let Some(quote) = guard.get_mut(&update.con_id) else {
            return false;
        };
        if update.bid.is_some() {
            quote.bid = update.bid;
        }
        if update.ask.is_some() {
            quote.ask = update.ask;
        }
        if update.last.is_some() {
            quote.last = update.last;
        }
        quote.updated_ms = update.ts_ms;
        true
    }

    pub fn get(&self, con_id: i64) -> Option<Quote> {
        self.inner.read().get(&con_id).copied()
    }

    pub fn snapshot(&self) -> QuoteSnapshot {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
