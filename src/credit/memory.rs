use std::collections::HashMap;
use std::sync::Mutex;

use super::amount::MicroUsd;

/// In-process fallback counters. Last tier of the chain, explicitly
/// non-durable and never shared across instances; exists so isolated tests
/// and prototype mode keep the same interfaces as production.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    daily: HashMap<(String, String), i64>,
    fences: HashMap<String, u64>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn daily_add(&self, account_id: &str, spending_date: &str, amount: MicroUsd) -> MicroUsd {
        let mut state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = state
            .daily
            .entry((account_id.to_string(), spending_date.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(amount.micros());
        MicroUsd::from_micros(*entry)
    }

    pub fn daily_get(&self, account_id: &str, spending_date: &str) -> Option<MicroUsd> {
        let state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .daily
            .get(&(account_id.to_string(), spending_date.to_string()))
            .copied()
            .map(MicroUsd::from_micros)
    }

    pub fn acquire_fence(&self, account_id: &str) -> u64 {
        let mut state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let token = state.fences.entry(account_id.to_string()).or_insert(0);
        *token = token.saturating_add(1);
        *token
    }
}
