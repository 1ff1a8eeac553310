//! Process-wide monotonic counters for observability hooks.
//!
//! A bare minimum counters implementation: a name → integer map with atomic
//! increments. Values are published by the process harness (stats exporter,
//! admin endpoint); the core only writes to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::error::FcrErrorCode;

#[derive(Default, Debug)]
pub struct Counters {
    inner: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.inner.read().expect("counters lock").get(name) {
            return c.clone();
        }
        let mut map = self.inner.write().expect("counters lock");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Pre-register a counter so it shows up in snapshots even when zero.
    pub fn register(&self, name: &str) {
        self.cell(name);
    }

    pub fn increment(&self, name: &str) {
        self.cell(name).fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_by(&self, name: &str, amount: u64) {
        self.cell(name).fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set(&self, name: &str, value: u64) {
        self.cell(name).store(value, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner
            .read()
            .expect("counters lock")
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Bump the per-code error counter, e.g. `error.CONNECTION_TIMEOUT_ERROR`.
    pub fn count_error(&self, code: FcrErrorCode) {
        self.increment(&format!("error.{}", code.name()));
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner
            .read()
            .expect("counters lock")
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Snapshot of counters whose name matches `pattern`.
    pub fn matching(&self, pattern: &Regex) -> HashMap<String, u64> {
        self.snapshot()
            .into_iter()
            .filter(|(k, _)| pattern.is_match(k))
            .collect()
    }
}
