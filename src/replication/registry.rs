//! Process-wide map from RequestID to aggregator
//!
//! The registry enforces the in-flight cluster-request cap and is swept
//! periodically by the maintenance loop. The capacity check and insert are
//! atomic under a single lock.

use crate::replication::aggregator::ResponseAggregator;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct RequestRegistry {
    max_concurrent: usize,
    entries: Mutex<HashMap<String, Arc<ResponseAggregator>>>,
}

impl RequestRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an aggregator, failing when the registry is at capacity or
    /// the id is already live.
    pub fn insert(&self, request_id: String, aggregator: Arc<ResponseAggregator>) -> crate::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_concurrent {
            return Err(crate::Error::Overloaded {
                outstanding: entries.len(),
            });
        }
        if entries.contains_key(&request_id) {
            return Err(crate::Error::InvalidArgument(format!(
                "request {} is already in flight",
                request_id
            )));
        }
        entries.insert(request_id, aggregator);
        Ok(())
    }

    pub fn lookup(&self, request_id: &str) -> Option<Arc<ResponseAggregator>> {
        self.entries.lock().unwrap().get(request_id).cloned()
    }

    pub fn remove(&self, request_id: &str) -> Option<Arc<ResponseAggregator>> {
        self.entries.lock().unwrap().remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completed entries older than `age`, due for eviction. The caller
    /// runs the consumption path on each so hooks observe exactly-once
    /// semantics; the hook removes the entry.
    pub fn expired(&self, age: Duration) -> Vec<Arc<ResponseAggregator>> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|agg| agg.is_complete() && agg.is_older_than(age))
            .cloned()
            .collect()
    }
}
