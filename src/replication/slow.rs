//! Slow-node detection with hysteresis
//!
//! A node is slow for one request when its latency exceeds the configured
//! factor times the mean of that request's per-node durations. Three
//! consecutive slow observations produce one warning, then the counter
//! resets; any fast observation also resets it. Transient single-request
//! slowness is therefore never reported.

use crate::cluster::{EventSink, NodeId, Severity};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EVENT_CATEGORY: &str = "Node Response Time";

pub struct SlowNodeMonitor {
    factor: f64,
    strikes: u32,
    counters: Mutex<HashMap<NodeId, u32>>,
    events: Arc<dyn EventSink>,
}

impl SlowNodeMonitor {
    pub fn new(factor: f64, strikes: u32, events: Arc<dyn EventSink>) -> Self {
        Self {
            factor,
            strikes,
            counters: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Nodes whose duration exceeds `factor` times the request mean.
    fn outliers(&self, durations: &[(NodeId, Duration)]) -> HashSet<NodeId> {
        let mean =
            durations.iter().map(|(_, d)| d.as_secs_f64()).sum::<f64>() / durations.len() as f64;
        let threshold = mean * self.factor;
        durations
            .iter()
            .filter(|(_, d)| d.as_secs_f64() > threshold)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Fold one completed request's per-node durations into the counters,
    /// emitting a warning for any node that just reached the strike limit.
    pub fn observe(&self, durations: &[(NodeId, Duration)]) {
        if durations.is_empty() {
            return;
        }

        let slow = self.outliers(durations);
        let mut counters = self.counters.lock().unwrap();
        for (node, _) in durations {
            if slow.contains(node) {
                let counter = counters.entry(node.clone()).or_insert(0);
                *counter += 1;
                if *counter >= self.strikes {
                    let message = format!(
                        "Response time from {} was slow for each of the last {} requests made",
                        node, self.strikes
                    );
                    tracing::warn!("{}", message);
                    self.events
                        .report(Severity::Warning, EVENT_CATEGORY, &message);
                    *counter = 0;
                }
            } else {
                counters.insert(node.clone(), 0);
            }
        }
    }
}
