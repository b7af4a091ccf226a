//! Per-cluster-request response collection and consumption
//!
//! One `ResponseAggregator` exists per cluster request. Worker tasks add
//! node responses as they arrive; the caller polls it (or awaits
//! completion) and consumes it once to obtain the merged payload. State
//! transitions are serialized by an internal mutex; hooks run outside the
//! lock, after the transition that triggered them.

use crate::cluster::NodeId;
use crate::merge::{MergedResponse, ResponseMerger};
use crate::replication::response::{NodeResponse, NodeResult};
use reqwest::Method;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OnceCell};

/// Terminal failure of a cluster request. Recorded once; consumption
/// surfaces it instead of a merged payload.
#[derive(Debug, Clone)]
pub enum FatalError {
    VerificationRejected {
        node: NodeId,
        explanation: String,
        additional_dissents: usize,
    },
    Merge(String),
}

impl From<FatalError> for crate::Error {
    fn from(fatal: FatalError) -> Self {
        match fatal {
            FatalError::VerificationRejected {
                node,
                explanation,
                additional_dissents,
            } => {
                let explanation = if additional_dissents > 0 {
                    format!(
                        "{} ({} additional node(s) also dissented)",
                        explanation, additional_dissents
                    )
                } else {
                    explanation
                };
                crate::Error::VerificationRejected { node, explanation }
            }
            FatalError::Merge(message) => crate::Error::Merge(message),
        }
    }
}

/// Hook invoked with the aggregator after a state transition.
pub type AggregatorHook = Box<dyn Fn(&ResponseAggregator) + Send + Sync>;

struct AggregatorState {
    received: Vec<NodeResponse>,
    completed_at: Option<Instant>,
    consumed_at: Option<Instant>,
    fatal: Option<FatalError>,
    /// Body-less snapshot taken when the responses move into the merger,
    /// so polling keeps working after consumption.
    summaries: Option<Vec<NodeResult>>,
}

pub struct ResponseAggregator {
    request_id: String,
    method: Method,
    uri_path: String,
    expected: HashSet<NodeId>,
    merger: Arc<dyn ResponseMerger>,
    state: Mutex<AggregatorState>,
    merged: OnceCell<Result<MergedResponse, FatalError>>,
    consume_fired: AtomicBool,
    completion: Notify,
    created_at: Instant,
    on_complete: Option<AggregatorHook>,
    on_consume: Option<AggregatorHook>,
}

impl ResponseAggregator {
    pub fn new(
        request_id: String,
        method: Method,
        uri_path: String,
        expected: HashSet<NodeId>,
        merger: Arc<dyn ResponseMerger>,
        on_complete: Option<AggregatorHook>,
        on_consume: Option<AggregatorHook>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri_path,
            expected,
            merger,
            state: Mutex::new(AggregatorState {
                received: Vec::new(),
                completed_at: None,
                consumed_at: None,
                fatal: None,
                summaries: None,
            }),
            merged: OnceCell::new(),
            consume_fired: AtomicBool::new(false),
            completion: Notify::new(),
            created_at: Instant::now(),
            on_complete,
            on_consume,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri_path(&self) -> &str {
        &self.uri_path
    }

    pub fn expected_nodes(&self) -> &HashSet<NodeId> {
        &self.expected
    }

    /// Record one node response. Responses from unexpected nodes and
    /// duplicates are ignored. The completion hook fires exactly once, on
    /// the call that collects the final expected response.
    pub fn add(&self, response: NodeResponse) {
        let completed = {
            let mut state = self.state.lock().unwrap();
            if !self.expected.contains(&response.node) {
                tracing::warn!(
                    "Ignoring response from {} for request {}: node is not a target",
                    response.node,
                    self.request_id
                );
                return;
            }
            if state.received.iter().any(|r| r.node == response.node) {
                tracing::debug!(
                    "Ignoring duplicate response from {} for request {}",
                    response.node,
                    self.request_id
                );
                return;
            }
            state.received.push(response);
            if state.completed_at.is_none() && state.received.len() == self.expected.len() {
                state.completed_at = Some(Instant::now());
                true
            } else {
                false
            }
        };

        if completed {
            self.finish();
        }
    }

    /// Mark the request failed. The first fatal error wins; the aggregator
    /// completes immediately if it had not already. Responses may still be
    /// added afterwards, but no merge will be attempted.
    pub fn set_fatal(&self, fatal: FatalError) {
        let completed = {
            let mut state = self.state.lock().unwrap();
            if state.fatal.is_none() {
                state.fatal = Some(fatal);
            }
            if state.completed_at.is_none() {
                state.completed_at = Some(Instant::now());
                true
            } else {
                false
            }
        };

        if completed {
            self.finish();
        }
    }

    fn finish(&self) {
        self.completion.notify_waiters();
        if let Some(hook) = &self.on_complete {
            hook(self);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().completed_at.is_some()
    }

    pub fn is_older_than(&self, age: Duration) -> bool {
        self.created_at.elapsed() > age
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.state.lock().unwrap().fatal.clone()
    }

    /// Body-less view of a single node's response, if it has arrived.
    pub fn get(&self, node: &NodeId) -> Option<NodeResult> {
        let state = self.state.lock().unwrap();
        if let Some(summaries) = &state.summaries {
            summaries.iter().find(|r| &r.node == node).cloned()
        } else {
            state
                .received
                .iter()
                .find(|r| &r.node == node)
                .map(|r| r.summary())
        }
    }

    /// Body-less views of every response received so far, in arrival order.
    pub fn results(&self) -> Vec<NodeResult> {
        let state = self.state.lock().unwrap();
        if let Some(summaries) = &state.summaries {
            summaries.clone()
        } else {
            state.received.iter().map(|r| r.summary()).collect()
        }
    }

    /// Per-node request durations observed so far.
    pub fn node_durations(&self) -> Vec<(NodeId, Duration)> {
        self.results()
            .into_iter()
            .map(|r| (r.node, r.duration))
            .collect()
    }

    /// Wait until the aggregator completes (all responses in, or fatal).
    pub async fn wait_complete(&self) {
        loop {
            let notified = self.completion.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// Consume the aggregator: run the merger once over the collected
    /// responses and return the merged payload, or the fatal error if one
    /// was recorded. Idempotent; repeated calls return the same outcome and
    /// the consumption hook fires exactly once.
    pub async fn consume(&self) -> crate::Result<MergedResponse> {
        // fatal and completion must come from one snapshot: set_fatal writes
        // both fields under the same lock, and a concurrent set_fatal slipping
        // between two separate reads would let the merge run
        let (fatal, complete) = {
            let state = self.state.lock().unwrap();
            (state.fatal.clone(), state.completed_at.is_some())
        };

        if let Some(fatal) = fatal {
            self.fire_consumed();
            return Err(fatal.into());
        }

        if !complete {
            return Err(crate::Error::Incomplete(self.request_id.clone()));
        }

        let outcome = self
            .merged
            .get_or_init(|| async {
                let responses = {
                    let mut state = self.state.lock().unwrap();
                    state.summaries =
                        Some(state.received.iter().map(|r| r.summary()).collect());
                    std::mem::take(&mut state.received)
                };
                match self
                    .merger
                    .merge(&self.method, &self.uri_path, responses)
                    .await
                {
                    Ok(merged) => Ok(merged),
                    Err(e) => Err(FatalError::Merge(e.to_string())),
                }
            })
            .await
            .clone();

        if let Err(fatal) = &outcome {
            let mut state = self.state.lock().unwrap();
            if state.fatal.is_none() {
                state.fatal = Some(fatal.clone());
            }
        }

        self.fire_consumed();
        outcome.map_err(Into::into)
    }

    /// Run the consumption side effects exactly once across explicit
    /// consumption and TTL eviction.
    pub(crate) fn fire_consumed(&self) {
        if self.consume_fired.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.consumed_at.is_none() {
                state.consumed_at = Some(Instant::now());
            }
        }

        self.log_timing();
        if let Some(hook) = &self.on_consume {
            hook(self);
        }
    }

    fn log_timing(&self) {
        let durations = self.node_durations();
        if durations.is_empty() {
            return;
        }
        let millis: Vec<u128> = durations.iter().map(|(_, d)| d.as_millis()).collect();
        let min = millis.iter().min().copied().unwrap_or(0);
        let max = millis.iter().max().copied().unwrap_or(0);
        let mean = millis.iter().sum::<u128>() / millis.len() as u128;
        tracing::debug!(
            "Node responses for {} {} (Request ID {}): min = {} ms, max = {} ms, mean = {} ms",
            self.method,
            self.uri_path,
            self.request_id,
            min,
            max,
            mean
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::FirstResponseMerger;
    use crate::replication::response::BodyHandle;
    use reqwest::header::HeaderMap;
    use reqwest::{StatusCode, Url};
    use std::sync::atomic::AtomicUsize;

    fn node(id: &str) -> NodeId {
        NodeId::new(id, "localhost", 1)
    }

    fn ok_response(id: &str, body: &'static str) -> NodeResponse {
        NodeResponse::received(
            node(id),
            Method::GET,
            Url::parse("http://localhost:1/api").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            BodyHandle::from_bytes(body),
            Instant::now(),
            Duration::from_millis(10),
        )
    }

    fn aggregator(
        targets: &[&str],
        on_complete: Option<AggregatorHook>,
        on_consume: Option<AggregatorHook>,
    ) -> ResponseAggregator {
        ResponseAggregator::new(
            "req-1".into(),
            Method::GET,
            "/api".into(),
            targets.iter().map(|id| node(id)).collect(),
            Arc::new(FirstResponseMerger),
            on_complete,
            on_consume,
        )
    }

    #[test]
    fn test_completion_hook_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let agg = aggregator(
            &["a", "b"],
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );

        agg.add(ok_response("a", ""));
        assert!(!agg.is_complete());
        agg.add(ok_response("b", ""));
        assert!(agg.is_complete());
        // duplicate after completion changes nothing
        agg.add(ok_response("b", ""));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(agg.results().len(), 2);
    }

    #[test]
    fn test_unexpected_node_is_ignored() {
        let agg = aggregator(&["a"], None, None);
        agg.add(ok_response("stranger", ""));
        assert!(!agg.is_complete());
        assert!(agg.get(&node("stranger")).is_none());
    }

    #[test]
    fn test_set_fatal_completes_and_first_fatal_wins() {
        let agg = aggregator(&["a", "b"], None, None);
        agg.set_fatal(FatalError::VerificationRejected {
            node: node("a"),
            explanation: "conflict".into(),
            additional_dissents: 0,
        });
        assert!(agg.is_complete());
        agg.set_fatal(FatalError::Merge("later".into()));
        assert!(matches!(
            agg.fatal_error(),
            Some(FatalError::VerificationRejected { .. })
        ));
        // responses still record after the fatal
        agg.add(ok_response("a", ""));
        assert_eq!(agg.results().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_is_idempotent_and_hook_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let agg = aggregator(
            &["a"],
            None,
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        agg.add(ok_response("a", "payload"));

        let first = agg.consume().await.unwrap();
        let second = agg.consume().await.unwrap();
        assert_eq!(first.body, second.body);
        assert_eq!(first.body, bytes::Bytes::from("payload"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // polling still works after consumption
        assert_eq!(agg.results().len(), 1);
        assert!(agg.get(&node("a")).is_some());
    }

    #[tokio::test]
    async fn test_consume_before_complete_is_an_error() {
        let agg = aggregator(&["a", "b"], None, None);
        agg.add(ok_response("a", ""));
        assert!(matches!(
            agg.consume().await,
            Err(crate::Error::Incomplete(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_surfaces_fatal_without_merging() {
        let agg = aggregator(&["a"], None, None);
        agg.set_fatal(FatalError::VerificationRejected {
            node: node("a"),
            explanation: "conflict".into(),
            additional_dissents: 0,
        });
        let err = agg.consume().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node a is unable to fulfill this request due to: conflict"
        );
    }

    #[tokio::test]
    async fn test_wait_complete_wakes_on_final_response() {
        let agg = Arc::new(aggregator(&["a"], None, None));
        let waiter = agg.clone();
        let handle = tokio::spawn(async move { waiter.wait_complete().await });
        tokio::task::yield_now().await;
        agg.add(ok_response("a", ""));
        handle.await.unwrap();
    }

    #[test]
    fn test_is_older_than() {
        let agg = aggregator(&["a"], None, None);
        assert!(agg.is_older_than(Duration::ZERO));
        assert!(!agg.is_older_than(Duration::from_secs(3600)));
    }
}
