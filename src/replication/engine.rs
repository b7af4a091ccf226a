//! The replication engine
//!
//! `Replicator` fans one inbound API call out to every target node through
//! a bounded worker pool and hands the caller an aggregator to poll. For
//! mutating requests with verification enabled it runs a two-phase commit:
//! a verification round in which every node must answer the sentinel 150,
//! then the apply round. The verification round is modeled as an explicit
//! state machine ([`VerificationRound`]) rather than recursion through the
//! public entry point.

use crate::cluster::{ClusterDirectory, EventSink, FlowState, FlowStateTracker, NodeId};
use crate::common::headers;
use crate::common::ReplicatorConfig;
use crate::merge::ResponseMerger;
use crate::replication::aggregator::{AggregatorHook, FatalError, ResponseAggregator};
use crate::replication::client::NodeDispatcher;
use crate::replication::guard::{self, StateGuard};
use crate::replication::registry::RequestRegistry;
use crate::replication::request::{rewrite_for_node, Entity, NodeRequest};
use crate::replication::response::{NodeResponse, NodeResult};
use crate::replication::slow::SlowNodeMonitor;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

const SUPPORTED_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::POST,
    Method::PUT,
    Method::DELETE,
];

/// Invoked after all of a request's node responses have been gathered.
/// A returned error is logged and does not affect the request.
pub trait CompletionCallback: Send + Sync {
    fn after_request(
        &self,
        method: &Method,
        uri_path: &str,
        results: &[NodeResult],
    ) -> crate::Result<()>;
}

struct Inner {
    config: ReplicatorConfig,
    dispatcher: Arc<dyn NodeDispatcher>,
    guard: StateGuard,
    merger: Arc<dyn ResponseMerger>,
    flow_tracker: Arc<dyn FlowStateTracker>,
    completion: Option<Arc<dyn CompletionCallback>>,
    registry: RequestRegistry,
    slow_nodes: SlowNodeMonitor,
    workers: Semaphore,
    running: AtomicBool,
    shutdown: Notify,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Cluster-wide request replicator. Cheap to clone; all clones share the
/// same registry, worker pool and counters.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        dispatcher: Arc<dyn NodeDispatcher>,
        directory: Arc<dyn ClusterDirectory>,
        merger: Arc<dyn ResponseMerger>,
        completion: Option<Arc<dyn CompletionCallback>>,
        events: Arc<dyn EventSink>,
        flow_tracker: Arc<dyn FlowStateTracker>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let inner = Inner {
            registry: RequestRegistry::new(config.max_concurrent),
            slow_nodes: SlowNodeMonitor::new(config.slow_factor, config.slow_strikes, events),
            workers: Semaphore::new(config.num_threads),
            guard: StateGuard::new(directory),
            config,
            dispatcher,
            merger,
            flow_tracker,
            completion,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            maintenance: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start accepting requests and spawn the maintenance loop that evicts
    /// completed, unconsumed aggregators after the configured TTL.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    _ = interval.tick() => {
                        for aggregator in inner.registry.expired(inner.config.entry_ttl()) {
                            tracing::debug!(
                                "Evicting expired request {} that was never consumed",
                                aggregator.request_id()
                            );
                            aggregator.fire_consumed();
                        }
                    }
                }
            }
        });
        *self.inner.maintenance.lock().unwrap() = Some(handle);
    }

    /// Stop accepting requests and shut the maintenance loop down.
    /// In-flight node requests drain on their own worker tasks.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        let handle = self.inner.maintenance.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of in-flight cluster requests.
    pub fn outstanding(&self) -> usize {
        self.inner.registry.len()
    }

    /// Polling lookup. Returns `None` once the request has been consumed or
    /// swept by maintenance.
    pub fn get(&self, request_id: &str) -> Option<Arc<ResponseAggregator>> {
        self.inner.registry.lookup(request_id)
    }

    /// Replicate one request to every node in `target_nodes` and return the
    /// aggregator the caller polls for the merged answer.
    ///
    /// Returns as soon as the node requests are submitted; network I/O runs
    /// on the worker pool. With `verify` set, mutating requests go through
    /// the two-phase protocol and cluster-state validation; read-only
    /// requests are always single-phase.
    pub async fn replicate(
        &self,
        target_nodes: &[NodeId],
        method: Method,
        uri: Url,
        entity: Entity,
        headers: HeaderMap,
        verify: bool,
    ) -> crate::Result<Arc<ResponseAggregator>> {
        if !self.is_running() {
            return Err(crate::Error::NotRunning);
        }
        if target_nodes.is_empty() {
            return Err(crate::Error::InvalidArgument(
                "cannot replicate request to 0 nodes".into(),
            ));
        }
        if !SUPPORTED_METHODS.contains(&method) {
            return Err(crate::Error::InvalidArgument(format!(
                "HTTP method {} not supported for request replication",
                method
            )));
        }
        if uri.scheme() != "http" && uri.scheme() != "https" {
            return Err(crate::Error::InvalidArgument(format!(
                "unsupported URI scheme {}",
                uri.scheme()
            )));
        }

        let targets: HashSet<NodeId> = target_nodes.iter().cloned().collect();

        let mut headers = headers;
        let request_id = headers::ensure_transaction_id(&mut headers)?;

        if verify {
            self.inner.guard.check(&method, uri.path())?;
        }

        tracing::debug!(
            "Replicating request {} {} to {} nodes (Request ID {})",
            method,
            uri.path(),
            targets.len(),
            request_id
        );

        let aggregator = Arc::new(ResponseAggregator::new(
            request_id.clone(),
            method.clone(),
            uri.path().to_string(),
            targets.clone(),
            self.inner.merger.clone(),
            Some(self.completion_hook()),
            Some(self.consume_hook(request_id.clone())),
        ));
        self.inner
            .registry
            .insert(request_id, aggregator.clone())?;

        if guard::is_mutating(&method) && verify {
            self.begin_verification(aggregator.clone(), targets, method, uri, entity, headers);
        } else {
            self.submit_round(aggregator.clone(), targets, method, uri, entity, headers);
        }

        Ok(aggregator)
    }

    /// Hook run when an aggregator completes: flow-state bookkeeping, the
    /// user callback, then slow-node accounting.
    fn completion_hook(&self) -> AggregatorHook {
        let inner = self.inner.clone();
        Box::new(move |aggregator| {
            if guard::is_mutating(aggregator.method()) {
                inner.flow_tracker.set_flow_state(FlowState::Stale);
            }
            if let Some(callback) = &inner.completion {
                let results = aggregator.results();
                if let Err(e) =
                    callback.after_request(aggregator.method(), aggregator.uri_path(), &results)
                {
                    tracing::warn!(
                        "Completed request {} {} but the completion callback failed: {}",
                        aggregator.method(),
                        aggregator.uri_path(),
                        e
                    );
                }
            }
            inner.slow_nodes.observe(&aggregator.node_durations());
        })
    }

    fn consume_hook(&self, request_id: String) -> AggregatorHook {
        let inner = self.inner.clone();
        Box::new(move |_| {
            inner.registry.remove(&request_id);
        })
    }

    /// Submit one dispatch round (single-phase, or the apply round of a
    /// two-phase request); each completed node request lands in the public
    /// aggregator.
    fn submit_round(
        &self,
        aggregator: Arc<ResponseAggregator>,
        targets: HashSet<NodeId>,
        method: Method,
        uri: Url,
        entity: Entity,
        mut headers: HeaderMap,
    ) {
        headers::stamp_attempt_id(&mut headers);
        for node in targets {
            let url = match rewrite_for_node(&uri, &node) {
                Ok(url) => url,
                Err(e) => {
                    aggregator.add(NodeResponse::failed(
                        node,
                        method.clone(),
                        uri.clone(),
                        e.to_string(),
                        Instant::now(),
                        Duration::ZERO,
                    ));
                    continue;
                }
            };
            let request = NodeRequest::new(node, method.clone(), url, entity.clone(), headers.clone());
            let inner = self.inner.clone();
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                let response = dispatch_bounded(&inner, request).await;
                aggregator.add(response);
            });
        }
    }

    /// First phase of the two-phase commit: ask every node whether it can
    /// apply the request. Adjudication happens in [`VerificationRound`]
    /// once all nodes have answered.
    fn begin_verification(
        &self,
        public: Arc<ResponseAggregator>,
        targets: HashSet<NodeId>,
        method: Method,
        uri: Url,
        entity: Entity,
        headers: HeaderMap,
    ) {
        tracing::debug!(
            "Performing verification (first phase of two-phase commit) for Request ID {}",
            public.request_id()
        );

        // Until the mutation is adjudicated and applied, the persisted
        // state cannot be assumed current.
        self.inner.flow_tracker.set_flow_state(FlowState::Unknown);

        let mut verify_headers = headers.clone();
        verify_headers.insert(
            headers::VERIFY_INTENT,
            HeaderValue::from_static(headers::NODE_CONTINUE),
        );
        headers::stamp_attempt_id(&mut verify_headers);

        let round = Arc::new(VerificationRound {
            replicator: self.clone(),
            public,
            targets: targets.clone(),
            method,
            uri,
            entity,
            apply_headers: headers,
            collected: Mutex::new(Vec::new()),
        });

        for node in targets {
            let url = match rewrite_for_node(&round.uri, &node) {
                Ok(url) => url,
                Err(e) => {
                    // counts as a dissent from this node
                    let response = NodeResponse::failed(
                        node,
                        round.method.clone(),
                        round.uri.clone(),
                        e.to_string(),
                        Instant::now(),
                        Duration::ZERO,
                    );
                    let round = round.clone();
                    tokio::spawn(async move {
                        round.record(response).await;
                    });
                    continue;
                }
            };
            let request = NodeRequest::new(
                node,
                round.method.clone(),
                url,
                round.entity.clone(),
                verify_headers.clone(),
            );
            let inner = self.inner.clone();
            let round = round.clone();
            tokio::spawn(async move {
                let response = dispatch_bounded(&inner, request).await;
                round.record(response).await;
            });
        }
    }
}

/// Run one node request under a worker-pool permit. The permit is held for
/// the duration of the network I/O, which bounds parallelism at
/// `num_threads`; the semaphore queue is FIFO.
async fn dispatch_bounded(inner: &Arc<Inner>, request: NodeRequest) -> NodeResponse {
    match inner.workers.acquire().await {
        Ok(_permit) => inner.dispatcher.dispatch(request).await,
        Err(_) => NodeResponse::failed(
            request.node.clone(),
            request.method.clone(),
            request.url.clone(),
            "replicator is shutting down",
            Instant::now(),
            Duration::ZERO,
        ),
    }
}

/// Collects verification-round responses and adjudicates once all targets
/// have answered. Unanimous acceptance launches the apply round on the
/// public aggregator; any dissent fails the request without applying.
struct VerificationRound {
    replicator: Replicator,
    public: Arc<ResponseAggregator>,
    targets: HashSet<NodeId>,
    method: Method,
    uri: Url,
    entity: Entity,
    apply_headers: HeaderMap,
    collected: Mutex<Vec<NodeResponse>>,
}

impl VerificationRound {
    async fn record(&self, response: NodeResponse) {
        let ready = {
            let mut collected = self.collected.lock().unwrap();
            collected.push(response);
            collected.len() == self.targets.len()
        };
        if ready {
            self.adjudicate().await;
        }
    }

    async fn adjudicate(&self) {
        let responses = std::mem::take(&mut *self.collected.lock().unwrap());
        let dissents = responses.iter().filter(|r| r.is_dissent()).count();

        if dissents == 0 {
            tracing::debug!(
                "Received verification from all {} nodes that mutable request {} {} can be made",
                self.targets.len(),
                self.method,
                self.uri.path()
            );
            // accepting bodies are dropped unread
            self.replicator.submit_round(
                self.public.clone(),
                self.targets.clone(),
                self.method.clone(),
                self.uri.clone(),
                self.entity.clone(),
                self.apply_headers.clone(),
            );
            return;
        }

        // first dissent in arrival order is the primary cause
        let Some(first) = responses.iter().find(|r| r.is_dissent()) else {
            return;
        };

        let explanation = match first.status {
            Some(status) => {
                let body = match first.body().take() {
                    Some(reader) => reader.text().await.ok().filter(|t| !t.is_empty()),
                    None => None,
                };
                body.unwrap_or_else(|| format!("Unexpected Response Code {}", status.as_u16()))
            }
            None => first
                .error
                .clone()
                .unwrap_or_else(|| "Unexpected transport failure".to_string()),
        };

        tracing::info!(
            "Received a status of {:?} from {} for request {} {} when performing first stage of \
             two-stage commit; the request will not be applied",
            first.status.map(|s| s.as_u16()),
            first.node,
            self.method,
            self.uri.path()
        );

        self.public.set_fatal(FatalError::VerificationRejected {
            node: first.node.clone(),
            explanation,
            additional_dissents: dissents - 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{SharedFlowState, StaticClusterDirectory, TracingEventSink};
    use crate::merge::FirstResponseMerger;
    use async_trait::async_trait;

    struct NeverDispatcher;

    #[async_trait]
    impl NodeDispatcher for NeverDispatcher {
        async fn dispatch(&self, request: NodeRequest) -> NodeResponse {
            NodeResponse::failed(
                request.node,
                request.method,
                request.url,
                "unused",
                Instant::now(),
                Duration::ZERO,
            )
        }
    }

    fn replicator() -> Replicator {
        let nodes = vec![NodeId::new("a", "localhost", 1)];
        Replicator::new(
            ReplicatorConfig {
                num_threads: 1,
                ..Default::default()
            },
            Arc::new(NeverDispatcher),
            Arc::new(StaticClusterDirectory::new(nodes)),
            Arc::new(FirstResponseMerger),
            None,
            Arc::new(TracingEventSink),
            Arc::new(SharedFlowState::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_replicate_requires_running() {
        let replicator = replicator();
        let result = replicator
            .replicate(
                &[NodeId::new("a", "localhost", 1)],
                Method::GET,
                Url::parse("http://localhost/api").unwrap(),
                Entity::Empty,
                HeaderMap::new(),
                true,
            )
            .await;
        assert!(matches!(result, Err(crate::Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_replicate_rejects_empty_target_set() {
        let replicator = replicator();
        replicator.start();
        let result = replicator
            .replicate(
                &[],
                Method::GET,
                Url::parse("http://localhost/api").unwrap(),
                Entity::Empty,
                HeaderMap::new(),
                true,
            )
            .await;
        assert!(matches!(result, Err(crate::Error::InvalidArgument(_))));
        replicator.stop().await;
    }

    #[tokio::test]
    async fn test_replicate_rejects_unsupported_method() {
        let replicator = replicator();
        replicator.start();
        let result = replicator
            .replicate(
                &[NodeId::new("a", "localhost", 1)],
                Method::PATCH,
                Url::parse("http://localhost/api").unwrap(),
                Entity::Empty,
                HeaderMap::new(),
                true,
            )
            .await;
        assert!(matches!(result, Err(crate::Error::InvalidArgument(_))));
        replicator.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let replicator = replicator();
        replicator.start();
        replicator.start();
        assert!(replicator.is_running());
        replicator.stop().await;
        replicator.stop().await;
        assert!(!replicator.is_running());
    }
}
