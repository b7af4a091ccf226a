//! Outbound HTTP to a single node
//!
//! `NodeClient` is pure I/O: one request in, one `NodeResponse` out, bounded
//! by the configured connect and read timeouts. Failures of any kind are
//! folded into the response, never returned as errors, so a worker task can
//! always hand its result to the aggregator.

use crate::common::headers;
use crate::common::ReplicatorConfig;
use crate::replication::request::{Entity, NodeRequest};
use crate::replication::response::{BodyHandle, NodeResponse};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::time::Instant;

/// Dispatches one node request and produces its response.
///
/// The production implementation is [`NodeClient`]; tests substitute a
/// scripted dispatcher to drive the replication engine without sockets.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn dispatch(&self, request: NodeRequest) -> NodeResponse;
}

/// HTTP client shared by all worker tasks.
pub struct NodeClient {
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new(config: &ReplicatorConfig) -> crate::Result<Self> {
        // Total budget is connect + read; reqwest's `timeout` spans the
        // whole exchange, so an unresponsive peer cannot hold a worker
        // past both bounds.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .build()?;
        Ok(Self { client })
    }

    /// Construct the outbound request. Form parameters go to the query
    /// string for side-effect-free methods and to the entity for POST/PUT;
    /// `Content-Type` defaults to form-urlencoded when the method carries a
    /// body and the caller did not set one.
    pub fn build_request(&self, request: &NodeRequest) -> crate::Result<reqwest::Request> {
        let side_effect_free = matches!(
            request.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE
        );

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        builder = match (&request.entity, side_effect_free) {
            (Entity::Form(params), true) => builder.query(params),
            (Entity::Form(params), false) => builder.form(params),
            (Entity::Bytes(bytes), _) => builder.body(bytes.clone()),
            (Entity::Empty, _) => builder,
        };

        builder = builder.headers(request.headers.clone());

        let mut built = builder.build()?;
        if !side_effect_free && !built.headers().contains_key(CONTENT_TYPE) {
            built.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        }
        Ok(built)
    }
}

#[async_trait]
impl NodeDispatcher for NodeClient {
    async fn dispatch(&self, request: NodeRequest) -> NodeResponse {
        let started = Instant::now();

        let built = match self.build_request(&request) {
            Ok(built) => built,
            Err(e) => {
                return NodeResponse::failed(
                    request.node,
                    request.method,
                    request.url,
                    e.to_string(),
                    started,
                    started.elapsed(),
                );
            }
        };

        let attempt_id = request
            .headers
            .get(headers::REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        tracing::debug!(
            "Replicating request {} {} to {} (attempt {})",
            request.method,
            request.url.path(),
            request.node,
            attempt_id
        );

        match self.client.execute(built).await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                NodeResponse::received(
                    request.node,
                    request.method,
                    request.url,
                    status,
                    headers,
                    BodyHandle::from_response(response),
                    started,
                    started.elapsed(),
                )
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to replicate request {} {} to {}: {}",
                    request.method,
                    request.url.path(),
                    request.node,
                    e
                );
                NodeResponse::failed(
                    request.node,
                    request.method,
                    request.url,
                    e.to_string(),
                    started,
                    started.elapsed(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeId;
    use reqwest::header::HeaderMap;
    use reqwest::Url;

    fn client() -> NodeClient {
        NodeClient::new(&ReplicatorConfig {
            num_threads: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn node_request(method: Method, entity: Entity, headers: HeaderMap) -> NodeRequest {
        NodeRequest::new(
            NodeId::new("n1", "127.0.0.1", 8080),
            method,
            Url::parse("http://127.0.0.1:8080/api/things").unwrap(),
            entity,
            headers,
        )
    }

    #[test]
    fn test_get_params_become_query_string() {
        let entity = Entity::Form(vec![("verbose".into(), "true".into())]);
        let request = node_request(Method::GET, entity, HeaderMap::new());
        let built = client().build_request(&request).unwrap();
        assert_eq!(built.url().query(), Some("verbose=true"));
        assert!(built.body().is_none());
    }

    #[test]
    fn test_put_params_become_entity() {
        let entity = Entity::Form(vec![("x".into(), "1".into())]);
        let request = node_request(Method::PUT, entity, HeaderMap::new());
        let built = client().build_request(&request).unwrap();
        assert_eq!(built.url().query(), None);
        assert_eq!(built.body().unwrap().as_bytes(), Some(&b"x=1"[..]));
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn test_default_content_type_only_when_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let entity = Entity::Bytes(bytes::Bytes::from_static(b"{}"));
        let request = node_request(Method::POST, entity, headers);
        let built = client().build_request(&request).unwrap();
        assert_eq!(built.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_post_without_content_type_gets_default() {
        let entity = Entity::Bytes(bytes::Bytes::from_static(b"x=1"));
        let request = node_request(Method::POST, entity, HeaderMap::new());
        let built = client().build_request(&request).unwrap();
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
    }
}
