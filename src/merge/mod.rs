//! Folding N per-node responses into one caller-visible answer
//!
//! Merging is a strategy plugged into the replicator; the engine only
//! guarantees that a merger runs at most once per cluster request, on first
//! consumption, and that it is the sole reader of response bodies.

use crate::replication::NodeResponse;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};

/// The merged, caller-visible result of a cluster request.
#[derive(Debug, Clone)]
pub struct MergedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Folds the collected node responses into one payload.
///
/// The merger owns the responses it is given, including their body handles;
/// bodies it does not read are dropped (and thereby closed) when the call
/// returns.
#[async_trait]
pub trait ResponseMerger: Send + Sync {
    async fn merge(
        &self,
        method: &Method,
        uri_path: &str,
        responses: Vec<NodeResponse>,
    ) -> crate::Result<MergedResponse>;
}

/// Returns the first successful node response verbatim, falling back to the
/// first response that produced any status at all. Suitable when all nodes
/// are expected to answer identically; richer deployments plug in their own
/// content-aware merger.
pub struct FirstResponseMerger;

#[async_trait]
impl ResponseMerger for FirstResponseMerger {
    async fn merge(
        &self,
        method: &Method,
        uri_path: &str,
        responses: Vec<NodeResponse>,
    ) -> crate::Result<MergedResponse> {
        let total = responses.len();
        let chosen = responses
            .iter()
            .position(|r| matches!(r.status, Some(s) if s.is_success()))
            .or_else(|| responses.iter().position(|r| r.status.is_some()));

        let Some(index) = chosen else {
            return Err(crate::Error::Merge(format!(
                "all {} nodes failed for {} {}",
                total, method, uri_path
            )));
        };

        let response = &responses[index];
        let status = response.status.unwrap();
        let headers = response.headers.clone();
        let body = match response.body().take() {
            Some(reader) => reader.bytes().await?,
            None => Bytes::new(),
        };

        Ok(MergedResponse {
            status,
            headers,
            body,
        })
    }
}
