//! Result of one node request
//!
//! A `NodeResponse` carries either a status line plus a single-consumer body
//! handle, or a transport error, never both. Bodies are streamed: whoever
//! takes the handle (the merger, or the dissent-explanation path during
//! verification) reads it exactly once.

use crate::cluster::NodeId;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Single-consumer handle to a response body.
#[derive(Debug)]
pub struct BodyHandle {
    source: Mutex<Option<BodySource>>,
}

#[derive(Debug)]
enum BodySource {
    Http(reqwest::Response),
    Bytes(Bytes),
}

impl BodyHandle {
    pub fn from_response(response: reqwest::Response) -> Self {
        Self {
            source: Mutex::new(Some(BodySource::Http(response))),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            source: Mutex::new(Some(BodySource::Bytes(bytes.into()))),
        }
    }

    pub fn empty() -> Self {
        Self {
            source: Mutex::new(None),
        }
    }

    /// Take the body for reading. Returns `None` if it was already taken.
    pub fn take(&self) -> Option<BodyReader> {
        self.source.lock().unwrap().take().map(BodyReader)
    }

    /// Drop the body without reading it, releasing the underlying stream.
    pub fn discard(&self) {
        self.source.lock().unwrap().take();
    }
}

/// Owned, one-shot reader produced by [`BodyHandle::take`].
#[derive(Debug)]
pub struct BodyReader(BodySource);

impl BodyReader {
    /// Read the entire body.
    pub async fn bytes(self) -> crate::Result<Bytes> {
        match self.0 {
            BodySource::Http(response) => response
                .bytes()
                .await
                .map_err(|e| crate::Error::Body(e.to_string())),
            BodySource::Bytes(bytes) => Ok(bytes),
        }
    }

    /// Read the entire body as UTF-8 text, lossily.
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Result of one node request.
#[derive(Debug)]
pub struct NodeResponse {
    pub node: NodeId,
    pub method: Method,
    pub url: Url,
    /// `None` when the request failed in transport; see [`NodeResponse::error`].
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    body: BodyHandle,
    pub started_at: Instant,
    pub duration: Duration,
    /// Transport-level failure, set exactly when `status` is `None`.
    pub error: Option<String>,
}

impl NodeResponse {
    /// A response that reached the node and got a status line back.
    pub fn received(
        node: NodeId,
        method: Method,
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: BodyHandle,
        started_at: Instant,
        duration: Duration,
    ) -> Self {
        Self {
            node,
            method,
            url,
            status: Some(status),
            headers,
            body,
            started_at,
            duration,
            error: None,
        }
    }

    /// A request that failed in transport (network, TLS, timeout, URI).
    pub fn failed(
        node: NodeId,
        method: Method,
        url: Url,
        error: impl Into<String>,
        started_at: Instant,
        duration: Duration,
    ) -> Self {
        Self {
            node,
            method,
            url,
            status: None,
            headers: HeaderMap::new(),
            body: BodyHandle::empty(),
            started_at,
            duration,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True unless the node answered the verification sentinel 150.
    pub fn is_dissent(&self) -> bool {
        !matches!(self.status, Some(status) if status.as_u16() == crate::common::headers::NODE_CONTINUE_CODE)
    }

    pub fn body(&self) -> &BodyHandle {
        &self.body
    }

    pub fn summary(&self) -> NodeResult {
        NodeResult {
            node: self.node.clone(),
            status: self.status,
            duration: self.duration,
            error: self.error.clone(),
        }
    }
}

/// Body-less view of a `NodeResponse`, safe to clone and hand to pollers
/// and completion callbacks.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node: NodeId,
    pub status: Option<StatusCode>,
    pub duration: Duration,
    pub error: Option<String>,
}
