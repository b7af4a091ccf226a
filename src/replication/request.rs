//! One logical call to one node

use crate::cluster::NodeId;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};

/// Payload of a cluster request.
///
/// Form parameters land in the query string for side-effect-free methods
/// (GET/HEAD/OPTIONS/DELETE) and in the request body for POST/PUT; raw bytes
/// are always sent as the body.
#[derive(Debug, Clone, Default)]
pub enum Entity {
    #[default]
    Empty,
    Form(Vec<(String, String)>),
    Bytes(Bytes),
}

impl Entity {
    pub fn is_empty(&self) -> bool {
        match self {
            Entity::Empty => true,
            Entity::Form(params) => params.is_empty(),
            Entity::Bytes(bytes) => bytes.is_empty(),
        }
    }
}

/// A request to a single node, with the URI already rewritten against that
/// node's API host and port. Lives from dispatch until its `NodeResponse`
/// is produced.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub node: NodeId,
    pub method: Method,
    pub url: Url,
    pub entity: Entity,
    pub headers: HeaderMap,
}

impl NodeRequest {
    pub fn new(node: NodeId, method: Method, url: Url, entity: Entity, headers: HeaderMap) -> Self {
        Self {
            node,
            method,
            url,
            entity,
            headers,
        }
    }
}

/// Rewrite `uri` so host and port point at `node`, preserving scheme, path
/// and query.
pub fn rewrite_for_node(uri: &Url, node: &NodeId) -> crate::Result<Url> {
    let mut url = uri.clone();
    url.set_host(Some(&node.api_host))
        .map_err(|e| crate::Error::UriConstruction {
            node: node.clone(),
            reason: e.to_string(),
        })?;
    url.set_port(Some(node.api_port))
        .map_err(|_| crate::Error::UriConstruction {
            node: node.clone(),
            reason: "cannot set port".into(),
        })?;
    Ok(url)
}
