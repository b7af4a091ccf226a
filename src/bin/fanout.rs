//! Replicate one HTTP request across an explicit set of cluster nodes

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use fanout::cluster::{SharedFlowState, StaticClusterDirectory, TracingEventSink};
use fanout::merge::FirstResponseMerger;
use fanout::replication::{Entity, NodeClient};
use fanout::{NodeId, Replicator, ReplicatorConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Replicate an HTTP request to every node of a cluster")]
struct Cli {
    /// HTTP method (GET, HEAD, OPTIONS, POST, PUT, DELETE)
    method: String,

    /// Request URI; host and port are rewritten per node
    uri: String,

    /// Target node as id=host:port (repeatable)
    #[arg(long = "node", required = true)]
    nodes: Vec<String>,

    /// Raw request body
    #[arg(long)]
    data: Option<String>,

    /// Form parameter as key=value (repeatable); goes to the query string
    /// for read-only methods, to the body for POST/PUT
    #[arg(long = "param")]
    params: Vec<String>,

    /// Extra header as name:value (repeatable)
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Skip the verification round for mutating requests
    #[arg(long)]
    no_verify: bool,

    /// Worker pool size
    #[arg(long, default_value = "4")]
    threads: usize,

    /// Per-hop connect timeout (ms)
    #[arg(long, default_value = "3000")]
    connect_timeout_ms: u64,

    /// Per-hop read timeout (ms)
    #[arg(long, default_value = "3000")]
    read_timeout_ms: u64,
}

fn parse_node(spec: &str) -> anyhow::Result<NodeId> {
    let (id, address) = spec
        .split_once('=')
        .with_context(|| format!("node must be id=host:port, got '{}'", spec))?;
    let (host, port) = address
        .split_once(':')
        .with_context(|| format!("node must be id=host:port, got '{}'", spec))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in '{}'", spec))?;
    Ok(NodeId::new(id, host, port))
}

fn parse_headers(specs: &[String]) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for spec in specs {
        let (name, value) = spec
            .split_once(':')
            .with_context(|| format!("header must be name:value, got '{}'", spec))?;
        headers.insert(
            HeaderName::from_bytes(name.trim().as_bytes())?,
            HeaderValue::from_str(value.trim())?,
        );
    }
    Ok(headers)
}

fn parse_entity(cli: &Cli) -> anyhow::Result<Entity> {
    match (&cli.data, cli.params.is_empty()) {
        (Some(_), false) => bail!("--data and --param are mutually exclusive"),
        (Some(data), true) => Ok(Entity::Bytes(Bytes::from(data.clone()))),
        (None, false) => {
            let mut params = Vec::new();
            for spec in &cli.params {
                let (key, value) = spec
                    .split_once('=')
                    .with_context(|| format!("param must be key=value, got '{}'", spec))?;
                params.push((key.to_string(), value.to_string()));
            }
            Ok(Entity::Form(params))
        }
        (None, true) => Ok(Entity::Empty),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let method = Method::from_bytes(cli.method.to_uppercase().as_bytes())
        .with_context(|| format!("invalid method '{}'", cli.method))?;
    let uri = Url::parse(&cli.uri).with_context(|| format!("invalid URI '{}'", cli.uri))?;
    let nodes: Vec<NodeId> = cli
        .nodes
        .iter()
        .map(|spec| parse_node(spec))
        .collect::<anyhow::Result<_>>()?;
    let headers = parse_headers(&cli.headers)?;
    let entity = parse_entity(&cli)?;

    let config = ReplicatorConfig {
        num_threads: cli.threads,
        connect_timeout_ms: cli.connect_timeout_ms,
        read_timeout_ms: cli.read_timeout_ms,
        ..Default::default()
    };

    let replicator = Replicator::new(
        config.clone(),
        Arc::new(NodeClient::new(&config)?),
        Arc::new(StaticClusterDirectory::new(nodes.clone())),
        Arc::new(FirstResponseMerger),
        None,
        Arc::new(TracingEventSink),
        Arc::new(SharedFlowState::new()),
    )?;
    replicator.start();

    let aggregator = replicator
        .replicate(&nodes, method, uri, entity, headers, !cli.no_verify)
        .await?;
    aggregator.wait_complete().await;

    for result in aggregator.results() {
        match (result.status, result.error) {
            (Some(status), _) => println!(
                "{}: {} ({} ms)",
                result.node,
                status,
                result.duration.as_millis()
            ),
            (None, error) => println!(
                "{}: error: {} ({} ms)",
                result.node,
                error.unwrap_or_default(),
                result.duration.as_millis()
            ),
        }
    }

    match aggregator.consume().await {
        Ok(merged) => {
            println!("merged: {}", merged.status);
            if !merged.body.is_empty() {
                println!("{}", String::from_utf8_lossy(&merged.body));
            }
        }
        Err(e) => {
            println!("request failed: {}", e);
        }
    }

    replicator.stop().await;
    Ok(())
}
