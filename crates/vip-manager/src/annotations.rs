//! BGP parameters published as node annotations.
//!
//! With a prefix of `bgp.example.io` the node carries
//! `bgp.example.io/node-asn`, `/peer-asn`, `/peer-ip` (comma separated),
//! `/src-ip` and optionally `/bgp-pass`.

use crate::error::{ManagerError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpNodeParams {
    pub node_asn: u32,
    pub peer_asn: u32,
    pub peers: Vec<IpAddr>,
    /// Source address, also used as router ID
    pub source_ip: IpAddr,
    pub password: Option<String>,
}

/// Parse BGP parameters from a node's annotations.
///
/// Returns `Ok(None)` while any required key is still missing and an error
/// when a key is present but malformed.
pub fn parse_bgp_annotations(
    prefix: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<Option<BgpNodeParams>> {
    let get = |key: &str| {
        annotations
            .get(&format!("{}/{}", prefix, key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };

    let (Some(node_asn), Some(peer_asn), Some(peer_ips), Some(source_ip)) =
        (get("node-asn"), get("peer-asn"), get("peer-ip"), get("src-ip"))
    else {
        return Ok(None);
    };

    let node_asn = parse_field::<u32>("node-asn", node_asn)?;
    let peer_asn = parse_field::<u32>("peer-asn", peer_asn)?;
    let source_ip = parse_field::<IpAddr>("src-ip", source_ip)?;
    let peers = peer_ips
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| parse_field::<IpAddr>("peer-ip", p))
        .collect::<Result<Vec<_>>>()?;

    if peers.is_empty() {
        return Err(ManagerError::Annotations("peer-ip lists no peers".to_string()));
    }

    Ok(Some(BgpNodeParams {
        node_asn,
        peer_asn,
        peers,
        source_ip,
        password: get("bgp-pass").map(str::to_string),
    }))
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ManagerError::Annotations(format!("invalid {} {:?}: {}", key, value, e)))
}

/// Supplies a node's BGP parameters, waiting for them to be published.
#[async_trait]
pub trait AnnotationSource: Send + Sync {
    async fn bgp_params(
        &self,
        node_name: &str,
        prefix: &str,
        shutdown: &CancellationToken,
    ) -> Result<BgpNodeParams>;
}

/// Reads and watches the Node object through the cluster API.
pub struct NodeAnnotationWatcher {
    api: Api<Node>,
}

impl NodeAnnotationWatcher {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl AnnotationSource for NodeAnnotationWatcher {
    async fn bgp_params(
        &self,
        node_name: &str,
        prefix: &str,
        shutdown: &CancellationToken,
    ) -> Result<BgpNodeParams> {
        let node = self.api.get(node_name).await.map_err(|e| {
            ManagerError::Annotations(format!("error getting node {}: {}", node_name, e))
        })?;

        let annotations = node.metadata.annotations.unwrap_or_default();
        if let Some(params) = parse_bgp_annotations(prefix, &annotations)? {
            info!(node = node_name, asn = params.node_asn, "Found BGP node annotations");
            return Ok(params);
        }

        info!(node = node_name, prefix, "Waiting for BGP node annotations");
        let config = watcher::Config::default().fields(&format!("metadata.name={}", node_name));
        let mut nodes = watcher(self.api.clone(), config)
            .default_backoff()
            .applied_objects()
            .boxed();

        loop {
            let node = tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(ManagerError::Annotations(
                        "shutdown before node annotations were published".to_string(),
                    ));
                }
                next = nodes.next() => match next {
                    Some(Ok(node)) => node,
                    Some(Err(e)) => {
                        warn!(error = %e, node = node_name, "Node watch error");
                        continue;
                    }
                    None => {
                        return Err(ManagerError::Annotations("node watch closed".to_string()));
                    }
                },
            };

            let annotations = node.metadata.annotations.unwrap_or_default();
            match parse_bgp_annotations(prefix, &annotations)? {
                Some(params) => {
                    info!(node = node_name, asn = params.node_asn, "Found BGP node annotations");
                    return Ok(params);
                }
                None => debug!(node = node_name, "BGP annotations still incomplete"),
            }
        }
    }
}
