//! Cluster client bootstrap.
//!
//! The decision of how to reach the API server is made by [`plan_client`],
//! a deterministic function of the configuration and of which credential
//! files exist. [`resolve_client`] then builds the client for that plan.
//! Any construction failure is fatal and names the path that was tried.

use crate::config::{ClusterSettings, Config, LeaderElectionType};
use crate::error::{ClientSource, ManagerError, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Admin kubeconfig written by kubeadm on control-plane hosts.
pub const ADMIN_CONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

/// Namespace of the pod's service account.
pub const NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Host alias for the API server, expected to be mapped in the pod manifest.
pub const API_SERVER_ALIAS: &str = "kubernetes";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Credential files consulted during bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapPaths {
    pub admin: PathBuf,
    pub home: Option<PathBuf>,
}

impl Default for BootstrapPaths {
    fn default() -> Self {
        Self {
            admin: PathBuf::from(ADMIN_CONFIG_PATH),
            home: dirs::home_dir().map(|home| home.join(".kube").join("config")),
        }
    }
}

/// Which API server address to use with a kubeconfig file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOverride {
    /// Keep the address embedded in the file
    Embedded,
    /// Use this address instead
    Address(String),
    /// Try candidate addresses and take the first that answers
    Detect,
}

/// How the cluster client will be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPlan {
    /// Leader election uses an external store; no client is built
    External,
    File { path: PathBuf, server: ServerOverride },
    InCluster,
}

/// Decide how to reach the cluster API. First match wins.
pub fn plan_client(cluster: &ClusterSettings, paths: &BootstrapPaths) -> ClientPlan {
    if cluster.leader_election_type == LeaderElectionType::Etcd {
        return ClientPlan::External;
    }

    if paths.admin.is_file() {
        let server = if !cluster.kubernetes_addr.is_empty() {
            ServerOverride::Address(cluster.kubernetes_addr.clone())
        } else if cluster.control_plane {
            // A control-plane host may not hold the VIP yet, so talk to the
            // local API server rather than the address in the file.
            if cluster.detect_control_plane {
                ServerOverride::Detect
            } else {
                ServerOverride::Address(format!("{}:{}", API_SERVER_ALIAS, cluster.port))
            }
        } else {
            ServerOverride::Embedded
        };
        return ClientPlan::File {
            path: paths.admin.clone(),
            server,
        };
    }

    if let Some(home) = paths.home.as_ref().filter(|p| p.is_file()) {
        return ClientPlan::File {
            path: home.clone(),
            server: ServerOverride::Embedded,
        };
    }

    ClientPlan::InCluster
}

/// Build the cluster client, or `None` when leader election is external.
pub async fn resolve_client(config: &Config, paths: &BootstrapPaths) -> Result<Option<Client>> {
    let plan = plan_client(&config.cluster, paths);
    if plan == ClientPlan::External {
        debug!("External leader election, no cluster client constructed");
        return Ok(None);
    }

    let source = match &plan {
        ClientPlan::File { path, .. } => ClientSource::File(path.clone()),
        _ => ClientSource::InCluster,
    };
    let kube_config = load_config(&plan, config.cluster.port).await?;
    let client =
        Client::try_from(kube_config).map_err(|e| ManagerError::client(source.clone(), e))?;

    match source {
        ClientSource::InCluster => debug!("Using Kubernetes configuration from incluster config"),
        other => debug!("Using Kubernetes configuration from {}", other),
    }
    Ok(Some(client))
}

/// Load client configuration for `plan` without connecting.
pub async fn load_config(plan: &ClientPlan, port: u32) -> Result<kube::Config> {
    match plan {
        ClientPlan::External => Err(ManagerError::Config(
            "no cluster client is built for external leader election".to_string(),
        )),
        ClientPlan::InCluster => {
            kube::Config::incluster().map_err(|e| ManagerError::client(ClientSource::InCluster, e))
        }
        ClientPlan::File { path, server } => {
            let mut kube_config = from_kubeconfig(path).await?;
            let address = match server {
                ServerOverride::Embedded => return Ok(kube_config),
                ServerOverride::Address(address) => address.clone(),
                ServerOverride::Detect => {
                    let candidates = detection_candidates(port, local_hostname().ok().as_deref());
                    find_working_address(&candidates, CONNECT_TIMEOUT)
                        .await
                        .ok_or_else(|| ManagerError::Client {
                            path: ClientSource::Detect(path.clone()),
                            source: format!("none of {:?} answered", candidates).into(),
                        })?
                }
            };

            info!(address = %address, "Overriding API server address");
            kube_config.cluster_url = server_uri(&address)
                .map_err(|e| ManagerError::client(ClientSource::File(path.clone()), e))?;
            Ok(kube_config)
        }
    }
}

async fn from_kubeconfig(path: &Path) -> Result<kube::Config> {
    let source = || ClientSource::File(path.to_path_buf());
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| ManagerError::client(source(), e))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ManagerError::client(source(), e))
}

fn server_uri(address: &str) -> std::result::Result<http::Uri, http::uri::InvalidUri> {
    if address.contains("://") {
        address.parse()
    } else {
        format!("https://{}", address).parse()
    }
}

/// Addresses tried when detecting a local control plane, in order.
pub fn detection_candidates(port: u32, hostname: Option<&str>) -> Vec<String> {
    let mut candidates = vec![
        format!("{}:{}", API_SERVER_ALIAS, port),
        format!("localhost:{}", port),
        format!("127.0.0.1:{}", port),
    ];
    if let Some(hostname) = hostname.filter(|h| !h.is_empty()) {
        candidates.push(format!("{}:{}", hostname, port));
    }
    candidates
}

/// Return the first candidate accepting a TCP connection within `timeout`.
pub async fn find_working_address(candidates: &[String], timeout: Duration) -> Option<String> {
    for candidate in candidates {
        match tokio::time::timeout(timeout, TcpStream::connect(candidate.as_str())).await {
            Ok(Ok(_)) => {
                info!(address = %candidate, "Found working API server address");
                return Some(candidate.clone());
            }
            Ok(Err(e)) => debug!(address = %candidate, error = %e, "API server not reachable"),
            Err(_) => debug!(address = %candidate, "API server connect timed out"),
        }
    }
    None
}

/// Read the service-account namespace, if running in a pod.
pub fn service_account_namespace(path: &Path) -> Option<String> {
    let data = std::fs::read_to_string(path).ok()?;
    let namespace = data.trim();
    (!namespace.is_empty()).then(|| namespace.to_string())
}

/// The configured node name, falling back to the local hostname.
pub fn resolve_node_name(
    configured: &str,
    hostname: impl FnOnce() -> io::Result<String>,
) -> Result<String> {
    if !configured.is_empty() {
        info!("Using node name [{}]", configured);
        return Ok(configured.to_string());
    }

    warn!("Node name is missing from the config, fall back to hostname");
    let name = hostname().map_err(|e| ManagerError::Hostname(e.to_string()))?;
    if name.is_empty() {
        return Err(ManagerError::Hostname("hostname is empty".to_string()));
    }
    info!("Using node name [{}]", name);
    Ok(name)
}

/// The local hostname.
pub fn local_hostname() -> io::Result<String> {
    nix::unistd::gethostname()
        .map_err(io::Error::from)?
        .into_string()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hostname is not valid UTF-8"))
}
