//! Error type for the VIP manager.

use crate::engine::EngineKind;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("could not get hostname: {0}")]
    Hostname(String),

    /// Cluster client construction failed; `path` names the bootstrap path attempted.
    #[error("could not create cluster client from {path}: {source}")]
    Client {
        path: ClientSource,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("node annotations: {0}")]
    Annotations(String),

    #[error("{0} engine is not available in this process")]
    EngineUnavailable(EngineKind),

    #[error("engine failed: {0}")]
    Engine(String),

    #[error("traffic mirroring: {0}")]
    Mirror(#[source] common::Error),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Common(#[from] common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a cluster client was being built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSource {
    File(PathBuf),
    InCluster,
    Detect(PathBuf),
}

impl std::fmt::Display for ClientSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientSource::File(path) => write!(f, "external file {:?}", path),
            ClientSource::InCluster => write!(f, "incluster config"),
            ClientSource::Detect(path) => {
                write!(f, "detected control plane address with file {:?}", path)
            }
        }
    }
}

impl ManagerError {
    pub(crate) fn client(
        path: ClientSource,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ManagerError::Client {
            path,
            source: Box::new(source),
        }
    }
}
