//! Core types shared between the manager, the registry and the engines.

use std::net::IpAddr;
use tokio_util::sync::CancellationToken;

/// Prefix of the per-service leader-election lock.
pub const PLUNDER_LOCK: &str = "plndr-svcs-lock";

/// A load-balanced service whose VIPs should be reachable from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipService {
    /// Stable service identity
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub vips: Vec<IpAddr>,
}

impl VipService {
    /// Name of the lease guarding this service.
    pub fn lock_name(&self) -> String {
        format!("{}-{}", PLUNDER_LOCK, self.name)
    }
}

/// A change observed on the cluster's service set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Applied(VipService),
    Deleted(VipService),
}

/// Bookkeeping record for one service under active advertisement.
///
/// `stop` is cancelled by the owning engine to end the service's worker;
/// the worker cancels `finished` once it has withdrawn everything it
/// advertised.
#[derive(Debug, Clone)]
pub struct Instance {
    pub uid: String,
    pub service: VipService,
    pub stop: CancellationToken,
    pub finished: CancellationToken,
}

impl Instance {
    pub fn new(service: VipService, stop: CancellationToken) -> Self {
        Self {
            uid: service.uid.clone(),
            service,
            stop,
            finished: CancellationToken::new(),
        }
    }

    /// Stop the worker and wait until it has finished its teardown.
    pub async fn stop_and_wait(&self) {
        self.stop.cancel();
        self.finished.cancelled().await;
    }
}
