//! Registry of services currently under advertisement.
//!
//! The registry is the single authority deciding whether a service is
//! already being advertised. Every operation runs under one exclusive lock,
//! so at most one [`Instance`] exists per UID at any time.

use crate::types::Instance;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Mutex<Vec<Instance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the instance for `uid`.
    pub async fn find(&self, uid: &str) -> Option<Instance> {
        let instances = self.instances.lock().await;
        debug!(uid, "Looking up service instance");
        instances.iter().find(|i| i.uid == uid).cloned()
    }

    /// Insert `instance`, overwriting any existing record with the same UID.
    pub async fn upsert(&self, instance: Instance) {
        let mut instances = self.instances.lock().await;
        match instances.iter_mut().find(|i| i.uid == instance.uid) {
            Some(existing) => {
                debug!(uid = %instance.uid, "Replacing service instance");
                *existing = instance;
            }
            None => {
                debug!(uid = %instance.uid, "Registering service instance");
                instances.push(instance);
            }
        }
    }

    /// Remove the instance for `uid`, returning it if present.
    pub async fn remove(&self, uid: &str) -> Option<Instance> {
        let mut instances = self.instances.lock().await;
        let pos = instances.iter().position(|i| i.uid == uid)?;
        debug!(uid, "Deregistering service instance");
        Some(instances.swap_remove(pos))
    }

    /// Snapshot of registered UIDs.
    pub async fn uids(&self) -> Vec<String> {
        self.instances
            .lock()
            .await
            .iter()
            .map(|i| i.uid.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.lock().await.is_empty()
    }
}
