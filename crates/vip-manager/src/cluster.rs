//! Cluster API adapters: the service watch and per-service leases.

use crate::bootstrap::service_account_namespace;
use crate::error::{ManagerError, Result};
use crate::service_engine::{LeaderElector, ServiceSource};
use crate::types::{ServiceEvent, VipService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Comma-separated VIPs; takes precedence over `spec.loadBalancerIP`.
pub const LOADBALANCER_IPS_ANNOTATION: &str = "kube-vip.io/loadbalancerIPs";

/// Services carrying this annotation with value `true` are left alone.
pub const IGNORE_ANNOTATION: &str = "kube-vip.io/ignore";

const FALLBACK_NAMESPACE: &str = "kube-system";

impl VipService {
    /// Project a cluster Service onto the fields the engines use.
    ///
    /// Returns `None` for objects without a UID. Services that are not of
    /// type `LoadBalancer`, or that opt out, come back with no VIPs.
    pub fn from_service(service: &Service) -> Option<Self> {
        let meta = &service.metadata;
        let uid = meta.uid.clone()?;
        let annotations = meta.annotations.as_ref();

        let is_load_balancer = service
            .spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            .is_some_and(|t| t == "LoadBalancer");
        let ignored = annotations
            .and_then(|a| a.get(IGNORE_ANNOTATION))
            .is_some_and(|v| v == "true");

        let vips = if !is_load_balancer || ignored {
            Vec::new()
        } else if let Some(list) = annotations.and_then(|a| a.get(LOADBALANCER_IPS_ANNOTATION)) {
            parse_vips(list)
        } else {
            service
                .spec
                .as_ref()
                .and_then(|spec| spec.load_balancer_ip.as_deref())
                .map(parse_vips)
                .unwrap_or_default()
        };

        Some(Self {
            uid,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            vips,
        })
    }
}

fn parse_vips(list: &str) -> Vec<IpAddr> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(address = s, "Ignoring invalid service VIP");
                None
            }
        })
        .collect()
}

/// Watches Services in every namespace.
pub struct KubeServiceWatcher {
    api: Api<Service>,
}

impl KubeServiceWatcher {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

/// Turns raw watch events into service events.
///
/// A re-list after a desync does not report objects that vanished while
/// the watch was down. The tracker remembers every known service and, when
/// a re-list completes, reports the ones it did not see as deleted.
#[derive(Debug, Default)]
pub struct ServiceTracker {
    known: HashMap<String, VipService>,
    relisted: Option<HashSet<String>>,
}

impl ServiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: Event<Service>) -> Vec<ServiceEvent> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(svc) => {
                let Some(service) = VipService::from_service(&svc) else {
                    return Vec::new();
                };
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(service.uid.clone());
                }
                self.known.insert(service.uid.clone(), service.clone());
                vec![ServiceEvent::Applied(service)]
            }
            Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|uid| !seen.contains(*uid))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|uid| self.known.remove(&uid))
                    .inspect(|service| {
                        debug!(uid = %service.uid, name = %service.name, "Service gone after re-list");
                    })
                    .map(ServiceEvent::Deleted)
                    .collect()
            }
            Event::Apply(svc) => match VipService::from_service(&svc) {
                Some(service) => {
                    self.known.insert(service.uid.clone(), service.clone());
                    vec![ServiceEvent::Applied(service)]
                }
                None => Vec::new(),
            },
            Event::Delete(svc) => match VipService::from_service(&svc) {
                Some(service) => {
                    self.known.remove(&service.uid);
                    vec![ServiceEvent::Deleted(service)]
                }
                None => Vec::new(),
            },
        }
    }
}

#[async_trait]
impl ServiceSource for KubeServiceWatcher {
    async fn watch(&self) -> Result<BoxStream<'static, Result<ServiceEvent>>> {
        let mut tracker = ServiceTracker::new();
        let stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .map(move |event| -> Vec<Result<ServiceEvent>> {
                match event {
                    Ok(event) => tracker.observe(event).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(ManagerError::Engine(format!("service watch: {}", e)))],
                }
            })
            .flat_map(futures::stream::iter)
            .boxed();
        Ok(stream)
    }
}

/// Namespace for lease objects: configured, else the pod's own, else `kube-system`.
pub fn lease_namespace(configured: &str, service_account: &Path) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    service_account_namespace(service_account).unwrap_or_else(|| FALLBACK_NAMESPACE.to_string())
}

/// What to do with an existing lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// We hold it; bump the renew time
    Renew,
    /// Free or expired; take it over
    Acquire,
    /// Someone else holds a live lease
    HeldElsewhere,
}

/// Decide how to treat `spec` on behalf of `identity` at `now`.
pub fn lease_action(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(spec) = spec else {
        return LeaseAction::Acquire;
    };
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseAction::Acquire;
    }
    if holder == identity {
        return LeaseAction::Renew;
    }

    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    let last = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match last {
        Some(last) if last + duration > now => LeaseAction::HeldElsewhere,
        _ => LeaseAction::Acquire,
    }
}

/// Per-service leases stored as `coordination.k8s.io/v1` Lease objects.
pub struct KubeLeaseElector {
    api: Api<Lease>,
    identity: String,
    lease_duration: Duration,
}

impl KubeLeaseElector {
    pub fn new(client: Client, namespace: &str, identity: &str, lease_duration: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity: identity.to_string(),
            lease_duration,
        }
    }

    fn duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs().max(1)).unwrap_or(i32::MAX)
    }

    fn claim(&self, spec: &mut LeaseSpec, now: DateTime<Utc>, acquiring: bool) {
        if acquiring {
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(self.duration_seconds());
        spec.renew_time = Some(MicroTime(now));
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait]
impl LeaderElector for KubeLeaseElector {
    async fn try_acquire_or_renew(&self, lock: &str) -> Result<bool> {
        let now = Utc::now();

        let Some(mut lease) = self.api.get_opt(lock).await? else {
            let mut spec = LeaseSpec::default();
            self.claim(&mut spec, now, true);
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(lock.to_string()),
                    ..ObjectMeta::default()
                },
                spec: Some(spec),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) if is_conflict(&e) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let action = lease_action(lease.spec.as_ref(), &self.identity, now);
        if action == LeaseAction::HeldElsewhere {
            return Ok(false);
        }
        if action == LeaseAction::Acquire {
            debug!(lock, identity = %self.identity, "Taking over lease");
        }

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        self.claim(spec, now, action == LeaseAction::Acquire);
        match self.api.replace(lock, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, lock: &str) -> Result<()> {
        let Some(mut lease) = self.api.get_opt(lock).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }

        spec.holder_identity = None;
        spec.renew_time = None;
        match self.api.replace(lock, &PostParams::default(), &lease).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
