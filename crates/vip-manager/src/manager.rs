//! Top-level orchestration: picks one engine, prepares it, runs it, and
//! tears everything down once it returns or a signal arrives.

use crate::advertiser::{AddressAdvertiser, Advertiser, BgpAdvertiser, RouteAdvertiser};
use crate::annotations::{AnnotationSource, BgpNodeParams, NodeAnnotationWatcher};
use crate::bootstrap::{
    BootstrapPaths, NAMESPACE_PATH, local_hostname, resolve_client, resolve_node_name,
};
use crate::cluster::{KubeLeaseElector, KubeServiceWatcher, lease_namespace};
use crate::config::Config;
use crate::engine::{Engine, EngineContext, EngineKind, EngineSet, select_engine};
use crate::error::{ManagerError, Result};
use crate::metrics::MetricsRegistry;
use crate::mirror::{MirrorBackend, TcMirror, TrafficMirror};
use crate::registry::InstanceRegistry;
use crate::service_engine::{ElectionTiming, LeaderElector, ServiceEngine, ServiceSource};
use crate::shutdown::ShutdownCoordinator;
use common::{CommandRunner, SystemCommand};
use kube::Client;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

pub struct Manager {
    config: Arc<Config>,
    node_name: String,
    client: Option<Client>,
    registry: Arc<InstanceRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Arc<MetricsRegistry>,
    mirror: TrafficMirror,
    annotations: Option<Arc<dyn AnnotationSource>>,
}

impl Manager {
    /// Build a manager for this host: node name from the configuration or
    /// the hostname, cluster client from the bootstrap chain.
    pub async fn new(config: Config) -> Result<Self> {
        Self::bootstrap(config, &BootstrapPaths::default(), local_hostname).await
    }

    /// Resolve the node name, then the cluster client from `paths`.
    pub async fn bootstrap(
        config: Config,
        paths: &BootstrapPaths,
        hostname: impl FnOnce() -> io::Result<String>,
    ) -> Result<Self> {
        let node_name = resolve_node_name(&config.node.name, hostname)?;
        let client = resolve_client(&config, paths).await?;
        Ok(Self::build(config, client, node_name))
    }

    /// Build a manager around an existing client.
    pub fn from_parts(
        config: Config,
        client: Option<Client>,
        hostname: impl FnOnce() -> io::Result<String>,
    ) -> Result<Self> {
        let node_name = resolve_node_name(&config.node.name, hostname)?;
        Ok(Self::build(config, client, node_name))
    }

    fn build(config: Config, client: Option<Client>, node_name: String) -> Self {
        let annotations = client
            .clone()
            .map(|c| Arc::new(NodeAnnotationWatcher::new(c)) as Arc<dyn AnnotationSource>);
        let mirror = TrafficMirror::new(
            Arc::new(TcMirror::default()),
            config.node.service_interface(),
            &config.node.mirror_dest_interface,
        );

        Self {
            config: Arc::new(config),
            node_name,
            client,
            registry: Arc::new(InstanceRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            mirror,
            annotations,
        }
    }

    pub fn with_annotation_source(mut self, source: Arc<dyn AnnotationSource>) -> Self {
        self.annotations = Some(source);
        self
    }

    pub fn with_mirror_backend(mut self, backend: Arc<dyn MirrorBackend>) -> Self {
        self.mirror = TrafficMirror::new(
            backend,
            self.config.node.service_interface(),
            &self.config.node.mirror_dest_interface,
        );
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    pub fn registry(&self) -> Arc<InstanceRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        self.shutdown.clone()
    }

    /// Engines backed by the cluster API and the host's `ip`, `arping` and
    /// `gobgp` tools. Empty when no client was built.
    pub fn cluster_engines(&self) -> EngineSet {
        let Some(client) = self.client.clone() else {
            return EngineSet::new();
        };

        let election = &self.config.leader_election;
        let namespace = lease_namespace(&election.namespace, Path::new(NAMESPACE_PATH));
        info!(namespace = %namespace, "Using lease namespace");

        let source: Arc<dyn ServiceSource> = Arc::new(KubeServiceWatcher::new(client.clone()));
        let elector: Arc<dyn LeaderElector> = Arc::new(KubeLeaseElector::new(
            client,
            &namespace,
            &self.node_name,
            election.lease_duration,
        ));
        let timing = ElectionTiming {
            retry_period: election.retry_period,
            renew_deadline: election.renew_deadline,
        };
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommand);
        let settings = &self.config.engine;
        let interface = self.config.node.service_interface();

        let bgp = BgpAdvertiser::new(runner.clone(), &self.config.bgp.gobgp, self.metrics());
        let arp = AddressAdvertiser::arp(runner.clone(), interface);
        let wireguard = AddressAdvertiser::wireguard(runner.clone(), &settings.wireguard_interface);
        let routes = RouteAdvertiser::new(
            runner,
            interface,
            settings.routing_table_id,
            settings.routing_protocol,
        );
        let advertisers: [(EngineKind, Arc<dyn Advertiser>); 4] = [
            (EngineKind::Bgp, Arc::new(bgp)),
            (EngineKind::Arp, Arc::new(arp)),
            (EngineKind::Wireguard, Arc::new(wireguard)),
            (EngineKind::RoutingTable, Arc::new(routes)),
        ];

        advertisers
            .into_iter()
            .fold(EngineSet::new(), |set, (kind, advertiser)| {
                let engine = ServiceEngine::new(source.clone(), elector.clone(), advertiser, timing);
                set.with(kind, Arc::new(engine))
            })
    }

    /// Run the selected engine until it returns or shutdown is requested.
    ///
    /// Returns `Ok(())` without starting anything when no engine is enabled.
    pub async fn start(&self, engines: &EngineSet) -> Result<()> {
        let Some(kind) = select_engine(&self.config) else {
            error!(
                "prematurely exiting Load-balancer as no modes [ARP/BGP/Wireguard/Routing Table] are enabled"
            );
            self.shutdown.finish();
            return Ok(());
        };
        let Some(engine) = engines.get(kind) else {
            self.shutdown.finish();
            return Err(ManagerError::EngineUnavailable(kind));
        };

        let signals = match self.shutdown.arm() {
            Ok(signals) => signals,
            Err(e) => {
                self.shutdown.finish();
                return Err(e.into());
            }
        };
        let result = match self.prepare(kind).await {
            Ok(bgp) => self.run_engine(engine, bgp).await,
            Err(e) => Err(e),
        };

        self.shutdown.finish();
        signals.abort();
        result
    }

    async fn prepare(&self, kind: EngineKind) -> Result<Option<BgpNodeParams>> {
        let bgp = match kind {
            EngineKind::Bgp if !self.config.bgp.annotations.is_empty() => {
                Some(self.bgp_params().await?)
            }
            _ => None,
        };

        info!(node = %self.node_name, "Starting loadBalancer service with the {} engine", kind);

        self.mirror.start().await.map_err(ManagerError::Mirror)?;
        Ok(bgp)
    }

    async fn bgp_params(&self) -> Result<BgpNodeParams> {
        let prefix = &self.config.bgp.annotations;
        let source = self.annotations.as_ref().ok_or_else(|| {
            ManagerError::Annotations(format!(
                "annotations prefix {} is set but no cluster client is available",
                prefix
            ))
        })?;

        info!(prefix = %prefix, "Parsing node annotations");
        let token = self.shutdown.token();
        source
            .bgp_params(&self.node_name, prefix, &token)
            .await
            .inspect_err(|e| error!(error = %e, "Error parsing node annotations"))
    }

    async fn run_engine(
        &self,
        engine: Arc<dyn Engine>,
        bgp: Option<BgpNodeParams>,
    ) -> Result<()> {
        let ctx = EngineContext {
            node_name: self.node_name.clone(),
            bgp,
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        };

        let result = engine.run(ctx).await;
        if let Err(e) = &result {
            error!(error = %e, "Engine failed");
        }

        self.shutdown.trigger("engine exited");
        self.shutdown.wait_for_workers().await;

        if let Err(e) = self.mirror.stop().await {
            error!(error = %e, "Error cleaning up traffic mirroring");
        }
        result
    }
}
