//! Service-driven advertisement engine.
//!
//! Every engine family runs the same control loop: watch load-balanced
//! services, keep one worker per service, and let each worker win or lose
//! a per-service lease. The family only differs in its [`Advertiser`].
//!
//! A worker that fails to observe cancellation promptly delays process
//! exit, so every suspension point in the worker selects on its stop token.

use crate::advertiser::Advertiser;
use crate::engine::{Engine, EngineContext};
use crate::error::{ManagerError, Result};
use crate::types::{Instance, ServiceEvent, VipService};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Stream of service changes from the cluster.
#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn watch(&self) -> Result<BoxStream<'static, Result<ServiceEvent>>>;
}

/// Per-service lease, held on behalf of this node.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Acquire the lock or renew it if already held. Returns whether this node holds it.
    async fn try_acquire_or_renew(&self, lock: &str) -> Result<bool>;

    /// Give the lock up if this node holds it.
    async fn release(&self, lock: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    pub retry_period: Duration,
    pub renew_deadline: Duration,
}

pub struct ServiceEngine {
    source: Arc<dyn ServiceSource>,
    elector: Arc<dyn LeaderElector>,
    advertiser: Arc<dyn Advertiser>,
    timing: ElectionTiming,
}

/// Sent by a worker whose advertiser failed.
#[derive(Debug)]
struct WorkerFailure {
    uid: String,
    error: String,
}

impl ServiceEngine {
    pub fn new(
        source: Arc<dyn ServiceSource>,
        elector: Arc<dyn LeaderElector>,
        advertiser: Arc<dyn Advertiser>,
        timing: ElectionTiming,
    ) -> Self {
        Self {
            source,
            elector,
            advertiser,
            timing,
        }
    }

    async fn handle_event(
        &self,
        ctx: &EngineContext,
        event: ServiceEvent,
        failures: &mpsc::Sender<WorkerFailure>,
    ) {
        match event {
            ServiceEvent::Applied(service) => match ctx.registry.find(&service.uid).await {
                // Not load-balanced, opted out, or no address assigned yet.
                None if service.vips.is_empty() => {}
                None => {
                    ctx.metrics.record_service_event("ADDED");
                    info!(uid = %service.uid, name = %service.name, "Service added");
                    self.start_worker(ctx, service, failures.clone()).await;
                }
                Some(instance) => {
                    ctx.metrics.record_service_event("MODIFIED");
                    if instance.service.vips == service.vips {
                        debug!(uid = %service.uid, "Service VIPs unchanged");
                        return;
                    }
                    info!(uid = %service.uid, name = %service.name, "Service VIPs changed, restarting worker");
                    instance.stop_and_wait().await;
                    ctx.registry.remove(&service.uid).await;
                    if !service.vips.is_empty() {
                        self.start_worker(ctx, service, failures.clone()).await;
                    }
                }
            },
            ServiceEvent::Deleted(service) => {
                if let Some(instance) = ctx.registry.find(&service.uid).await {
                    ctx.metrics.record_service_event("DELETED");
                    info!(uid = %service.uid, name = %service.name, "Service deleted, stopping worker");
                    instance.stop_and_wait().await;
                    ctx.registry.remove(&service.uid).await;
                }
            }
        }
    }

    async fn start_worker(
        &self,
        ctx: &EngineContext,
        service: VipService,
        failures: mpsc::Sender<WorkerFailure>,
    ) {
        let instance = Instance::new(service, ctx.shutdown.token().child_token());
        ctx.registry.upsert(instance.clone()).await;

        let worker = ServiceWorker {
            instance: instance.clone(),
            elector: self.elector.clone(),
            advertiser: self.advertiser.clone(),
            timing: self.timing,
        };

        if ctx.shutdown.spawn(worker.run(failures)).is_none() {
            instance.finished.cancel();
            ctx.registry.remove(&instance.uid).await;
        }
    }

    /// Stop every worker and drop its registration.
    async fn deregister_all(&self, ctx: &EngineContext) {
        for uid in ctx.registry.uids().await {
            if let Some(instance) = ctx.registry.remove(&uid).await {
                instance.stop_and_wait().await;
            }
        }
    }
}

#[async_trait]
impl Engine for ServiceEngine {
    async fn run(&self, ctx: EngineContext) -> Result<()> {
        self.advertiser.prepare(ctx.bgp.as_ref()).await?;

        let mut events = self.source.watch().await?;
        let (failure_tx, mut failure_rx) = mpsc::channel::<WorkerFailure>(16);
        let token = ctx.shutdown.token();

        info!(node = %ctx.node_name, "Watching services");

        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                Some(failure) = failure_rx.recv() => {
                    error!(uid = %failure.uid, error = %failure.error, "Service worker failed");
                    break Err(ManagerError::Engine(format!(
                        "service {}: {}", failure.uid, failure.error
                    )));
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(&ctx, event, &failure_tx).await,
                    Some(Err(e)) => warn!(error = %e, "Service watch error"),
                    None => break Err(ManagerError::Engine("service watch ended".to_string())),
                },
            }
        };

        self.deregister_all(&ctx).await;
        result
    }
}

/// Leader-election loop for one service.
struct ServiceWorker {
    instance: Instance,
    elector: Arc<dyn LeaderElector>,
    advertiser: Arc<dyn Advertiser>,
    timing: ElectionTiming,
}

impl ServiceWorker {
    async fn run(self, failures: mpsc::Sender<WorkerFailure>) {
        let service = &self.instance.service;
        let lock = service.lock_name();
        let stop = self.instance.stop.clone();

        let mut leading = false;
        let mut last_renew = Instant::now();
        let mut ticker = interval(self.timing.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(uid = %service.uid, lock = %lock, "Service worker started");

        let failure = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break None,
                _ = ticker.tick() => {}
            }

            let held = tokio::select! {
                biased;
                _ = stop.cancelled() => break None,
                held = self.elector.try_acquire_or_renew(&lock) => held,
            };

            match held {
                Ok(true) => {
                    last_renew = Instant::now();
                    if !leading {
                        info!(uid = %service.uid, name = %service.name, "Became leader, advertising");
                        leading = true;
                        if let Err(e) = self.advertise().await {
                            break Some(e);
                        }
                    }
                }
                Ok(false) => {
                    if leading {
                        info!(uid = %service.uid, name = %service.name, "Lost leadership, withdrawing");
                        leading = false;
                        self.withdraw().await;
                    }
                }
                Err(e) => {
                    warn!(uid = %service.uid, error = %e, "Leader election error");
                    if leading && last_renew.elapsed() >= self.timing.renew_deadline {
                        info!(uid = %service.uid, "Renew deadline passed, withdrawing");
                        leading = false;
                        self.withdraw().await;
                    }
                }
            }
        };

        if leading {
            self.withdraw().await;
            if let Err(e) = self.elector.release(&lock).await {
                warn!(uid = %service.uid, error = %e, "Failed to release lease");
            }
        }

        // The engine stops reading after the first failure, so never block here.
        if let Some(error) = failure {
            let report = WorkerFailure {
                uid: service.uid.clone(),
                error: error.to_string(),
            };
            if failures.try_send(report).is_err() {
                debug!(uid = %service.uid, "Engine already failing, dropping worker failure");
            }
        }

        debug!(uid = %service.uid, "Service worker stopped");
        self.instance.finished.cancel();
    }

    async fn advertise(&self) -> common::Result<()> {
        for vip in &self.instance.service.vips {
            self.advertiser.advertise(*vip).await?;
        }
        Ok(())
    }

    async fn withdraw(&self) {
        for vip in &self.instance.service.vips {
            if let Err(e) = self.advertiser.withdraw(*vip).await {
                warn!(uid = %self.instance.uid, vip = %vip, error = %e, "Failed to withdraw VIP");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::registry::InstanceRegistry;
    use crate::shutdown::ShutdownCoordinator;
    use std::net::IpAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ChannelSource {
        events: Mutex<Option<mpsc::UnboundedReceiver<Result<ServiceEvent>>>>,
    }

    impl ChannelSource {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<ServiceEvent>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let source = Self {
                events: Mutex::new(Some(rx)),
            };
            (Arc::new(source), tx)
        }
    }

    #[async_trait]
    impl ServiceSource for ChannelSource {
        async fn watch(&self) -> Result<BoxStream<'static, Result<ServiceEvent>>> {
            let rx = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ManagerError::Engine("already watching".to_string()))?;
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(stream.boxed())
        }
    }

    struct FixedElector {
        leader: AtomicBool,
        unreachable: AtomicBool,
    }

    impl FixedElector {
        fn new(leader: bool) -> Arc<Self> {
            Arc::new(Self {
                leader: AtomicBool::new(leader),
                unreachable: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl LeaderElector for FixedElector {
        async fn try_acquire_or_renew(&self, _lock: &str) -> Result<bool> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(ManagerError::Engine("api server unreachable".to_string()));
            }
            Ok(self.leader.load(Ordering::SeqCst))
        }

        async fn release(&self, _lock: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAdvertiser {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingAdvertiser {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Advertiser for RecordingAdvertiser {
        async fn advertise(&self, vip: IpAddr) -> common::Result<()> {
            if self.fail {
                return Err(common::Error::command_failed("ip addr add", "Operation not permitted"));
            }
            self.calls.lock().unwrap().push(format!("advertise {}", vip));
            Ok(())
        }

        async fn withdraw(&self, vip: IpAddr) -> common::Result<()> {
            self.calls.lock().unwrap().push(format!("withdraw {}", vip));
            Ok(())
        }
    }

    fn context() -> EngineContext {
        EngineContext {
            node_name: "node-a".to_string(),
            bgp: None,
            registry: Arc::new(InstanceRegistry::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    fn timing() -> ElectionTiming {
        ElectionTiming {
            retry_period: Duration::from_millis(10),
            renew_deadline: Duration::from_millis(50),
        }
    }

    fn service(uid: &str, vips: &[&str]) -> VipService {
        VipService {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: format!("svc-{}", uid),
            vips: vips.iter().map(|v| v.parse().unwrap()).collect(),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_add_then_delete() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let engine = ServiceEngine::new(source, FixedElector::new(true), advertiser.clone(), timing());
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| advertiser.calls() == vec!["advertise 10.0.0.1"]).await;
        assert_eq!(ctx.registry.len().await, 1);

        events.send(Ok(ServiceEvent::Deleted(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 2).await;
        assert_eq!(advertiser.calls()[1], "withdraw 10.0.0.1");

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();

        assert!(ctx.registry.is_empty().await);
        assert_eq!(ctx.metrics.service_events("ADDED"), 1);
        assert_eq!(ctx.metrics.service_events("DELETED"), 1);
    }

    #[tokio::test]
    async fn test_changed_vips_restart_worker() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let engine = ServiceEngine::new(source, FixedElector::new(true), advertiser.clone(), timing());
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 1).await;

        // Same VIPs: counted, but the worker keeps running.
        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.2"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 3).await;
        assert_eq!(
            advertiser.calls(),
            vec!["advertise 10.0.0.1", "withdraw 10.0.0.1", "advertise 10.0.0.2"]
        );
        assert_eq!(ctx.registry.uids().await, vec!["a".to_string()]);
        assert_eq!(ctx.metrics.service_events("MODIFIED"), 2);

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();
        assert_eq!(advertiser.calls().last().map(String::as_str), Some("withdraw 10.0.0.2"));
    }

    #[tokio::test]
    async fn test_services_without_vips_are_skipped() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let engine = ServiceEngine::new(source, FixedElector::new(true), advertiser.clone(), timing());
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("cluster-ip", &[])))).unwrap();
        events.send(Ok(ServiceEvent::Deleted(service("cluster-ip", &[])))).unwrap();
        events.send(Ok(ServiceEvent::Applied(service("b", &["10.0.0.9"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 1).await;

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();
        assert_eq!(ctx.metrics.service_events("ADDED"), 1);
        assert_eq!(ctx.metrics.service_events("DELETED"), 0);
    }

    #[tokio::test]
    async fn test_follower_never_advertises() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let engine =
            ServiceEngine::new(source, FixedElector::new(false), advertiser.clone(), timing());
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| ctx.shutdown.spawned() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();
        assert!(advertiser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lost_leadership_withdraws() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let elector = FixedElector::new(true);
        let engine = ServiceEngine::new(source, elector.clone(), advertiser.clone(), timing());
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 1).await;

        elector.leader.store(false, Ordering::SeqCst);
        wait_for(|| advertiser.calls().len() == 2).await;
        assert_eq!(advertiser.calls()[1], "withdraw 10.0.0.1");

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();
        assert_eq!(advertiser.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_advertise_failure_fails_engine() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser {
            fail: true,
            ..RecordingAdvertiser::default()
        });
        let engine = ServiceEngine::new(source, FixedElector::new(true), advertiser, timing());
        let ctx = context();

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        let result = engine.run(ctx.clone()).await;

        assert!(matches!(result, Err(ManagerError::Engine(_))));
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_many_failing_services_do_not_hang() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser {
            fail: true,
            ..RecordingAdvertiser::default()
        });
        let engine = ServiceEngine::new(source, FixedElector::new(true), advertiser, timing());
        let ctx = context();

        // More failing workers than the failure channel can buffer.
        for i in 0..40 {
            let uid = format!("svc-{}", i);
            let vip = format!("10.0.1.{}", i + 1);
            events
                .send(Ok(ServiceEvent::Applied(service(&uid, &[vip.as_str()]))))
                .unwrap();
        }

        let result = tokio::time::timeout(Duration::from_secs(5), engine.run(ctx.clone()))
            .await
            .expect("engine did not return");

        assert!(matches!(result, Err(ManagerError::Engine(_))));
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_election_errors_keep_vip_within_renew_deadline() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let elector = FixedElector::new(true);
        let timing = ElectionTiming {
            retry_period: Duration::from_millis(10),
            renew_deadline: Duration::from_secs(30),
        };
        let engine = ServiceEngine::new(source, elector.clone(), advertiser.clone(), timing);
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 1).await;

        elector.unreachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(advertiser.calls(), vec!["advertise 10.0.0.1"]);

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();
        assert_eq!(advertiser.calls().last().map(String::as_str), Some("withdraw 10.0.0.1"));
    }

    #[tokio::test]
    async fn test_election_errors_past_renew_deadline_withdraw() {
        let (source, events) = ChannelSource::new();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let elector = FixedElector::new(true);
        let engine = ServiceEngine::new(source, elector.clone(), advertiser.clone(), timing());
        let ctx = context();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            async move { engine.run(ctx).await }
        });

        events.send(Ok(ServiceEvent::Applied(service("a", &["10.0.0.1"])))).unwrap();
        wait_for(|| advertiser.calls().len() == 1).await;

        elector.unreachable.store(true, Ordering::SeqCst);
        wait_for(|| advertiser.calls().len() == 2).await;
        assert_eq!(advertiser.calls()[1], "withdraw 10.0.0.1");

        // Still unreachable: no second withdraw, no re-advertise.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(advertiser.calls().len(), 2);

        ctx.shutdown.trigger("test");
        run.await.unwrap().unwrap();
        assert_eq!(advertiser.calls().len(), 2);
    }
}
