//! Traffic mirroring from the service interface to a capture interface.

use async_trait::async_trait;
use common::command::{args, ensure_absent, ensure_present};
use common::{CommandRunner, SystemCommand};
use std::sync::Arc;
use tracing::{debug, info};

/// Installs and removes a packet-duplication rule between two interfaces.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    async fn install(&self, src: &str, dst: &str) -> common::Result<()>;
    async fn remove(&self, src: &str) -> common::Result<()>;
}

/// Mirrors with tc: an ingress qdisc and a root prio qdisc on the source,
/// each with a matchall filter whose mirred action copies to the destination.
pub struct TcMirror {
    runner: Arc<dyn CommandRunner>,
}

impl TcMirror {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Default for TcMirror {
    fn default() -> Self {
        Self::new(Arc::new(SystemCommand))
    }
}

#[async_trait]
impl MirrorBackend for TcMirror {
    async fn install(&self, src: &str, dst: &str) -> common::Result<()> {
        // Clearing first keeps a repeated install from stacking filters.
        self.remove(src).await?;

        let runner = self.runner.as_ref();
        let ingress = args(["qdisc", "add", "dev", src, "handle", "ffff:", "ingress"]);
        ensure_present(runner, "tc", &ingress).await?;
        runner
            .run(
                "tc",
                &args([
                    "filter", "add", "dev", src, "parent", "ffff:", "matchall", "action", "mirred",
                    "egress", "mirror", "dev", dst,
                ]),
            )
            .await?;

        let root = args(["qdisc", "add", "dev", src, "handle", "1:", "root", "prio"]);
        ensure_present(runner, "tc", &root).await?;
        runner
            .run(
                "tc",
                &args([
                    "filter", "add", "dev", src, "parent", "1:", "matchall", "action", "mirred",
                    "egress", "mirror", "dev", dst,
                ]),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, src: &str) -> common::Result<()> {
        let runner = self.runner.as_ref();
        ensure_absent(runner, "tc", &args(["qdisc", "del", "dev", src, "ingress"])).await?;
        ensure_absent(runner, "tc", &args(["qdisc", "del", "dev", src, "root"])).await?;
        Ok(())
    }
}

/// Mirroring side channel; both operations are no-ops unless a destination
/// interface is configured.
pub struct TrafficMirror {
    backend: Arc<dyn MirrorBackend>,
    source: String,
    destination: Option<String>,
}

impl TrafficMirror {
    pub fn new(backend: Arc<dyn MirrorBackend>, source: &str, destination: &str) -> Self {
        Self {
            backend,
            source: source.to_string(),
            destination: (!destination.is_empty()).then(|| destination.to_string()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.destination.is_some()
    }

    pub async fn start(&self) -> common::Result<()> {
        let Some(dst) = &self.destination else {
            debug!("skip starting traffic mirroring since it's not enabled");
            return Ok(());
        };
        info!(src = %self.source, dst = %dst, "Mirroring traffic");
        self.backend.install(&self.source, dst).await
    }

    pub async fn stop(&self) -> common::Result<()> {
        if self.destination.is_none() {
            debug!("skip stopping traffic mirroring since it's not enabled");
            return Ok(());
        }
        info!(interface = %self.source, "Cleaning up qdisc config");
        self.backend.remove(&self.source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Keeps installed rules in memory, keyed by source interface.
    #[derive(Default)]
    struct FakeBackend {
        rules: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl MirrorBackend for FakeBackend {
        async fn install(&self, src: &str, dst: &str) -> common::Result<()> {
            self.rules.lock().unwrap().insert(src.to_string(), dst.to_string());
            Ok(())
        }

        async fn remove(&self, src: &str) -> common::Result<()> {
            self.rules.lock().unwrap().remove(src);
            Ok(())
        }
    }

    /// Records every command, failing qdisc deletes as if nothing was installed.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> common::Result<String> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            if line.contains("qdisc del") {
                return Err(Error::command_failed(
                    line,
                    "Error: Cannot find specified qdisc on specified device.",
                ));
            }
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_disabled_mirror_is_noop() {
        let backend = Arc::new(FakeBackend::default());
        let mirror = TrafficMirror::new(backend.clone(), "eth0", "");

        assert!(!mirror.enabled());
        mirror.start().await.unwrap();
        assert!(backend.rules.lock().unwrap().is_empty());
        mirror.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_then_stop_is_net_noop() {
        let backend = Arc::new(FakeBackend::default());
        let mirror = TrafficMirror::new(backend.clone(), "eth1", "mirror0");

        mirror.start().await.unwrap();
        assert_eq!(
            backend.rules.lock().unwrap().get("eth1").map(String::as_str),
            Some("mirror0")
        );

        mirror.stop().await.unwrap();
        assert!(backend.rules.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tc_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let tc = TcMirror::new(runner.clone());

        tc.install("eth0", "mirror0").await.unwrap();
        tc.remove("eth0").await.unwrap();

        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "tc qdisc del dev eth0 ingress",
                "tc qdisc del dev eth0 root",
                "tc qdisc add dev eth0 handle ffff: ingress",
                "tc filter add dev eth0 parent ffff: matchall action mirred egress mirror dev mirror0",
                "tc qdisc add dev eth0 handle 1: root prio",
                "tc filter add dev eth0 parent 1: matchall action mirred egress mirror dev mirror0",
                "tc qdisc del dev eth0 ingress",
                "tc qdisc del dev eth0 root",
            ]
        );
    }
}
