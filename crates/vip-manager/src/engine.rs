//! Advertisement engine selection.
//!
//! Exactly one engine runs per process. Selection is a pure function of
//! the configuration, evaluated in the fixed order BGP, ARP, WireGuard,
//! RoutingTable.

use crate::annotations::BgpNodeParams;
use crate::config::Config;
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::registry::InstanceRegistry;
use crate::shutdown::ShutdownCoordinator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Bgp,
    Arp,
    Wireguard,
    RoutingTable,
}

impl EngineKind {
    /// Selection priority order.
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Bgp,
        EngineKind::Arp,
        EngineKind::Wireguard,
        EngineKind::RoutingTable,
    ];

    fn enabled(self, config: &Config) -> bool {
        match self {
            EngineKind::Bgp => config.engine.bgp,
            EngineKind::Arp => config.engine.arp,
            EngineKind::Wireguard => config.engine.wireguard,
            EngineKind::RoutingTable => config.engine.routing_table,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Bgp => "BGP",
            EngineKind::Arp => "ARP",
            EngineKind::Wireguard => "Wireguard",
            EngineKind::RoutingTable => "Routing Table",
        };
        f.write_str(name)
    }
}

/// Choose the engine to run, or `None` when no engine is enabled.
pub fn select_engine(config: &Config) -> Option<EngineKind> {
    let mut enabled = EngineKind::ALL.into_iter().filter(|k| k.enabled(config));
    let chosen = enabled.next()?;

    let ignored: Vec<_> = enabled.map(|k| k.to_string()).collect();
    if !ignored.is_empty() {
        warn!(chosen = %chosen, ignored = ?ignored, "Multiple engines enabled, only the first is started");
    }
    Some(chosen)
}

/// Everything an engine needs from the manager.
#[derive(Clone)]
pub struct EngineContext {
    pub node_name: String,
    /// Present only for the BGP engine when node annotations are configured
    pub bgp: Option<BgpNodeParams>,
    pub registry: Arc<InstanceRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// A VIP advertisement engine.
///
/// `run` blocks until the shutdown token is cancelled or the engine fails.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(&self, ctx: EngineContext) -> Result<()>;
}

/// Engines available to the manager, keyed by family.
#[derive(Default, Clone)]
pub struct EngineSet {
    engines: HashMap<EngineKind, Arc<dyn Engine>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: EngineKind, engine: Arc<dyn Engine>) -> Self {
        self.engines.insert(kind, engine);
        self
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn Engine>> {
        self.engines.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bgp: bool, arp: bool, wireguard: bool, routing_table: bool) -> Config {
        let mut config = Config::default();
        config.engine.bgp = bgp;
        config.engine.arp = arp;
        config.engine.wireguard = wireguard;
        config.engine.routing_table = routing_table;
        config
    }

    #[test]
    fn test_single_flag_selects_that_engine() {
        assert_eq!(select_engine(&config(true, false, false, false)), Some(EngineKind::Bgp));
        assert_eq!(select_engine(&config(false, true, false, false)), Some(EngineKind::Arp));
        assert_eq!(
            select_engine(&config(false, false, true, false)),
            Some(EngineKind::Wireguard)
        );
        assert_eq!(
            select_engine(&config(false, false, false, true)),
            Some(EngineKind::RoutingTable)
        );
    }

    #[test]
    fn test_no_flag_selects_nothing() {
        assert_eq!(select_engine(&config(false, false, false, false)), None);
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(select_engine(&config(true, true, true, true)), Some(EngineKind::Bgp));
        assert_eq!(select_engine(&config(false, true, true, true)), Some(EngineKind::Arp));
        assert_eq!(
            select_engine(&config(false, false, true, true)),
            Some(EngineKind::Wireguard)
        );
    }
}
