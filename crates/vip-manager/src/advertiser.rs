//! Data-plane edge of each engine: making a VIP reachable from this node
//! and withdrawing it again.

use crate::annotations::BgpNodeParams;
use crate::metrics::MetricsRegistry;
use async_trait::async_trait;
use common::command::{args, ensure_absent, ensure_present};
use common::CommandRunner;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait Advertiser: Send + Sync {
    /// One-time setup before any VIP is advertised.
    async fn prepare(&self, _bgp: Option<&BgpNodeParams>) -> common::Result<()> {
        Ok(())
    }

    async fn advertise(&self, vip: IpAddr) -> common::Result<()>;

    async fn withdraw(&self, vip: IpAddr) -> common::Result<()>;
}

fn host_prefix(vip: IpAddr) -> String {
    match vip {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    }
}

/// Binds VIPs to a local interface. With `gratuitous_arp` set, each new
/// IPv4 VIP is announced with unsolicited ARP replies.
pub struct AddressAdvertiser {
    runner: Arc<dyn CommandRunner>,
    interface: String,
    gratuitous_arp: bool,
}

impl AddressAdvertiser {
    /// ARP mode: VIPs on the service interface, announced with gratuitous ARP.
    pub fn arp(runner: Arc<dyn CommandRunner>, interface: &str) -> Self {
        Self {
            runner,
            interface: interface.to_string(),
            gratuitous_arp: true,
        }
    }

    /// WireGuard mode: VIPs on the tunnel interface.
    pub fn wireguard(runner: Arc<dyn CommandRunner>, interface: &str) -> Self {
        Self {
            runner,
            interface: interface.to_string(),
            gratuitous_arp: false,
        }
    }
}

#[async_trait]
impl Advertiser for AddressAdvertiser {
    async fn advertise(&self, vip: IpAddr) -> common::Result<()> {
        let cidr = host_prefix(vip);
        let add = args(["addr", "add", cidr.as_str(), "dev", self.interface.as_str()]);
        ensure_present(self.runner.as_ref(), "ip", &add).await?;
        info!(vip = %vip, interface = %self.interface, "VIP bound");

        if self.gratuitous_arp && vip.is_ipv4() {
            let vip = vip.to_string();
            let result = self
                .runner
                .run("arping", &args(["-U", "-c", "3", "-I", self.interface.as_str(), vip.as_str()]))
                .await;
            if let Err(e) = result {
                warn!(error = %e, vip = %vip, "Gratuitous ARP failed");
            }
        }
        Ok(())
    }

    async fn withdraw(&self, vip: IpAddr) -> common::Result<()> {
        let cidr = host_prefix(vip);
        let del = args(["addr", "del", cidr.as_str(), "dev", self.interface.as_str()]);
        ensure_absent(self.runner.as_ref(), "ip", &del).await?;
        info!(vip = %vip, interface = %self.interface, "VIP unbound");
        Ok(())
    }
}

/// Programs host routes for VIPs into a dedicated kernel routing table.
pub struct RouteAdvertiser {
    runner: Arc<dyn CommandRunner>,
    interface: String,
    table: String,
    protocol: String,
}

impl RouteAdvertiser {
    pub fn new(runner: Arc<dyn CommandRunner>, interface: &str, table: u32, protocol: u8) -> Self {
        Self {
            runner,
            interface: interface.to_string(),
            table: table.to_string(),
            protocol: protocol.to_string(),
        }
    }

    fn route_args(&self, verb: &str, vip: IpAddr) -> Vec<String> {
        let prefix = host_prefix(vip);
        args([
            "route",
            verb,
            prefix.as_str(),
            "dev",
            self.interface.as_str(),
            "table",
            self.table.as_str(),
            "proto",
            self.protocol.as_str(),
        ])
    }
}

#[async_trait]
impl Advertiser for RouteAdvertiser {
    async fn advertise(&self, vip: IpAddr) -> common::Result<()> {
        self.runner.run("ip", &self.route_args("replace", vip)).await?;
        info!(vip = %vip, table = %self.table, "Route added");
        Ok(())
    }

    async fn withdraw(&self, vip: IpAddr) -> common::Result<()> {
        ensure_absent(self.runner.as_ref(), "ip", &self.route_args("del", vip)).await?;
        info!(vip = %vip, table = %self.table, "Route removed");
        Ok(())
    }
}

/// Announces VIPs through a local gobgp speaker.
pub struct BgpAdvertiser {
    runner: Arc<dyn CommandRunner>,
    gobgp: String,
    metrics: Arc<MetricsRegistry>,
}

impl BgpAdvertiser {
    pub fn new(runner: Arc<dyn CommandRunner>, gobgp: &str, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            runner,
            gobgp: gobgp.to_string(),
            metrics,
        }
    }

    fn rib_args(verb: &str, vip: IpAddr) -> Vec<String> {
        let family = if vip.is_ipv4() { "ipv4" } else { "ipv6" };
        let prefix = host_prefix(vip);
        args(["global", "rib", verb, "-a", family, prefix.as_str()])
    }
}

#[async_trait]
impl Advertiser for BgpAdvertiser {
    async fn prepare(&self, bgp: Option<&BgpNodeParams>) -> common::Result<()> {
        let Some(params) = bgp else {
            info!("No BGP node parameters, using the speaker's existing configuration");
            return Ok(());
        };

        let asn = params.node_asn.to_string();
        let router_id = params.source_ip.to_string();
        let global = args(["global", "as", asn.as_str(), "router-id", router_id.as_str()]);
        self.runner.run(&self.gobgp, &global).await?;

        let peer_asn = params.peer_asn.to_string();
        for peer in &params.peers {
            let peer = peer.to_string();
            let mut neighbor = args(["neighbor", "add", peer.as_str(), "as", peer_asn.as_str()]);
            if let Some(password) = &params.password {
                neighbor.extend(args(["auth-password", password.as_str()]));
            }

            match ensure_present(self.runner.as_ref(), &self.gobgp, &neighbor).await {
                Ok(()) => {
                    info!(peer = %peer, asn = params.peer_asn, "BGP peer configured");
                    self.metrics.set_bgp_session_state(&peer, "Idle");
                }
                Err(e) => {
                    self.metrics.set_bgp_session_state(&peer, "Failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn advertise(&self, vip: IpAddr) -> common::Result<()> {
        self.runner.run(&self.gobgp, &Self::rib_args("add", vip)).await?;
        info!(vip = %vip, "VIP announced over BGP");
        Ok(())
    }

    async fn withdraw(&self, vip: IpAddr) -> common::Result<()> {
        ensure_absent(self.runner.as_ref(), &self.gobgp, &Self::rib_args("del", vip)).await?;
        info!(vip = %vip, "VIP withdrawn from BGP");
        Ok(())
    }
}
