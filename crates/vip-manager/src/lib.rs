//! VIP manager for load-balanced cluster services.
//!
//! Watches `LoadBalancer` services and makes their virtual IPs reachable
//! from exactly one node at a time, using one of four engines:
//!
//! - **BGP**: announces host routes through a local gobgp speaker
//! - **ARP**: binds VIPs to the service interface and sends gratuitous ARP
//! - **WireGuard**: binds VIPs to the tunnel interface
//! - **Routing table**: installs host routes in a dedicated table
//!
//! Per-service leases decide which node advertises a VIP. The [`Manager`]
//! selects the engine, prepares it, and coordinates shutdown.

pub mod advertiser;
pub mod annotations;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod http_server;
pub mod manager;
pub mod metrics;
pub mod mirror;
pub mod registry;
pub mod service_engine;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineContext, EngineKind, EngineSet};
pub use error::{ManagerError, Result};
pub use http_server::MetricsServer;
pub use manager::Manager;
pub use metrics::MetricsRegistry;
pub use registry::InstanceRegistry;
pub use shutdown::{Phase, ShutdownCoordinator};
pub use telemetry::{TelemetryGuard, setup_tracing};
