//! Prometheus metrics for the VIP manager.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Mutex;

/// Prefix applied to every series.
pub const METRICS_PREFIX: &str = "kube_vip_manager";

/// Labels for BGP session metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    /// Session state (Idle, Connect, Active, OpenSent, OpenConfirm, Established)
    pub state: String,
    /// Peer address
    pub peer: String,
}

/// `type` is a keyword, so the event label set is a plain pair list.
type EventLabels = Vec<(String, String)>;

/// Metrics registry with all manager series
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Service watcher events by type
    service_events: Family<EventLabels, Counter>,
    /// 1 for the current state of each peer, 0 for its previous states
    bgp_session_info: Family<SessionLabels, Gauge>,
    /// Last recorded state per peer
    peer_states: Mutex<Vec<(String, String)>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRICS_PREFIX);

        let service_events = Family::<EventLabels, Counter>::default();
        registry.register(
            "all_services_events",
            "Count all events fired by the service watcher categorised by event type",
            service_events.clone(),
        );

        let bgp_session_info = Family::<SessionLabels, Gauge>::default();
        registry.register(
            "bgp_session_info",
            "Display state of session by setting metric for label value with current state to 1",
            bgp_session_info.clone(),
        );

        Self {
            registry,
            service_events,
            bgp_session_info,
            peer_states: Mutex::new(Vec::new()),
        }
    }

    /// Count a service watcher event (ADDED, MODIFIED, DELETED)
    pub fn record_service_event(&self, event_type: &str) {
        self.service_events
            .get_or_create(&vec![("type".to_string(), event_type.to_string())])
            .inc();
    }

    /// Record the current session state for `peer`
    pub fn set_bgp_session_state(&self, peer: &str, state: &str) {
        let mut states = self.peer_states.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = states.iter_mut().find(|(p, _)| p == peer) {
            if entry.1 != state {
                self.bgp_session_info
                    .get_or_create(&SessionLabels {
                        state: entry.1.clone(),
                        peer: peer.to_string(),
                    })
                    .set(0);
                entry.1 = state.to_string();
            }
        } else {
            states.push((peer.to_string(), state.to_string()));
        }

        self.bgp_session_info
            .get_or_create(&SessionLabels {
                state: state.to_string(),
                peer: peer.to_string(),
            })
            .set(1);
    }

    /// Current value of the service event counter for `event_type`
    pub fn service_events(&self, event_type: &str) -> u64 {
        self.service_events
            .get_or_create(&vec![("type".to_string(), event_type.to_string())])
            .get()
    }

    /// Render the registry in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
