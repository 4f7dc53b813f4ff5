//! UDP gossip discovery.
//!
//! Every Runinator process periodically announces its endpoint as a JSON
//! datagram to a configured list of peers, and absorbs the announcements it
//! hears into a TTL-pruned [`ServiceDirectory`]. Consumers resolve "the
//! current web service URL" (or broker, scheduler, worker) by picking the
//! announcement with the freshest heartbeat, so a restarted service takes
//! over as soon as it starts announcing.

pub mod directory;
pub mod net;

pub use directory::{announcement_base_url, ServiceDirectory, ANNOUNCE_TTL_SECS};
pub use net::{
    announce_targets, bind_listener, bind_sender, spawn_announcer, spawn_listener,
    ANNOUNCE_INTERVAL, DEFAULT_GOSSIP_BIND, DEFAULT_GOSSIP_PORT,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which Runinator service an announcement describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    WebService,
    Broker,
    Scheduler,
    Worker,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::WebService => "web_service",
            Self::Broker => "broker",
            Self::Scheduler => "scheduler",
            Self::Worker => "worker",
        };
        f.write_str(label)
    }
}

/// Soft-state record of one service endpoint.
///
/// `service_id` and `address` may arrive blank on the wire; the receiving
/// side fills them in (sender IP, `address:port`) before storing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceAnnouncement {
    /// Announcement template for this process. The announcer refreshes
    /// `last_heartbeat` on every tick.
    pub fn new(service_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            service_id: service_id.into(),
            address: address.into(),
            port,
            base_path: None,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        let path = base_path.into();
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            self.base_path = Some(trimmed.to_string());
        }
        self
    }
}

/// Wire format of one gossip datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    WebService { service: ServiceAnnouncement },
    Broker { service: ServiceAnnouncement },
    Scheduler { service: ServiceAnnouncement },
    Worker { service: ServiceAnnouncement },
}

impl GossipMessage {
    pub fn new(kind: ServiceKind, service: ServiceAnnouncement) -> Self {
        match kind {
            ServiceKind::WebService => Self::WebService { service },
            ServiceKind::Broker => Self::Broker { service },
            ServiceKind::Scheduler => Self::Scheduler { service },
            ServiceKind::Worker => Self::Worker { service },
        }
    }

    pub fn into_parts(self) -> (ServiceKind, ServiceAnnouncement) {
        match self {
            Self::WebService { service } => (ServiceKind::WebService, service),
            Self::Broker { service } => (ServiceKind::Broker, service),
            Self::Scheduler { service } => (ServiceKind::Scheduler, service),
            Self::Worker { service } => (ServiceKind::Worker, service),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_type_tagged() {
        let message = GossipMessage::new(
            ServiceKind::WebService,
            ServiceAnnouncement::new("abc", "10.0.0.5", 8080),
        );
        let json = message.to_json().unwrap();
        assert!(json.contains(r#""type":"web_service""#));
        assert!(json.contains(r#""port":8080"#));

        let (kind, service) = GossipMessage::from_json(&json).unwrap().into_parts();
        assert_eq!(kind, ServiceKind::WebService);
        assert_eq!(service.address, "10.0.0.5");
    }
}
