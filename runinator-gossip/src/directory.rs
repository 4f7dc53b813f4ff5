//! Process-local directory of known service announcements.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{ServiceAnnouncement, ServiceKind};

/// Announcements older than this are expired on every read.
pub const ANNOUNCE_TTL_SECS: i64 = 10;

/// Mutex-guarded map of live announcements, keyed by `(kind, service_id)`,
/// TTL-pruned lazily on read. Written only by the gossip receive task.
#[derive(Clone)]
pub struct ServiceDirectory {
    services: Arc<Mutex<HashMap<(ServiceKind, String), ServiceAnnouncement>>>,
    notify: Arc<Notify>,
    ttl: Duration,
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl_secs(ANNOUNCE_TTL_SECS)
    }

    /// Directory with a non-default TTL. Tests use short TTLs to observe
    /// expiry without waiting.
    #[must_use]
    pub fn with_ttl_secs(secs: i64) -> Self {
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            ttl: Duration::seconds(secs),
        }
    }

    /// Upsert a received announcement.
    ///
    /// A blank `address` is replaced with the datagram sender's IP, and a
    /// missing `service_id` is synthesized from `address:port`, so even
    /// minimal announcements land under a stable key.
    pub fn absorb(&self, kind: ServiceKind, mut announcement: ServiceAnnouncement, sender_ip: &str) {
        if announcement.address.trim().is_empty() {
            announcement.address = sender_ip.to_string();
        }
        if announcement.service_id.trim().is_empty() {
            announcement.service_id =
                format!("{}:{}", announcement.address, announcement.port);
        }
        if let Some(path) = announcement.base_path.take() {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                announcement.base_path = Some(trimmed.to_string());
            }
        }

        let key = (kind, announcement.service_id.clone());
        let is_new = {
            let mut guard = self.services.lock();
            guard.insert(key, announcement.clone()).is_none()
        };

        if is_new {
            tracing::info!(
                kind = %kind,
                address = %announcement.address,
                port = announcement.port,
                "discovered service"
            );
        }
        self.notify.notify_waiters();
    }

    /// The live announcement with the freshest heartbeat for `kind`.
    pub fn freshest(&self, kind: ServiceKind) -> Option<ServiceAnnouncement> {
        let now = Utc::now();
        let mut guard = self.services.lock();
        guard.retain(|_, svc| now - svc.last_heartbeat <= self.ttl);
        guard
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, svc)| svc)
            .max_by_key(|svc| svc.last_heartbeat)
            .cloned()
    }

    /// Base URL of the freshest `kind` announcement, if any is live.
    pub fn base_url(&self, kind: ServiceKind) -> Option<String> {
        self.freshest(kind).map(|svc| announcement_base_url(&svc))
    }

    /// Block until some `kind` announcement is live and return its base URL.
    pub async fn wait_for_url(&self, kind: ServiceKind) -> String {
        loop {
            if let Some(url) = self.base_url(kind) {
                return url;
            }
            self.notify.notified().await;
        }
    }

    /// Number of live entries (all kinds). Prunes first.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.services.lock();
        guard.retain(|_, svc| now - svc.last_heartbeat <= self.ttl);
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `http://address:port/<base_path>/` with a guaranteed trailing slash.
pub fn announcement_base_url(service: &ServiceAnnouncement) -> String {
    let mut base = format!("http://{}:{}", service.address, service.port);
    if let Some(path) = service.base_path.as_deref() {
        let trimmed = path.trim().trim_matches('/');
        if !trimmed.is_empty() {
            base.push('/');
            base.push_str(trimmed);
        }
    }
    base.push('/');
    base
}
