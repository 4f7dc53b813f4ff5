//! Where is the web service right now?

use std::time::Duration;

use async_trait::async_trait;
use runinator_gossip::{ServiceDirectory, ServiceKind};

use crate::error::ApiError;

/// How long a gossip-driven lookup waits for a first announcement before
/// giving up.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves the web service base URL, once per request.
#[async_trait]
pub trait ServiceLocator: Send + Sync {
    async fn base_url(&self) -> Result<String, ApiError>;
}

/// A base URL pinned from configuration (`--api-base-url`).
#[derive(Debug, Clone)]
pub struct FixedLocator {
    base: String,
}

impl FixedLocator {
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into().trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { base }
    }
}

#[async_trait]
impl ServiceLocator for FixedLocator {
    async fn base_url(&self) -> Result<String, ApiError> {
        Ok(self.base.clone())
    }
}

/// Follows the freshest `web_service` gossip announcement.
#[derive(Clone)]
pub struct GossipLocator {
    directory: ServiceDirectory,
}

impl GossipLocator {
    #[must_use]
    pub fn new(directory: ServiceDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ServiceLocator for GossipLocator {
    async fn base_url(&self) -> Result<String, ApiError> {
        if let Some(url) = self.directory.base_url(ServiceKind::WebService) {
            return Ok(url);
        }
        tokio::time::timeout(
            DISCOVERY_TIMEOUT,
            self.directory.wait_for_url(ServiceKind::WebService),
        )
        .await
        .map_err(|_| {
            ApiError::NoService(format!(
                "no web_service announcement within {}s",
                DISCOVERY_TIMEOUT.as_secs()
            ))
        })
    }
}
