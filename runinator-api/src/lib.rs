//! HTTP client for the Runinator web service.
//!
//! The client is generic over a [`ServiceLocator`] so callers can pin a
//! base URL from configuration or follow the freshest gossip announcement;
//! either way every request re-resolves the base, so a web service restart
//! redirects traffic without any plumbing.

pub mod client;
pub mod error;
pub mod locator;

pub use client::ApiClient;
pub use error::ApiError;
pub use locator::{FixedLocator, GossipLocator, ServiceLocator};
