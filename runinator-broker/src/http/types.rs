//! Request and response bodies of the broker control plane.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseQuery {
    pub consumer_id: String,
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
}

fn default_wait_ms() -> u64 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub lease_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackRequest {
    pub lease_token: String,
    pub requeue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
