//! Reqwest implementation of the broker contract.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use runinator_core::{DeadFiring, Firing};

use crate::http::types::{AckRequest, NackRequest, PublishResponse};
use crate::{AckStatus, Broker, BrokerError, LeasedFiring, PublishReceipt};

/// Slack added to the lease long-poll before the HTTP request itself
/// times out.
const LEASE_SLACK: Duration = Duration::from_secs(10);
/// Timeout for everything that is not a long-poll.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote broker speaking the control-plane HTTP API.
#[derive(Clone)]
pub struct HttpBroker {
    client: Client,
    base: Url,
}

impl HttpBroker {
    /// Connect to a broker endpoint such as `http://127.0.0.1:7070/`.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint is not a valid URL or the HTTP client
    /// cannot be constructed.
    pub fn new(endpoint: &str) -> Result<Self, BrokerError> {
        let mut normalized = endpoint.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized)
            .map_err(|_| BrokerError::InvalidEndpoint(endpoint.to_string()))?;
        let client = Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|err| BrokerError::Network(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, BrokerError> {
        self.base
            .join(path)
            .map_err(|_| BrokerError::InvalidEndpoint(format!("{}{path}", self.base)))
    }

    async fn remote_error(response: reqwest::Response) -> BrokerError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());
        BrokerError::Remote { status, message }
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn publish(&self, firing: Firing) -> Result<PublishReceipt, BrokerError> {
        let response = self
            .client
            .post(self.url("publish")?)
            .json(&firing)
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                let body: PublishResponse = response.json().await?;
                Ok(PublishReceipt {
                    id: body.id,
                    duplicate: false,
                })
            }
            StatusCode::CONFLICT => {
                let body: PublishResponse = response.json().await?;
                Ok(PublishReceipt {
                    id: body.id,
                    duplicate: true,
                })
            }
            _ => Err(Self::remote_error(response).await),
        }
    }

    async fn lease(
        &self,
        consumer_id: &str,
        max_wait: Duration,
    ) -> Result<Option<LeasedFiring>, BrokerError> {
        let mut url = self.url("lease")?;
        url.query_pairs_mut()
            .append_pair("consumer_id", consumer_id)
            .append_pair("wait_ms", &max_wait.as_millis().to_string());

        let response = self
            .client
            .post(url)
            .timeout(max_wait + LEASE_SLACK)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NO_CONTENT => Ok(None),
            _ => Err(Self::remote_error(response).await),
        }
    }

    async fn ack(&self, firing_id: u64, lease_token: &str) -> Result<AckStatus, BrokerError> {
        let response = self
            .client
            .post(self.url(&format!("ack/{firing_id}"))?)
            .json(&AckRequest {
                lease_token: lease_token.to_string(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(AckStatus::Acked),
            StatusCode::GONE => Ok(AckStatus::Stale),
            _ => Err(Self::remote_error(response).await),
        }
    }

    async fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<AckStatus, BrokerError> {
        let response = self
            .client
            .post(self.url(&format!("nack/{firing_id}"))?)
            .json(&NackRequest {
                lease_token: lease_token.to_string(),
                requeue,
                reason,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(AckStatus::Acked),
            StatusCode::GONE => Ok(AckStatus::Stale),
            _ => Err(Self::remote_error(response).await),
        }
    }

    async fn list_dead(&self) -> Result<Vec<DeadFiring>, BrokerError> {
        let response = self.client.get(self.url("dead")?).send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::remote_error(response).await)
        }
    }
}
