use thiserror::Error;

/// Transport and protocol failures surfaced by a broker binding.
///
/// The in-memory queue never fails; every variant here originates in the
/// HTTP binding.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("broker request failed: {0}")]
    Network(String),

    #[error("broker returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("unexpected broker response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            BrokerError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            BrokerError::Network(err.to_string())
        }
    }
}
