use thiserror::Error;

/// Failures talking to the web service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no web service is currently known: {0}")]
    NoService(String),

    #[error("invalid base URL `{url}`: {message}")]
    InvalidBaseUrl { url: String, message: String },

    #[error("request failed: {0}")]
    Network(String),

    #[error("web service returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("task has no id yet")]
    MissingTaskId,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            ApiError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ApiError::Network(err.to_string())
        }
    }
}
