use thiserror::Error;

/// Errors raised by the participant gateway and content filter.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A participant's response could not be parsed as the required schema,
    /// even after fence-stripping and trailing-comma repair.
    #[error("failed to parse participant response: {0}")]
    ResponseParseError(String),

    /// A required field was missing from an external participant's response.
    #[error("participant response missing required field(s): {0}")]
    SchemaViolation(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("network request failed: {0}")]
    NetworkError(String),

    #[error("HTTP error {status}: {message}")]
    HttpError { status: u16, message: String },

    /// A vendor status code that is neither retryable nor an overload signal.
    #[error("non-retryable status {status} from participant gateway")]
    NonRetryable { status: u16 },

    #[error("mutex poisoned: {0}")]
    LockPoisoned(String),

    #[error("gateway call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("internal error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ResponseParseError(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout { seconds: 30 }
        } else if err.is_connect() {
            GatewayError::NetworkError(format!("connection failed: {err}"))
        } else if let Some(status) = err.status() {
            GatewayError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            GatewayError::NetworkError(err.to_string())
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for GatewayError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GatewayError::LockPoisoned(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::SchemaViolation("stance, claim".to_string());
        assert_eq!(
            err.to_string(),
            "participant response missing required field(s): stance, claim"
        );
    }

    #[test]
    fn test_http_errors() {
        let err = GatewayError::HttpError {
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 503: Service Unavailable");

        let err = GatewayError::NonRetryable { status: 400 };
        assert_eq!(
            err.to_string(),
            "non-retryable status 400 from participant gateway"
        );
    }
}
