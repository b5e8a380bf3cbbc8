//! Error types for the embedding system

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding and prediction operations.
///
/// Transport failures, provider-side failures and malformed responses are kept
/// apart so callers can tell "the provider is unreachable" from "the provider
/// answered with something that does not line up with the request".
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when the provider configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Transport-level failure talking to the provider
    #[error("Request to inference provider failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    /// The provider answered with a non-success status or a failed prediction
    #[error("Inference provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    /// A prediction did not reach a terminal state in time
    #[error("Prediction {prediction_id} did not finish within {waited_secs}s")]
    Timeout {
        prediction_id: String,
        waited_secs: u64,
    },

    /// The provider returned a different number of embeddings than requested
    #[error("Provider returned {actual} embeddings for {expected} inputs")]
    ResponseMismatch { expected: usize, actual: usize },

    /// The provider returned vectors of an unexpected width
    #[error("Provider returned a {actual}-dimensional embedding, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The provider output could not be decoded
    #[error("Could not decode provider output: {source}")]
    Decode {
        #[from]
        source: serde_json::Error,
    },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a provider error from a status code and response body.
    pub fn provider<S: Into<String>>(status: u16, message: S) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Whether the provider's answer disagrees with what was requested, as opposed
    /// to the provider being unreachable or failing.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ResponseMismatch { .. } | Self::DimensionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_classification() {
        assert!(
            EmbedError::ResponseMismatch {
                expected: 3,
                actual: 2
            }
            .is_mismatch()
        );
        assert!(
            EmbedError::DimensionMismatch {
                expected: 1024,
                actual: 768
            }
            .is_mismatch()
        );
        assert!(!EmbedError::provider(502, "bad gateway").is_mismatch());
        assert!(!EmbedError::invalid_config("missing token").is_mismatch());
    }

    #[test]
    fn test_display_messages() {
        let err = EmbedError::ResponseMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "Provider returned 2 embeddings for 3 inputs");

        let err = EmbedError::provider(500, "boom");
        assert_eq!(
            err.to_string(),
            "Inference provider error (status 500): boom"
        );
    }
}
