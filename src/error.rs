//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure talking to the provider's registration API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Network trouble or a provider-side 5xx; worth retrying.
    #[error("transient registration failure: {0}")]
    Transient(String),

    /// The provider rejected the request; retrying will not help.
    #[error("permanent registration failure: {0}")]
    Permanent(String),

    #[error("callback already registered: {0}")]
    AlreadyRegistered(String),
}

impl RegistrationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistrationError::Transient(_))
    }
}

/// Reasons an inbound request is rejected before it reaches the dispatcher.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("request body exceeds the configured limit")]
    BodyTooLarge,

    #[error("signature verification failed")]
    BadSignature,
}

impl ValidationError {
    pub fn status(&self) -> StatusCode {
        match self {
            ValidationError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ValidationError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ValidationError::BadSignature => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

/// Errors reported by a downstream pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Queue full or pipeline unavailable.
    #[error("pipeline is busy")]
    Busy,

    #[error("pipeline failed: {0}")]
    Failed(String),
}

/// Configuration problems, raised while loading or validating.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level errors surfaced by [`crate::Gateway`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {operation} while gateway is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::gateway::GatewayState,
    },

    #[error("timed out during shutdown: {0}")]
    ShutdownTimeout(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RegistrationError::Transient("503".into()).is_transient());
        assert!(!RegistrationError::Permanent("400".into()).is_transient());
        assert!(!RegistrationError::AlreadyRegistered("http://x".into()).is_transient());
    }

    #[test]
    fn test_validation_status_codes() {
        assert_eq!(ValidationError::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(ValidationError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ValidationError::BadSignature.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_gateway_error_wraps_registration() {
        let err: GatewayError = RegistrationError::Permanent("bad token".into()).into();
        assert!(matches!(err, GatewayError::Registration(RegistrationError::Permanent(_))));
        assert!(err.to_string().contains("bad token"));
    }

    #[test]
    fn test_invalid_value_display() {
        let err = ConfigError::invalid("busy_status", "must be 429 or 503");
        let display = err.to_string();
        assert!(display.contains("busy_status"));
        assert!(display.contains("429 or 503"));
    }
}
