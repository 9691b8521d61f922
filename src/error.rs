//! Error types for Driftwood
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// The federation-facing variants mirror the admission/verification
/// taxonomy: each maps to the HTTP status a delivering peer receives.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Activity is missing required fields or has a malformed shape (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// HTTP signature missing, unresolvable or cryptographically wrong (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Sender domain is not on the federation allow-list (403)
    #[error("Domain is not federated")]
    DomainNotFederated,

    /// Sender actor or domain is blocked (403)
    #[error("Blocked")]
    Blocked,

    /// Daily received-post ceiling or inbound throttle exceeded (429)
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Activity type denied by the target account's capability flags (403)
    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    /// Webfinger/actor resolution found no matching actor (404)
    #[error("Actor not found")]
    ActorNotFound,

    /// Handle could not be parsed as nickname@domain or an actor URL (400)
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Webfinger or actor fetch failed at the network level (502, retryable)
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    /// A single outbound delivery attempt failed (transient, retried)
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Outbound delivery exhausted its retry budget (logged, dropped)
    #[error("Delivery abandoned after {attempts} attempts: {inbox}")]
    DeliveryAbandoned { inbox: String, attempts: u32 },

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Object store error (500)
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// True for failures a remote peer may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited
                | AppError::ResolutionFailed(_)
                | AppError::DeliveryFailed(_)
                | AppError::Storage(_)
                | AppError::HttpClient(_)
        )
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Rejected deliveries get a terse status with no activity content
    /// echoed back.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::ActorNotFound => (StatusCode::NOT_FOUND, self.to_string(), "actor_not_found"),
            AppError::MalformedActivity(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "malformed_activity")
            }
            AppError::InvalidHandle(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "invalid_handle")
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::DomainNotFederated => (
                StatusCode::FORBIDDEN,
                self.to_string(),
                "domain_not_federated",
            ),
            AppError::Blocked => (StatusCode::FORBIDDEN, self.to_string(), "blocked"),
            AppError::CapabilityDenied(msg) => {
                (StatusCode::FORBIDDEN, msg.clone(), "capability_denied")
            }
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                self.to_string(),
                "rate_limited",
            ),
            AppError::ResolutionFailed(msg) => {
                (StatusCode::BAD_GATEWAY, msg.clone(), "resolution_failed")
            }
            AppError::DeliveryFailed(msg) => {
                (StatusCode::BAD_GATEWAY, msg.clone(), "delivery_failed")
            }
            AppError::DeliveryAbandoned { .. } => (
                StatusCode::BAD_GATEWAY,
                self.to_string(),
                "delivery_abandoned",
            ),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error".to_string(),
                "storage",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
