//! Error types for the automation service
//!
//! One enum covers the engine, the webhook subsystem and the HTTP API. Each
//! variant maps to a status code and a stable error code for API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use crm_shared::ValidationError;
use serde_json::json;
use thiserror::Error;

/// Result type alias for automation operations
pub type AutomationResult<T> = Result<T, AutomationError>;

#[derive(Error, Debug)]
pub enum AutomationError {
    /// Rule or action definition is missing required fields
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Malformed request field
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Illegal rule status change
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    /// A dependent service refused or failed a command
    #[error("Collaborator error from {service}: {message}")]
    Collaborator { service: String, message: String },

    /// Unexpected failure while evaluating a rule
    #[error("Engine fault in rule {rule_id}: {message}")]
    EngineFault { rule_id: String, message: String },

    /// Bounded queue is full or closed
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },

    #[error("HTTP client error: {source}")]
    HttpClient {
        #[from]
        source: reqwest::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AutomationError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition<S1: Into<String>, S2: Into<String>>(from: S1, to: S2) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn collaborator<S1: Into<String>, S2: Into<String>>(service: S1, message: S2) -> Self {
        Self::Collaborator {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn engine_fault<S1: Into<String>, S2: Into<String>>(rule_id: S1, message: S2) -> Self {
        Self::EngineFault {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    pub fn service_unavailable<S: Into<String>>(service: S) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
        }
    }

    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AutomationError::Configuration { .. } | AutomationError::Validation { .. } => {
                StatusCode::BAD_REQUEST
            }
            AutomationError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AutomationError::NotFound { .. } => StatusCode::NOT_FOUND,
            AutomationError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
            AutomationError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AutomationError::EngineFault { .. }
            | AutomationError::HttpClient { .. }
            | AutomationError::Serialization { .. }
            | AutomationError::Encryption { .. }
            | AutomationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error (for API responses)
    pub fn error_code(&self) -> &'static str {
        match self {
            AutomationError::Configuration { .. } => "CONFIGURATION_ERROR",
            AutomationError::Validation { .. } => "VALIDATION_ERROR",
            AutomationError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AutomationError::NotFound { .. } => "NOT_FOUND",
            AutomationError::Collaborator { .. } => "COLLABORATOR_ERROR",
            AutomationError::EngineFault { .. } => "ENGINE_FAULT",
            AutomationError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            AutomationError::HttpClient { .. } => "HTTP_CLIENT_ERROR",
            AutomationError::Serialization { .. } => "SERIALIZATION_ERROR",
            AutomationError::Encryption { .. } => "ENCRYPTION_ERROR",
            AutomationError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AutomationError::HttpClient { .. } | AutomationError::ServiceUnavailable { .. }
        )
    }
}

impl From<ValidationError> for AutomationError {
    fn from(error: ValidationError) -> Self {
        Self::Validation {
            field: error.field,
            message: error.message,
        }
    }
}

impl From<validator::ValidationErrors> for AutomationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ValidationError::from(errors).into()
    }
}

impl IntoResponse for AutomationError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_code = self.error_code();
        let error_message = self.to_string();

        if status_code.is_server_error() {
            tracing::error!(
                error_code = error_code,
                error_message = %error_message,
                "Automation service error"
            );
        } else {
            tracing::debug!(
                error_code = error_code,
                error_message = %error_message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": error_message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "retryable": self.is_retryable()
            }
        }));

        (status_code, body).into_response()
    }
}
