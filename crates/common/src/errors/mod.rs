//! Error types for Lodestar services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - Transient vs. structural classification (drives retries)
//! - HTTP status code mapping
//! - Structured error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidQuery,

    // Resource errors (4xxx)
    NotFound,

    // External provider errors (8xxx)
    EmbeddingUnavailable,
    RerankerUnavailable,
    LanguageModelUnavailable,
    VectorStoreError,
    UpstreamError,
    RetrievalTimeout,

    // Pipeline errors (85xx)
    SynthesisFailure,
    IndexingError,
    Cancelled,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidQuery => 1002,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,

            // External (8xxx)
            ErrorCode::EmbeddingUnavailable => 8001,
            ErrorCode::RerankerUnavailable => 8002,
            ErrorCode::LanguageModelUnavailable => 8003,
            ErrorCode::VectorStoreError => 8004,
            ErrorCode::UpstreamError => 8005,
            ErrorCode::RetrievalTimeout => 8006,

            // Pipeline (85xx)
            ErrorCode::SynthesisFailure => 8501,
            ErrorCode::IndexingError => 8502,
            ErrorCode::Cancelled => 8503,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Input errors
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    // External provider errors
    #[error("Embedding provider unavailable: {message}")]
    EmbeddingUnavailable { message: String },

    #[error("Reranker unavailable: {message}")]
    RerankerUnavailable { message: String },

    #[error("Language model unavailable: {message}")]
    LanguageModelUnavailable { message: String },

    #[error("Vector store error: {message}")]
    VectorStore { message: String },

    #[error("Stage {stage} timed out after {timeout_ms}ms")]
    RetrievalTimeout { stage: String, timeout_ms: u64 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Pipeline errors
    #[error("Synthesis failed: {message}")]
    SynthesisFailure { message: String },

    #[error("Indexing failed: {message}")]
    Indexing { message: String },

    #[error("Query cancelled during {stage}")]
    Cancelled { stage: String },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::EmbeddingUnavailable { .. } => ErrorCode::EmbeddingUnavailable,
            AppError::RerankerUnavailable { .. } => ErrorCode::RerankerUnavailable,
            AppError::LanguageModelUnavailable { .. } => ErrorCode::LanguageModelUnavailable,
            AppError::VectorStore { .. } => ErrorCode::VectorStoreError,
            AppError::RetrievalTimeout { .. } => ErrorCode::RetrievalTimeout,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::SynthesisFailure { .. } => ErrorCode::SynthesisFailure,
            AppError::Indexing { .. } => ErrorCode::IndexingError,
            AppError::Cancelled { .. } => ErrorCode::Cancelled,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::InvalidQuery { .. } | AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,

            // 408 Request Timeout (client went away or cancelled)
            AppError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,

            // 500 Internal Server Error
            AppError::SynthesisFailure { .. }
            | AppError::Indexing { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::EmbeddingUnavailable { .. }
            | AppError::RerankerUnavailable { .. }
            | AppError::LanguageModelUnavailable { .. }
            | AppError::VectorStore { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::RetrievalTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            // 503 Service Unavailable
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Provider-level failures worth retrying with backoff.
    ///
    /// Structural errors (bad input, cancellation, configuration) are never
    /// transient and propagate immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::EmbeddingUnavailable { .. }
                | AppError::RerankerUnavailable { .. }
                | AppError::LanguageModelUnavailable { .. }
                | AppError::VectorStore { .. }
                | AppError::HttpClient(_)
        )
    }

    /// Whether this error was caused by query cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled { .. })
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub numeric_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let field = match &self {
            AppError::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                numeric_code: code.as_code(),
                message,
                field,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
