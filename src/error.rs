//! Error types for the Managed Backup Operator
//!
//! Provides structured error types for all operator components including
//! cloud storage drivers, dependent-resource reconciliation, and the
//! instance coordinator.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Credentials secret {secret} does not contain required key {key}")]
    CredentialsKey { secret: String, key: String },

    // =========================================================================
    // Cloud Provider Errors
    // =========================================================================
    #[error("{provider} API error ({}): {message}", code.as_deref().unwrap_or("unknown"))]
    Provider {
        provider: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("error occurred when {step} bucket {bucket}: {message}")]
    BucketStep {
        step: &'static str,
        bucket: String,
        message: String,
    },

    #[error("proposed bucket {0} already exists, retrying")]
    ProposedNameTaken(String),

    #[error("storage account name {0} not available")]
    AccountNameTaken(String),

    // =========================================================================
    // Dependent Resource Errors
    // =========================================================================
    #[error("failed to decode {kind} provider payload: {message}")]
    SpecDecode { kind: &'static str, message: String },

    // =========================================================================
    // Parse / Transport Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JWT signing error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a cloud provider error with an optional service code.
    pub fn provider(
        provider: &'static str,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Provider {
            provider,
            code,
            message: message.into(),
        }
    }

    /// The provider service code carried by this error, if any.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Error::Provider { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Http(_) | Error::Provider { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // The next pass proposes a fresh name
            Error::ProposedNameTaken(_) | Error::AccountNameTaken(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Hardening failures - the bucket machine resumes at verification
            Error::BucketStep { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_) | Error::CredentialsKey { .. } | Error::SpecDecode { .. } => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
