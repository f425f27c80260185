use thiserror::Error;

/// Application-wide error types for Harvest.
#[derive(Error, Debug)]
pub enum AppError {
    /// Fetch attempt exceeded its per-attempt timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error (DNS, connect, reset).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Upstream answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Upstream asked us to slow down (HTTP 429).
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// robots.txt disallows the URL for our user agent.
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// The page did not match the configured ruleset.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Field-level normalization rejected a raw record.
    #[error("Normalization error: {0}")]
    NormalizationError(String),

    /// A record violated its schema.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Admission was rejected because too many jobs are waiting.
    #[error("Queue saturated: {depth} jobs pending, rejected source {source_id}")]
    QueueSaturated { source_id: String, depth: usize },

    /// External cancellation signal.
    #[error("Cancelled")]
    Cancelled,

    /// Illegal job state transition.
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Source registry row or file is invalid.
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short stable label used for metrics and quarantine reason codes.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Timeout(_)
            | AppError::NetworkError(_)
            | AppError::RateLimitExceeded => "transient_fetch",
            AppError::HttpStatus { .. } if self.is_retryable() => "transient_fetch",
            AppError::HttpStatus { .. } => "http_status",
            AppError::PolicyDenied(_) => "policy_denied",
            AppError::ExtractionError(_) => "extraction_error",
            AppError::NormalizationError(_) => "normalization_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::QueueSaturated { .. } => "queue_saturated",
            AppError::Cancelled => "cancelled",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::ConfigError(_) => "config_error",
            AppError::RegistryError(_) => "registry_error",
            AppError::StorageError(_) => "storage_error",
            AppError::SerializationError(_) => "serialization_error",
            AppError::Generic(_) => "generic",
        }
    }

    /// Reason code recorded when a page's yield is quarantined because of this error.
    pub fn page_reason_code(&self) -> String {
        match self {
            AppError::HttpStatus { status, .. } => format!("http_status:{status}"),
            other => other.kind().to_string(),
        }
    }
}
