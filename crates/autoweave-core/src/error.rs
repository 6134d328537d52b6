//! Unified error types for AutoWeave using thiserror.
//!
//! Every failure surfaced to a caller or the event bus carries a stable
//! `kind()` tag, a retryability flag, and the plugin/job id where one applies.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// The unified error type for AutoWeave operations
#[derive(Error, Debug)]
pub enum Error {
    // Manifest / validation errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Manifest invalid for {plugin_id}: {errors}")]
    ManifestInvalid {
        plugin_id: String,
        errors: ValidationErrors,
    },

    #[error("Signature invalid for plugin {plugin_id}: {reason}")]
    SignatureInvalid { plugin_id: String, reason: String },

    // Plugin lifecycle errors
    #[error("Plugin not found: {plugin_id}")]
    PluginNotFound { plugin_id: String },

    #[error("Plugin already loaded: {plugin_id}")]
    AlreadyLoaded { plugin_id: String },

    #[error("Plugin already running: {plugin_id}")]
    AlreadyRunning { plugin_id: String },

    #[error("Plugin not running: {plugin_id}")]
    NotRunning { plugin_id: String },

    #[error("Plugin blocked: {plugin_id} ({reason})")]
    PluginBlocked { plugin_id: String, reason: String },

    #[error("Plugin quota exceeded: {loaded} of {max} plugins loaded")]
    QuotaExceeded { loaded: usize, max: usize },

    #[error("Host locked after repeated security violations")]
    HostLocked,

    #[error("Plugin error: {plugin_id} - {message}")]
    Plugin { plugin_id: String, message: String },

    // Channel / IPC errors
    #[error("Channel closed for plugin {plugin_id}")]
    ChannelClosed { plugin_id: String },

    #[error("Message rate exceeded for plugin {plugin_id}: {limit}/s")]
    RateExceeded { plugin_id: String, limit: u32 },

    #[error("Message too large: {size} bytes (cap {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Message schema invalid for type {message_type}: {reason}")]
    SchemaInvalid {
        message_type: String,
        reason: String,
    },

    #[error("Crypto failure on channel for plugin {plugin_id}: {reason}")]
    Crypto { plugin_id: String, reason: String },

    // Permission / security errors
    #[error("Permission denied for {plugin_id}: {action} requires {required}")]
    PermissionDenied {
        plugin_id: String,
        action: String,
        required: String,
    },

    // Job / queue errors
    #[error("Job error: {job_id} - {message}")]
    Job { job_id: String, message: String },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job timeout: {job_id} exceeded {timeout_ms}ms")]
    JobTimeout { job_id: String, timeout_ms: u64 },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Backpressure: queue {queue} is at capacity ({backlog} waiting)")]
    Backpressure { queue: String, backlog: usize },

    #[error("Duplicate job: idempotency key {key} already present on {queue}")]
    DuplicateJob { queue: String, key: String },

    #[error("Lease not held: job {job_id} is not active")]
    LeaseNotHeld { job_id: String },

    // Ingress / storage errors
    #[error("Stream error: {message}")]
    Stream {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Serialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // Shutdown
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    // Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        request_id: Option<Uuid>,
    },

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Validation errors container
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            code: None,
        });
    }

    pub fn add_with_code(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            code: Some(code.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    pub fn into_result<T>(self, value: T) -> Result<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(Error::Validation(self))
        }
    }
}

/// A single validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Error {
    /// Create a stream error
    pub fn stream(message: impl Into<String>) -> Self {
        Error::Stream {
            message: message.into(),
            source: None,
        }
    }

    /// Create a stream error with source
    pub fn stream_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Stream {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a plugin error
    pub fn plugin(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Plugin {
            plugin_id: plugin_id.into(),
            message: message.into(),
        }
    }

    /// Create a job error
    pub fn job(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Job {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
            request_id: None,
        }
    }

    /// Create a permission-denied error
    pub fn permission_denied(
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        required: impl Into<String>,
    ) -> Self {
        Error::PermissionDenied {
            plugin_id: plugin_id.into(),
            action: action.into(),
            required: required.into(),
        }
    }

    /// Create a validation error from a single message
    pub fn validation(message: impl Into<String>) -> Self {
        let msg = message.into();
        let mut errors = ValidationErrors::new();
        errors.add("validation", &msg);
        Error::Validation(errors)
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Stream { .. }
                | Error::Storage { .. }
                | Error::JobTimeout { .. }
                | Error::Backpressure { .. }
                | Error::RateExceeded { .. }
        )
    }

    /// Stable error kind tag for the event bus and admin surfaces
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::ManifestInvalid { .. } => "manifest-invalid",
            Error::SignatureInvalid { .. } => "signature-invalid",
            Error::PluginNotFound { .. } => "plugin-not-found",
            Error::AlreadyLoaded { .. } => "already-loaded",
            Error::AlreadyRunning { .. } => "already-running",
            Error::NotRunning { .. } => "not-running",
            Error::PluginBlocked { .. } => "blocked",
            Error::QuotaExceeded { .. } => "quota-exceeded",
            Error::HostLocked => "host-locked",
            Error::Plugin { .. } => "plugin-error",
            Error::ChannelClosed { .. } => "channel-closed",
            Error::RateExceeded { .. } => "rate-exceeded",
            Error::TooLarge { .. } => "too-large",
            Error::SchemaInvalid { .. } => "schema-invalid",
            Error::Crypto { .. } => "crypto-failure",
            Error::PermissionDenied { .. } => "permission-denied",
            Error::Job { .. } => "job-error",
            Error::JobNotFound { .. } => "job-not-found",
            Error::JobTimeout { .. } => "job-timeout",
            Error::QueueNotFound { .. } => "queue-not-found",
            Error::Backpressure { .. } => "backpressure",
            Error::DuplicateJob { .. } => "duplicate-job",
            Error::LeaseNotHeld { .. } => "lease-not-held",
            Error::Stream { .. } => "stream-error",
            Error::Storage { .. } => "storage-error",
            Error::Configuration { .. } => "config-error",
            Error::Serialization { .. } => "serialization-error",
            Error::ShutdownInProgress => "shutdown",
            Error::Internal { .. } => "internal-error",
            Error::Other(_) => "unknown-error",
        }
    }

    /// Plugin id carried by this error, if any
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Error::ManifestInvalid { plugin_id, .. }
            | Error::SignatureInvalid { plugin_id, .. }
            | Error::PluginNotFound { plugin_id }
            | Error::AlreadyLoaded { plugin_id }
            | Error::AlreadyRunning { plugin_id }
            | Error::NotRunning { plugin_id }
            | Error::PluginBlocked { plugin_id, .. }
            | Error::Plugin { plugin_id, .. }
            | Error::ChannelClosed { plugin_id }
            | Error::RateExceeded { plugin_id, .. }
            | Error::Crypto { plugin_id, .. }
            | Error::PermissionDenied { plugin_id, .. } => Some(plugin_id),
            _ => None,
        }
    }
}

/// Result type alias for AutoWeave operations
pub type Result<T> = std::result::Result<T, Error>;
