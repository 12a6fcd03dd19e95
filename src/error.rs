use crate::classify::{Classification, ErrorCategory};
use crate::recovery::ConsistencyIssue;
use crate::resilience::RetryAttemptRecord;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "pool.max_connections")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "connection_pool", "recovery_manager")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the batch runtime.
///
/// Batch-level failures end up in a batch's result slot; only exhausted or
/// non-retryable errors travel further up to the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource pool exhausted: no resource within {waited_ms}ms")]
    ResourceTimeout { waited_ms: u64 },

    #[error("Resource {resource_id} failed its health check")]
    ResourceUnhealthy { resource_id: u64 },

    #[error(
        "Operation '{operation}' gave up after {attempts} attempt(s) ({}): {last_error}",
        .classification.category
    )]
    RetryExhausted {
        operation: String,
        attempts: u32,
        history: Vec<RetryAttemptRecord>,
        classification: Classification,
        last_error: String,
    },

    #[error("Circuit breaker open for '{operation}' (retry after {retry_after_ms}ms)")]
    CircuitOpen {
        operation: String,
        retry_after_ms: u64,
    },

    #[error("Batch {batch_id} (index {index}) failed: {message}")]
    BatchExecution {
        batch_id: String,
        index: usize,
        message: String,
        category: Option<ErrorCategory>,
    },

    #[error("Timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Consistency violation: {} issue(s) found", .issues.len())]
    ConsistencyViolation { issues: Vec<ConsistencyIssue> },

    #[error("Recovery strategy '{strategy}' failed: {message}")]
    RecoveryFailed { strategy: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        Self::runtime_with_context(msg, ErrorContext::new())
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Typed category for errors raised by the runtime itself.
    ///
    /// Returns `None` for variants that wrap caller failures without a known category.
    pub fn category_hint(&self) -> Option<ErrorCategory> {
        match self {
            Error::ResourceTimeout { .. } | Error::ResourceUnhealthy { .. } => {
                Some(ErrorCategory::Resource)
            }
            Error::RetryExhausted { classification, .. } => Some(classification.category),
            Error::CircuitOpen { .. } => Some(ErrorCategory::CircuitOpen),
            Error::BatchExecution { category, .. } => *category,
            Error::Timeout { .. } => Some(ErrorCategory::Timeout),
            Error::ConsistencyViolation { .. } | Error::Validation { .. } => {
                Some(ErrorCategory::Validation)
            }
            Error::RecoveryFailed { .. } => Some(ErrorCategory::Orchestration),
            Error::Io(_) => Some(ErrorCategory::Network),
            Error::Serialization(_) | Error::Yaml(_) => Some(ErrorCategory::Validation),
            Error::Configuration { .. } => Some(ErrorCategory::Configuration),
            Error::Cancelled | Error::Runtime { .. } => None,
        }
    }

    /// Number of attempts recorded on an exhausted operation, zero otherwise.
    pub fn attempts(&self) -> u32 {
        match self {
            Error::RetryExhausted { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Whether the caller can expect a later attempt to possibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ResourceTimeout { .. } | Error::CircuitOpen { .. } | Error::Timeout { .. }
        )
    }
}
