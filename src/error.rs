use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "generator.base_url", "request.fields.prompt")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "key_builder", "sqlite_store")
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

/// Unified error type for the generation layer.
///
/// Every failure surfaces to the immediate caller; the caching layer never
/// retries and never swallows an error except an isolated undecodable cache
/// entry, which is downgraded to a miss.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Key encoding error: {message}{}", format_context(.context))]
    KeyEncoding {
        message: String,
        context: ErrorContext,
    },

    #[error("Method '{method}' expects {expected} input field(s), got {actual}")]
    MethodMismatch {
        method: String,
        expected: String,
        actual: usize,
    },

    #[error("Backend '{backend}' failed: {message}")]
    Backend {
        backend: String,
        message: String,
        retryable: bool,
    },

    #[error("Cache store error: {message}{}", format_context(.context))]
    Store {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
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

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::store_with_context(e.to_string(), ErrorContext::new().with_source("sqlite"))
    }
}

impl Error {
    /// Create a new key encoding error with structured context
    pub fn key_encoding_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::KeyEncoding {
            message: msg.into(),
            context,
        }
    }

    /// Create a new store error with structured context
    pub fn store_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Store {
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

    /// Create a non-retryable backend error
    pub fn backend(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a backend error that an outer caller may retry
    pub fn backend_retryable(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Whether an outer caller could reasonably retry the failed call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Backend { retryable, .. } => *retryable,
            Error::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::KeyEncoding { context, .. }
            | Error::Store { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}
