// crates/quorum-core/src/error.rs

use std::fmt;

/// Classified failure kinds for provider calls and the surrounding
/// reliability machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Call exceeded its deadline
    Timeout,

    /// Provider throttled the call
    RateLimited,

    /// Credentials missing, invalid, or rejected
    Unauthorized,

    /// Provider rejected the request payload
    BadRequest,

    /// Provider returned a transient server-side failure
    ProviderUnavailable,

    /// Operation not implemented by this adapter
    NotSupported,

    /// Rejected locally by an open circuit breaker
    CircuitOpen,

    /// Cache read or write failed
    Cache,

    /// Enclosing request was cancelled
    Cancelled,

    /// Anything that does not fit the taxonomy
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying.
    ///
    /// Retryable failures also count toward circuit breaker thresholds;
    /// non-retryable ones do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::ProviderUnavailable
        )
    }

    /// Stable machine-readable code for the user-facing error shape.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cache => "cache_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified provider call failure.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider that produced the failure, when known
    pub provider: Option<String>,
    /// Model id the call targeted, when known
    pub model: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            model: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message)
    }

    pub fn not_supported(operation: &str) -> Self {
        Self::new(ErrorKind::NotSupported, format!("operation not supported: {}", operation))
    }

    pub fn circuit_open(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self {
            kind: ErrorKind::CircuitOpen,
            message: format!("circuit breaker open for {}", provider),
            provider: Some(provider),
            model: None,
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.provider, &self.model) {
            (Some(provider), Some(model)) => {
                write!(f, "[{}] {}/{}: {}", self.kind, provider, model, self.message)
            }
            (Some(provider), None) => write!(f, "[{}] {}: {}", self.kind, provider, self.message),
            _ => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Structured failure shape surfaced across the engine boundary.
///
/// Internal unknowns are wrapped as `internal` and never leak backtraces.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub retryable: bool,
}

impl From<&ProviderError> for UserFacingError {
    fn from(err: &ProviderError) -> Self {
        Self {
            code: err.kind.code().to_string(),
            message: err.message.clone(),
            stage: None,
            model: err.model.clone(),
            retryable: err.is_retryable(),
        }
    }
}

impl UserFacingError {
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// Result alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ProviderUnavailable.is_retryable());

        assert!(!ErrorKind::Unauthorized.is_retryable());
        assert!(!ErrorKind::BadRequest.is_retryable());
        assert!(!ErrorKind::NotSupported.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = ProviderError::timeout("deadline exceeded")
            .with_provider("openai")
            .with_model("gpt-4o");
        let rendered = err.to_string();
        assert!(rendered.contains("timeout"));
        assert!(rendered.contains("openai"));
        assert!(rendered.contains("gpt-4o"));
    }

    #[test]
    fn user_facing_shape() {
        let err = ProviderError::unavailable("upstream 503").with_model("gpt-4o");
        let surfaced = UserFacingError::from(&err).with_stage("initial");
        assert_eq!(surfaced.code, "provider_unavailable");
        assert_eq!(surfaced.stage.as_deref(), Some("initial"));
        assert_eq!(surfaced.model.as_deref(), Some("gpt-4o"));
        assert!(surfaced.retryable);
    }
}
