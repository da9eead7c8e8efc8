use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Circular handoff detected: {}", path.join(" -> "))]
    CircularHandoff { path: Vec<String> },

    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool error: {tool} - {message}")]
    Tool { tool: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Unsupported provider type: {0}")]
    UnsupportedProvider(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn circular_handoff(path: Vec<String>) -> Self {
        Self::CircularHandoff { path }
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::RateLimit(_)
                | Error::Timeout(_)
                | Error::Stream(_)
                | Error::Persistence(_)
        )
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::ProviderNotFound(_) | Error::ModelNotFound(_)
        )
    }

    /// Errors raised while bringing up a provider or resolving a model.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Error::Auth(_)
                | Error::Config(_)
                | Error::ProviderNotFound(_)
                | Error::UnsupportedProvider(_)
                | Error::ModelNotFound(_)
                | Error::Network(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::api(400, "Bad request");
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Bad request"));

        let err = Error::not_found("Agent", "abc");
        assert_eq!(err.to_string(), "Agent not found: abc");
    }

    #[test]
    fn test_circular_handoff_display() {
        let err = Error::circular_handoff(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Circular handoff detected: a -> b -> a");
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::network("timeout").is_retryable());
        assert!(Error::rate_limit("too many requests").is_retryable());
        assert!(Error::persistence("disk full").is_retryable());
        assert!(!Error::auth("invalid key").is_retryable());
        assert!(!Error::validation("bad name").is_retryable());
    }

    #[test]
    fn test_classification() {
        assert!(Error::not_found("Agent", "x").is_not_found());
        assert!(Error::ProviderNotFound("p".into()).is_not_found());
        assert!(Error::auth("missing key").is_provider_failure());
        assert!(!Error::conflict("dup").is_provider_failure());
    }
}
