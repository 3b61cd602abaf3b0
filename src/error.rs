use std::fmt;

#[derive(Debug)]
pub enum CrawlError {
    Store(String),
    Coordination(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Io(std::io::Error),
    Config(String),
    Other(String),
}

impl CrawlError {
    /// Transient collaborator failures. The caller owns the retry policy;
    /// everything else is a bug or a misconfiguration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrawlError::Store(_) | CrawlError::Coordination(_))
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        CrawlError::Other(format!("{} lock poisoned", what))
    }
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::Store(e) => write!(f, "Shared store error: {}", e),
            CrawlError::Coordination(e) => write!(f, "Coordination error: {}", e),
            CrawlError::Serialization(e) => write!(f, "Serialization error: {}", e),
            CrawlError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            CrawlError::Json(e) => write!(f, "Status encoding error: {}", e),
            CrawlError::Io(e) => write!(f, "IO error: {}", e),
            CrawlError::Config(e) => write!(f, "Invalid configuration: {}", e),
            CrawlError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for CrawlError {}

impl From<Box<bincode::error::EncodeError>> for CrawlError {
    fn from(err: Box<bincode::error::EncodeError>) -> Self {
        CrawlError::Serialization(err)
    }
}

impl From<bincode::error::EncodeError> for CrawlError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CrawlError::Serialization(Box::new(err))
    }
}

impl From<Box<bincode::error::DecodeError>> for CrawlError {
    fn from(err: Box<bincode::error::DecodeError>) -> Self {
        CrawlError::Deserialization(err)
    }
}

impl From<bincode::error::DecodeError> for CrawlError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CrawlError::Deserialization(Box::new(err))
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::Json(err)
    }
}

impl From<std::io::Error> for CrawlError {
    fn from(err: std::io::Error) -> Self {
        CrawlError::Io(err)
    }
}

#[cfg(feature = "distributed")]
impl From<redis::RedisError> for CrawlError {
    fn from(err: redis::RedisError) -> Self {
        CrawlError::Store(err.to_string())
    }
}

impl From<String> for CrawlError {
    fn from(err: String) -> Self {
        CrawlError::Other(err)
    }
}

impl From<&str> for CrawlError {
    fn from(err: &str) -> Self {
        CrawlError::Other(err.to_string())
    }
}
