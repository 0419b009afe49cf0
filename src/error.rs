use std::fmt;

#[derive(Debug)]
pub enum LbError {
    /// Cluster id in the configuration that the authorisation source does
    /// not know about. Startup-only.
    UnknownClusterId(String),
    NoBackend(String),
    RetryExhausted,
    Upstream(String),
    Verification(String),
    Db(rusqlite::Error),
    Config(String),
    Internal(String),
}

impl fmt::Display for LbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LbError::UnknownClusterId(id) => write!(f, "unknown cluster id: {}", id),
            LbError::NoBackend(id) => write!(f, "no live backend for cluster: {}", id),
            LbError::RetryExhausted => write!(f, "retry exhausted"),
            LbError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            LbError::Verification(msg) => write!(f, "verification error: {}", msg),
            LbError::Db(e) => write!(f, "db error: {}", e),
            LbError::Config(msg) => write!(f, "config error: {}", msg),
            LbError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for LbError {}

impl From<rusqlite::Error> for LbError {
    fn from(e: rusqlite::Error) -> Self {
        LbError::Db(e)
    }
}
