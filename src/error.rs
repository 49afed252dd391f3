use thiserror::Error;

/// Unified error type for the metadata core.
///
/// Mirrors the three error kinds of the index/query protocol: a call that
/// violates the core's own contract, a message that didn't match the
/// server's expected state, and a failure reported by an external
/// collaborator (passthru backend, handle registry).
#[derive(Debug, Error)]
pub enum LowFiveError {
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LowFiveError {
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LowFiveError>;
