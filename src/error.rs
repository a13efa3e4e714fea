use thiserror::Error;

/// Errors surfaced by the discovery engine.
///
/// Per-host timeouts and refused connections are not errors; they are the
/// normal "closed" signal and never reach this type.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No usable interface, invalid CIDR or invalid option values. Raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Duplicate session id, or a second run on a scanner instance.
    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("discovery session {0} not found")]
    SessionNotFound(String),

    /// Socket bind/send failure that aborts a whole ONVIF window.
    #[error("socket error: {context}: {source}")]
    Socket {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Malformed WS-Discovery payload. Isolated per message.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DiscoveryError {
    pub(crate) fn socket(context: &'static str, source: std::io::Error) -> Self {
        Self::Socket { context, source }
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
