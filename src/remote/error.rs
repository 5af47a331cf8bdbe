use thiserror::Error;

/// Typed transport errors enabling retry classification.
///
/// Everything that can go wrong between us and the remote server lands here.
/// The sync worker retries these; it never retries local I/O failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Login rejected for user {user}: {message}")]
    Login { user: String, message: String },

    #[error("Listing {path} failed: {message}")]
    List { path: String, message: String },

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("Malformed listing entry {line:?}: {reason}")]
    Parse { line: String, reason: String },

    #[error("Local write for {path} failed: {source}")]
    LocalWrite {
        path: String,
        source: std::io::Error,
    },

    #[error("Transport task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Connection is no longer usable")]
    Closed,
}

impl TransportError {
    /// Whether a fresh connection has a chance of succeeding.
    ///
    /// Login is included: busy public servers answer `421 Too many users`
    /// at login time. Listings we cannot parse and local disk failures will
    /// not change between attempts.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect { .. }
            | TransportError::Login { .. }
            | TransportError::List { .. }
            | TransportError::Transfer { .. }
            | TransportError::Join(_)
            | TransportError::Closed => true,
            TransportError::Parse { .. } | TransportError::LocalWrite { .. } => false,
        }
    }
}
