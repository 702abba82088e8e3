use livecell_wire::ProtocolError;

/// Failures surfaced by the cell/session machinery.
///
/// Payloads are plain strings so that one in-flight session acquisition can
/// hand the same error to every caller awaiting it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("could not connect to kernel: {0}")]
    Connection(String),

    #[error("environment build failed: {0}")]
    Build(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("completion failed: {0}")]
    Completion(String),

    #[error("inspection failed: {0}")]
    Inspection(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("kernel connection closed")]
    Disconnected,

    #[error("kernel restarted")]
    Restarted,

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("kernel binding already resolved")]
    AlreadyBound,
}

pub type Result<T> = std::result::Result<T, Error>;
