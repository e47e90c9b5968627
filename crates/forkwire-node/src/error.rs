/// Errors that can occur while setting up or driving a fork node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] forkwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] forkwire_frame::FrameError),

    /// A worker connected but presented the wrong session id.
    #[error("session id mismatch from {peer}")]
    SessionMismatch { peer: String },

    /// The worker closed the connection before authenticating.
    #[error("worker disconnected: {0}")]
    Disconnected(String),

    /// The background flusher thread could not be started.
    #[error("failed to start flusher: {0}")]
    Flusher(#[source] std::io::Error),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
