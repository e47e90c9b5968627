use std::io;

/// Errors that can occur in fork channel transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport selection string could not be understood.
    #[error("invalid channel configuration '{config}': {reason}")]
    InvalidConfig { config: String, reason: String },

    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        source: io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The channel has been closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// The underlying transport cannot be written to (e.g. standard input).
    #[error("channel is not writable")]
    NotWritable,

    /// The underlying transport cannot be read from (e.g. standard output).
    #[error("channel is not readable")]
    NotReadable,
}

impl TransportError {
    /// Whether this error means the channel was closed locally.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::ChannelClosed)
    }

    /// Recover a `TransportError` that was wrapped into an `io::Error` by a
    /// channel's `Read` implementation.
    pub fn from_io(err: &io::Error) -> Option<&TransportError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<TransportError>())
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Io(source) | TransportError::Accept(source) => source.kind(),
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
                source.kind()
            }
            TransportError::InvalidConfig { .. } => io::ErrorKind::InvalidInput,
            TransportError::ChannelClosed => io::ErrorKind::NotConnected,
            TransportError::NotWritable | TransportError::NotReadable => {
                io::ErrorKind::Unsupported
            }
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
