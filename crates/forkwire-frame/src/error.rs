use forkwire_transport::TransportError;

/// Errors that can occur while encoding or decoding frames.
///
/// Malformed input never shows up here: the decoder reports it to the dump
/// sink and resynchronizes on its own.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The input ended before a complete frame was read.
    #[error("end of stream")]
    EndOfStream,

    /// A frame's fields do not match the layout of its opcode.
    #[error("layout mismatch for '{opcode}': {reason}")]
    Layout {
        opcode: &'static str,
        reason: String,
    },

    /// A field could not be encoded.
    #[error("field encoding failed: {0}")]
    Encoding(String),

    /// Unknown protocol variant name.
    #[error("unknown protocol variant '{0}' (expected 'binary' or 'legacy')")]
    UnknownVariant(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying channel failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a decoded frame could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed frame: {reason}")]
pub struct MalformedFrame {
    reason: String,
}

impl MalformedFrame {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
