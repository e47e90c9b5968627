use std::fmt;
use std::io;

use forkwire_frame::FrameError;
use forkwire_node::NodeError;
use forkwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::InvalidConfig { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::Accept(source) | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::EndOfStream => CliError::new(FAILURE, format!("{context}: {err}")),
        FrameError::UnknownVariant(_) => CliError::new(USAGE, format!("{context}: {err}")),
        FrameError::Layout { .. } | FrameError::Encoding(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
    }
}

pub fn node_error(context: &str, err: NodeError) -> CliError {
    match err {
        NodeError::Transport(err) => transport_error(context, err),
        NodeError::Frame(err) => frame_error(context, err),
        NodeError::Io(err) => io_error(context, err),
        NodeError::SessionMismatch { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        NodeError::Disconnected(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_channel_config_is_usage_error() {
        let err = transport_error(
            "connect failed",
            TransportError::InvalidConfig {
                config: "udp://x".to_string(),
                reason: "unknown transport".to_string(),
            },
        );
        assert_eq!(err.code, USAGE);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn connect_refused_is_transport_error() {
        let err = node_error(
            "connect failed",
            NodeError::Transport(TransportError::Connect {
                address: "127.0.0.1:1".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }),
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn read_timeout_maps_to_124() {
        let err = frame_error(
            "decode failed",
            FrameError::Io(io::Error::from(io::ErrorKind::WouldBlock)),
        );
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn session_mismatch_is_data_invalid() {
        let err = node_error(
            "accept failed",
            NodeError::SessionMismatch {
                peer: "127.0.0.1:4000".to_string(),
            },
        );
        assert_eq!(err.code, DATA_INVALID);
    }
}
