use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::ForkStream;
use crate::tcp;

/// Selection string for the standard-stream transport.
pub const PIPE_STD_IN: &str = "pipe:std:in";

const TCP_SCHEME: &str = "tcp://";
const SESSION_ID_PARAM: &str = "sessionId";

/// Which transport a worker uses to reach its controller.
///
/// Parsed from the selection string handed to the worker:
///
/// - `pipe:std:in` reads commands from stdin and writes events to stdout
/// - `tcp://host:port` (or the older `tcp://ip/port`) with an optional
///   `?sessionId=<id>` query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelConfig {
    Pipe,
    Tcp {
        host: String,
        port: u16,
        session_id: Option<String>,
    },
}

/// The two directions of an opened fork channel.
#[derive(Debug)]
pub struct StreamPair {
    /// Bytes arriving from the peer.
    pub input: ForkStream,
    /// Bytes going to the peer.
    pub output: ForkStream,
}

impl ChannelConfig {
    /// Whether `config` names a transport this crate knows about.
    pub fn can_use(config: &str) -> bool {
        config == PIPE_STD_IN || config.starts_with(TCP_SCHEME)
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ChannelConfig::Tcp { session_id, .. } => session_id.as_deref(),
            ChannelConfig::Pipe => None,
        }
    }

    /// Open the transport. TCP connects once; failures are not retried.
    pub fn connect(&self) -> Result<StreamPair> {
        match self {
            ChannelConfig::Pipe => {
                debug!("using standard streams");
                Ok(StreamPair {
                    input: ForkStream::stdin(),
                    output: ForkStream::stdout(),
                })
            }
            ChannelConfig::Tcp {
                host,
                port,
                session_id,
            } => {
                let input = tcp::connect(host, *port, session_id.as_deref())?;
                let output = input.try_clone()?;
                Ok(StreamPair { input, output })
            }
        }
    }
}

impl FromStr for ChannelConfig {
    type Err = TransportError;

    fn from_str(config: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidConfig {
            config: config.to_string(),
            reason: reason.to_string(),
        };

        if config == PIPE_STD_IN {
            return Ok(ChannelConfig::Pipe);
        }

        let rest = config
            .strip_prefix(TCP_SCHEME)
            .ok_or_else(|| invalid("unknown transport"))?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        // Legacy form separates the port with '/'.
        let (host, port) = authority
            .rsplit_once('/')
            .or_else(|| authority.rsplit_once(':'))
            .ok_or_else(|| invalid("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        let mut session_id = None;
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((SESSION_ID_PARAM, value)) if !value.is_empty() => {
                        session_id = Some(value.to_string());
                    }
                    Some((SESSION_ID_PARAM, _)) => return Err(invalid("empty session id")),
                    _ => debug!(parameter = pair, "ignoring unknown channel parameter"),
                }
            }
        }

        Ok(ChannelConfig::Tcp {
            host: host.to_string(),
            port,
            session_id,
        })
    }
}

impl fmt::Display for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelConfig::Pipe => f.write_str(PIPE_STD_IN),
            ChannelConfig::Tcp {
                host,
                port,
                session_id,
            } => {
                if host.contains(':') {
                    write!(f, "{TCP_SCHEME}[{host}]:{port}")?;
                } else {
                    write!(f, "{TCP_SCHEME}{host}:{port}")?;
                }
                if let Some(id) = session_id {
                    write!(f, "?{SESSION_ID_PARAM}={id}")?;
                }
                Ok(())
            }
        }
    }
}
