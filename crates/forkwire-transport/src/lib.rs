//! Byte channels between a test runner and its forked workers.
//!
//! Two transports are supported:
//! - the worker's standard streams (commands on stdin, events on stdout)
//! - a TCP connection to a listener opened by the runner
//!
//! On top of a raw [`ForkStream`] sit [`BufferedChannel`] (writes, with an
//! overflow counter) and [`ReadChannel`] (reads). This is the lowest layer of
//! forkwire; the frame codec builds on these types.

pub mod channel;
pub mod config;
pub mod error;
pub mod stream;
pub mod tcp;

pub use channel::{BufferedChannel, ReadChannel, DEFAULT_BUFFER_CAPACITY};
pub use config::{ChannelConfig, StreamPair, PIPE_STD_IN};
pub use error::{Result, TransportError};
pub use stream::ForkStream;
pub use tcp::TcpForkServer;
