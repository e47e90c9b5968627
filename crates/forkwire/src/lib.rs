//! Event and command channel between a test runner and its forked workers.
//!
//! A controller forks worker processes and talks to each over one byte
//! stream per direction: commands flow to the worker, events (test
//! lifecycle, console output, system properties) flow back. Frames are
//! line-oriented text and survive stray output interleaved on the stream.
//!
//! # Crate Structure
//!
//! - [`transport`]: standard streams and TCP, buffered write channel
//! - [`frame`]: wire grammar, typed messages, streaming decoder, encoders
//! - [`node`]: worker connector, controller listener, periodic flusher
//!   (behind the `node` feature)

/// Re-export transport types.
pub mod transport {
    pub use forkwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use forkwire_frame::*;
}

/// Re-export node types (requires `node` feature).
#[cfg(feature = "node")]
pub mod node {
    pub use forkwire_node::*;
}
