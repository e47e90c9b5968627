//! Worker and controller endpoints for forkwire channels.
//!
//! A forked worker calls [`connect`] with the transport string it was
//! given and gets a [`WorkerChannel`]: a command decoder, an event encoder
//! and the background flusher that keeps buffered output moving. The
//! controller binds a [`ForkListener`], hands
//! [`ForkListener::worker_config`] to the worker, and accepts a
//! [`ControllerChannel`] once the worker has proven its session id.

pub mod config;
pub mod connector;
pub mod dump;
pub mod error;
pub mod flusher;
pub mod listener;

pub use config::{NodeConfig, DEFAULT_AUTH_TIMEOUT, DEFAULT_FLUSH_PERIOD};
pub use connector::{connect, connect_with_config, WorkerChannel};
pub use dump::FileDump;
pub use error::{NodeError, Result};
pub use flusher::PeriodicFlusher;
pub use listener::{ControllerChannel, ForkListener};
