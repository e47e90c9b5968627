use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// A byte stream between a test runner and one of its forked workers.
///
/// Standard input and standard output are one-directional: a stream built
/// from stdin is readable only, one built from stdout is writable only. A TCP
/// stream is both.
pub struct ForkStream {
    inner: ForkStreamInner,
}

enum ForkStreamInner {
    Stdin(io::Stdin),
    Stdout(io::Stdout),
    Tcp(TcpStream),
}

impl Read for ForkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ForkStreamInner::Stdin(stdin) => stdin.read(buf),
            ForkStreamInner::Stdout(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "standard output is not readable",
            )),
            ForkStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for ForkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            ForkStreamInner::Stdin(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "standard input is not writable",
            )),
            ForkStreamInner::Stdout(stdout) => stdout.write(buf),
            ForkStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            ForkStreamInner::Stdin(_) => Ok(()),
            ForkStreamInner::Stdout(stdout) => stdout.flush(),
            ForkStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl ForkStream {
    /// The process's standard input (commands from the controller).
    pub fn stdin() -> Self {
        Self {
            inner: ForkStreamInner::Stdin(io::stdin()),
        }
    }

    /// The process's standard output (events to the controller).
    pub fn stdout() -> Self {
        Self {
            inner: ForkStreamInner::Stdout(io::stdout()),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: ForkStreamInner::Tcp(stream),
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self.inner, ForkStreamInner::Stdout(_))
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.inner, ForkStreamInner::Stdin(_))
    }

    /// Set read timeout on the underlying stream.
    ///
    /// Standard streams have no timeout support; the call is a no-op there.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            ForkStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            _ => {
                debug!(?timeout, "read timeout ignored on standard stream");
                Ok(())
            }
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            ForkStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            _ => {
                debug!(?timeout, "write timeout ignored on standard stream");
                Ok(())
            }
        }
    }

    /// Try to clone this stream (creates a new file descriptor for TCP).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            ForkStreamInner::Stdin(_) => Ok(Self::stdin()),
            ForkStreamInner::Stdout(_) => Ok(Self::stdout()),
            ForkStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Shut down both halves of a TCP connection. No-op for standard streams.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            ForkStreamInner::Tcp(stream) => match stream.shutdown(Shutdown::Both) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(e) => Err(e.into()),
            },
            _ => Ok(()),
        }
    }

    /// Address of the remote end, for TCP streams.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            ForkStreamInner::Tcp(stream) => stream.peer_addr().ok(),
            _ => None,
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            ForkStreamInner::Stdin(_) => "stdin",
            ForkStreamInner::Stdout(_) => "stdout",
            ForkStreamInner::Tcp(_) => "tcp",
        }
    }
}

impl std::fmt::Debug for ForkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ForkStream");
        s.field("type", &self.transport_name());
        if let Some(peer) = self.peer_addr() {
            s.field("peer", &peer);
        }
        s.finish()
    }
}
