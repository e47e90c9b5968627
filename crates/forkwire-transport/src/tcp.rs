use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::ForkStream;

/// TCP listener the test runner opens for its forked workers.
///
/// Binding to port 0 lets the OS pick a free port; [`local_addr`](Self::local_addr)
/// reports the port actually in use so it can be handed to the worker.
#[derive(Debug)]
pub struct TcpForkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpForkServer {
    /// Loopback address with an OS-assigned port.
    pub const DEFAULT_BIND: &'static str = "127.0.0.1:0";

    /// Bind and listen on `address`.
    pub fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).map_err(|e| TransportError::Bind {
            address: address.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            address: address.to_string(),
            source: e,
        })?;

        info!(%local_addr, "listening for fork connections");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming worker connection (blocking).
    pub fn accept(&self) -> Result<ForkStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted fork connection");
        apply_socket_options(&stream);
        Ok(ForkStream::from_tcp(stream))
    }

    /// The address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

/// Connect to a listening fork server (blocking, single attempt).
///
/// When `session_id` is given its bytes are written right after the
/// connection is established so the server can authenticate the worker.
pub fn connect(host: &str, port: u16, session_id: Option<&str>) -> Result<ForkStream> {
    let address = format!("{host}:{port}");
    let connect_err = |source| TransportError::Connect {
        address: address.clone(),
        source,
    };

    let addrs = (host, port).to_socket_addrs().map_err(connect_err)?;
    let mut last_err = None;
    let mut connected = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                connected = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let mut stream = match connected {
        Some(stream) => stream,
        None => {
            return Err(connect_err(last_err.unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "host resolved to no addresses",
                )
            })))
        }
    };

    apply_socket_options(&stream);

    if let Some(id) = session_id {
        stream
            .write_all(id.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(connect_err)?;
    }

    debug!(%address, "connected to fork server");
    Ok(ForkStream::from_tcp(stream))
}

/// Apply `TCP_NODELAY`, `SO_KEEPALIVE` and `SO_REUSEADDR`. Failures are logged
/// and skipped.
pub(crate) fn apply_socket_options(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "TCP_NODELAY not applied");
    }
    set_bool_option(stream, SocketOption::KeepAlive);
    set_bool_option(stream, SocketOption::ReuseAddr);
}

#[derive(Debug, Clone, Copy)]
enum SocketOption {
    KeepAlive,
    ReuseAddr,
}

#[cfg(unix)]
fn set_bool_option(stream: &TcpStream, option: SocketOption) {
    use std::os::fd::AsRawFd;

    let name = match option {
        SocketOption::KeepAlive => libc::SO_KEEPALIVE,
        SocketOption::ReuseAddr => libc::SO_REUSEADDR,
    };
    let enabled: libc::c_int = 1;

    // SAFETY: `enabled` is a valid readable c_int for the provided size, and the
    // descriptor belongs to a connected socket owned by `stream`.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            (&enabled as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        debug!(
            ?option,
            error = %std::io::Error::last_os_error(),
            "socket option not applied"
        );
    }
}

#[cfg(not(unix))]
fn set_bool_option(_stream: &TcpStream, option: SocketOption) {
    debug!(?option, "socket option unsupported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_bind_accept_connect() {
        let server = TcpForkServer::bind(TcpForkServer::DEFAULT_BIND).unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(server.transport_name(), "tcp");

        let handle = std::thread::spawn(move || {
            let mut client = connect("127.0.0.1", port, None).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut accepted = server.accept().unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_connect_writes_session_id_first() {
        let server = TcpForkServer::bind(TcpForkServer::DEFAULT_BIND).unwrap();
        let port = server.local_addr().port();

        let handle = std::thread::spawn(move || {
            let mut client = connect("localhost", port, Some("abc-123")).unwrap();
            client.write_all(b"!").unwrap();
        });

        let mut accepted = server.accept().unwrap();
        let mut buf = [0u8; 8];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc-123!");

        handle.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port, then release it so nothing is listening there.
        let port = {
            let spare = TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let err = connect("127.0.0.1", port, None).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(err.to_string().contains(&port.to_string()));
    }

    #[test]
    fn test_bind_invalid_address() {
        let err = TcpForkServer::bind("not-an-address").unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
