use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forkwire_frame::{
    CommandEncoder, CommandKind, DumpSink, Event, EventDecoder, EventKind, LogDump, Vocabulary,
};
use forkwire_transport::{BufferedChannel, ChannelConfig, ForkStream, ReadChannel, TcpForkServer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{NodeConfig, DEFAULT_AUTH_TIMEOUT};
use crate::error::{NodeError, Result};

/// Accepts worker connections on a TCP port.
///
/// Every worker must open its connection by sending the listener's session
/// id. [`worker_config`](Self::worker_config) yields the transport string to
/// hand to the forked process.
pub struct ForkListener {
    server: TcpForkServer,
    session_id: String,
    node_config: NodeConfig,
    auth_timeout: Duration,
    dump: Arc<dyn DumpSink>,
    next_worker_id: AtomicU64,
}

impl ForkListener {
    /// Bind to `address` (`host:port`; port 0 picks a free one).
    pub fn bind(address: &str) -> Result<Self> {
        let server = TcpForkServer::bind(address)?;
        Ok(Self {
            server,
            session_id: Uuid::new_v4().to_string(),
            node_config: NodeConfig::default(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            dump: LogDump::shared(),
            next_worker_id: AtomicU64::new(1),
        })
    }

    /// Override the generated session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_node_config(mut self, config: NodeConfig) -> Self {
        self.node_config = config;
        self
    }

    /// How long a worker has to present its session id.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_dump(mut self, dump: Arc<dyn DumpSink>) -> Self {
        self.dump = dump;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Transport configuration a worker uses to reach this listener.
    pub fn worker_config(&self) -> ChannelConfig {
        let addr = self.local_addr();
        let ip = match addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        ChannelConfig::Tcp {
            host: ip.to_string(),
            port: addr.port(),
            session_id: Some(self.session_id.clone()),
        }
    }

    /// Accept the next worker and assign an auto-generated id.
    pub fn accept(&self) -> Result<ControllerChannel> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.accept_with_id(&format!("worker-{id}"))
    }

    /// Accept the next worker under an explicit id.
    pub fn accept_with_id(&self, worker_id: &str) -> Result<ControllerChannel> {
        let mut stream = self.server.accept()?;
        let peer = stream.peer_addr();

        if let Err(err) = self.authenticate(&mut stream, peer) {
            if let Err(shutdown_err) = stream.shutdown() {
                debug!(error = %shutdown_err, "shutdown after failed authentication");
            }
            return Err(err);
        }

        let frame = &self.node_config.frame;
        stream.set_read_timeout(frame.read_timeout)?;
        stream.set_write_timeout(frame.write_timeout)?;
        let output = stream.try_clone()?;
        debug!(worker = worker_id, ?peer, "worker connected");

        let events = EventDecoder::with_config(
            ReadChannel::from_stream(stream),
            Vocabulary::<EventKind>::shared(),
            Arc::clone(&self.dump),
            self.node_config.variant,
            frame,
        );
        let commands = CommandEncoder::new(
            Arc::new(BufferedChannel::from_stream(
                output,
                self.node_config.buffer_capacity,
            )),
            Vocabulary::<CommandKind>::shared(),
            self.node_config.variant,
            Arc::clone(&self.dump),
        );

        Ok(ControllerChannel {
            id: worker_id.to_string(),
            peer,
            events,
            commands,
        })
    }

    fn authenticate(&self, stream: &mut ForkStream, peer: Option<SocketAddr>) -> Result<()> {
        let peer_name = peer.map_or_else(|| "unknown peer".to_string(), |addr| addr.to_string());
        stream.set_read_timeout(Some(self.auth_timeout))?;

        let mut presented = vec![0u8; self.session_id.len()];
        match stream.read_exact(&mut presented) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(NodeError::Disconnected(format!(
                    "{peer_name} closed before sending its session id"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        if presented != self.session_id.as_bytes() {
            warn!(peer = %peer_name, "rejecting worker with unknown session id");
            return Err(NodeError::SessionMismatch { peer: peer_name });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ForkListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkListener")
            .field("local_addr", &self.local_addr())
            .field("node_config", &self.node_config)
            .finish_non_exhaustive()
    }
}

/// Controller end of a fork channel: events in, commands out.
pub struct ControllerChannel {
    id: String,
    peer: Option<SocketAddr>,
    events: EventDecoder<ReadChannel<ForkStream>>,
    commands: CommandEncoder<ForkStream>,
}

impl ControllerChannel {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Block until the next event arrives.
    pub fn next_event(&mut self) -> Result<Event> {
        Ok(self.events.decode()?)
    }

    pub fn commands(&self) -> &CommandEncoder<ForkStream> {
        &self.commands
    }

    pub fn events_mut(&mut self) -> &mut EventDecoder<ReadChannel<ForkStream>> {
        &mut self.events
    }

    pub fn into_parts(
        self,
    ) -> (
        EventDecoder<ReadChannel<ForkStream>>,
        CommandEncoder<ForkStream>,
    ) {
        (self.events, self.commands)
    }

    /// Close both directions and shut the socket down.
    pub fn close(mut self) -> Result<()> {
        let result = self.commands.channel().close();
        self.events.get_mut().close();
        self.events.get_ref().get_ref().shutdown()?;
        debug!(worker = %self.id, "controller channel closed");
        Ok(result?)
    }
}

impl std::fmt::Debug for ControllerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerChannel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
