//! Connection engine.
//!
//! Everything between a caller's request and the socket lives here: the physical
//! [`Connection`] and its receive loop, the [`OperationTable`](operation) that correlates
//! replies, the heartbeat monitor, endpoint discovery and the [`ConnectionManager`] that
//! ties them together.
//!
//! # Overview
//!
//! A single manager thread owns all mutable state. Callers hand it work over a channel,
//! receive threads hand it inbound frames over another, and a timer drives deadlines and
//! heartbeats. A physical connection is never reused: every reconnect mints a new
//! [`ConnectionId`], and events from an older connection are discarded.
//!
//! # Key Components
//!
//! - [`Connection`]: one TCP socket plus the thread reading it.
//! - [`ConnectionManager`]: the lifecycle state machine.
//! - [`EndpointDiscoverer`]: where to connect, and where to go after a redirect.
//! - [`HeartbeatMonitor`]: liveness of a quiet connection.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): Frames and payloads sent over the connection.
//! - [`subscription`](crate::subscription): Controllers attached to each connection.
mod discovery;
mod heartbeat;
mod manager;
mod operation;

use std::{
    fmt,
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::Sender;
use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{ClientError, ClientResult},
    protocol::{Frame, ProtocolTransport, TcpCommand, TransportError},
};

pub use discovery::{
    DiscoveryError, Endpoint, EndpointDiscoverer, SeedListDiscoverer, StaticEndpointDiscoverer,
};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use manager::{ClientEvent, ConnectionManager, ConnectionState};
pub use operation::{OperationId, PendingReply, Reply, ReplyDecision, ReplyInspector};

pub(crate) use manager::Message;

/// Identity of one physical connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// What connect and receive threads report to the manager.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Established {
        attempt: u64,
        endpoint: Endpoint,
        result: ClientResult<Connection>,
    },
    Frame {
        connection_id: ConnectionId,
        frame: Frame,
    },
    Closed {
        connection_id: ConnectionId,
        error: ClientError,
    },
}

/// A single TCP connection to one node.
pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    writer: Arc<Mutex<ProtocolTransport<TcpStream>>>,
    socket: TcpStream,
    closed: Arc<AtomicBool>,
    tls_enabled: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("tls_enabled", &self.tls_enabled)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Tries every resolved address of `endpoint` in turn, each bounded by
    /// `connect_timeout`. Every write on the connection is bounded by `write_timeout`.
    pub fn connect(
        endpoint: Endpoint,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> ClientResult<Self> {
        let mut last_error = None;
        for addr in endpoint.resolve()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .and_then(|()| stream.set_write_timeout(Some(write_timeout)))
                        .map_err(|e| ClientError::Transport(e.to_string()))?;
                    let socket = stream
                        .try_clone()
                        .map_err(|e| ClientError::Transport(e.to_string()))?;
                    let id = ConnectionId::new();
                    info!("connection {id} established to {endpoint} ({addr})");
                    return Ok(Self {
                        id,
                        endpoint,
                        writer: Arc::new(Mutex::new(ProtocolTransport::new(stream))),
                        socket,
                        closed: Arc::new(AtomicBool::new(false)),
                        tls_enabled: false,
                    });
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(ClientError::Transport(format!("connect to {endpoint} failed: {reason}")))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Always `false`: connections are plain TCP.
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawns the receive loop. Every frame is forwarded to `sink` in arrival order;
    /// heartbeat requests are answered before being forwarded.
    pub(crate) fn start_receiving(&self, sink: Sender<InboundEvent>) -> ClientResult<()> {
        let stream = self
            .socket
            .try_clone()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let connection_id = self.id;
        let writer = Arc::clone(&self.writer);
        let closed = Arc::clone(&self.closed);

        thread::Builder::new()
            .name(format!("eventlink-recv-{connection_id}"))
            .spawn(move || {
                let error = receive_loop(connection_id, stream, &writer, &sink);
                if !closed.swap(true, Ordering::AcqRel) {
                    warn!("connection {connection_id} failed: {error}");
                }
                let _ = sink.send(InboundEvent::Closed {
                    connection_id,
                    error,
                });
            })
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(())
    }

    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        trace!(
            "connection {} sending {:?} ({})",
            self.id,
            frame.tcp_command(),
            frame.correlation_id
        );
        let mut writer = self.writer.lock().map_err(|_| TransportError::Closed)?;
        writer.write_frame(frame)
    }

    /// Idempotent. The receive loop notices the shutdown and exits.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing connection {} to {}", self.id, self.endpoint);
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    connection_id: ConnectionId,
    stream: TcpStream,
    writer: &Mutex<ProtocolTransport<TcpStream>>,
    sink: &Sender<InboundEvent>,
) -> ClientError {
    let mut transport = ProtocolTransport::new(stream);
    loop {
        let frame = match transport.read_frame() {
            Ok(frame) => frame,
            Err(e) => return e.into(),
        };

        let Some(command) = frame.tcp_command() else {
            let error = ClientError::UnexpectedCommand {
                expected: None,
                actual: frame.command,
            };
            warn!("connection {connection_id}: {error}, dropping frame");
            continue;
        };

        if command == TcpCommand::HeartbeatRequest {
            let response = Frame::empty(TcpCommand::HeartbeatResponse, frame.correlation_id);
            let written = match writer.lock() {
                Ok(mut writer) => writer.write_frame(&response),
                Err(_) => Err(TransportError::Closed),
            };
            if let Err(e) = written {
                return e.into();
            }
        }

        let event = InboundEvent::Frame {
            connection_id,
            frame,
        };
        if sink.send(event).is_err() {
            return ClientError::ConnectionClosed;
        }
    }
}
