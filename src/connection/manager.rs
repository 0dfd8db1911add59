//! Connection lifecycle.
//!
//! [`ConnectionManager`] is the caller-facing handle; the state machine itself runs on a
//! dedicated driver thread that owns the current [`Connection`], the operation table and
//! the subscription registry. Callers never touch that state directly: they enqueue
//! [`Message`]s and wait on the reply channel of their operation.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!                                   \______________/
//!                                          |
//!                                        Closed
//! ```
//!
//! A connection only counts as `Connected` after the handshake: authentication when
//! default credentials are configured, then client identification.
use std::{
    fmt, mem,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{ClientError, ClientResult},
    protocol::{
        Credentials, Frame, TcpCommand, TransportError, decode_payload, encode_payload,
        messages::{IdentifyClient, NakAction, NotHandled, NotHandledReason},
    },
    settings::ConnectionSettings,
    subscription::{SubscriptionController, SubscriptionDropReason, SubscriptionId, SubscriptionRegistry},
};

use super::{
    Connection, ConnectionId, Endpoint, EndpointDiscoverer, HeartbeatAction, HeartbeatMonitor,
    InboundEvent,
    operation::{
        Operation, OperationId, OperationTable, PendingReply, QueueSlots, Reply, ReplyDecision,
        ReplyInspector,
    },
};

const CLIENT_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle notifications published to every listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected(Endpoint),
    Disconnected(Endpoint),
    Reconnecting { attempt: u32 },
    AuthenticationFailed(String),
    ErrorOccurred(String),
    Closed(String),
}

/// Work handed to the driver thread.
pub(crate) enum Message {
    Connect,
    Submit(Operation),
    Cancel(OperationId),
    Subscribe(SubscriptionController),
    Unsubscribe {
        id: SubscriptionId,
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
    Ack {
        id: SubscriptionId,
        event_ids: Vec<Uuid>,
    },
    Nak {
        id: SubscriptionId,
        event_ids: Vec<Uuid>,
        action: NakAction,
        message: Option<String>,
    },
    Close(String),
}

type Listeners = Arc<Mutex<Vec<Sender<ClientEvent>>>>;

/// Handle to the driver thread. Dropping it closes the connection.
pub struct ConnectionManager {
    settings: Arc<ConnectionSettings>,
    control: Sender<Message>,
    state: Arc<Mutex<ConnectionState>>,
    listeners: Listeners,
    slots: QueueSlots,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn start(
        settings: ConnectionSettings,
        discoverer: Box<dyn EndpointDiscoverer>,
    ) -> ClientResult<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let (control, control_rx) = unbounded();
        let (inbound, inbound_rx) = unbounded();
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));

        let connection_name = settings
            .connection_name
            .clone()
            .unwrap_or_else(|| format!("eventlink-{}", Uuid::new_v4().simple()));
        let driver = Driver {
            settings: Arc::clone(&settings),
            discoverer,
            state: Arc::clone(&state),
            listeners: Arc::clone(&listeners),
            inbound,
            connection_name,
            phase: Phase::Idle,
            operations: OperationTable::new(),
            subscriptions: SubscriptionRegistry::new(),
            attempts: 0,
            connect_seq: 0,
            failed: None,
        };
        let handle = thread::Builder::new()
            .name("eventlink-manager".to_string())
            .spawn(move || driver.run(control_rx, inbound_rx))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            slots: QueueSlots::new(settings.max_queue_size),
            settings,
            control,
            state,
            listeners,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Registers a listener. Events published before the call are not replayed.
    pub fn events(&self) -> Receiver<ClientEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(tx);
        }
        rx
    }

    /// Starts connecting. Returns immediately; operations submitted meanwhile wait for
    /// the connection.
    pub fn connect(&self) -> ClientResult<()> {
        self.send(Message::Connect)
    }

    pub fn submit(
        &self,
        command: TcpCommand,
        payload: Bytes,
        credentials: Option<Credentials>,
        timeout: Duration,
        max_retries: u32,
        inspector: Option<ReplyInspector>,
    ) -> ClientResult<PendingReply> {
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::ConnectionClosed);
        }
        let slot = self.slots.try_acquire()?;
        let (operation, result) =
            Operation::new(command, payload, credentials, timeout, max_retries, slot);
        let operation = operation.with_inspector(inspector);
        let id = operation.id;
        self.send(Message::Submit(operation))?;
        Ok(PendingReply::new(id, command, result, self.control()))
    }

    /// Fails pending operations with [`ClientError::ConnectionClosed`], drops every
    /// subscription and waits for the driver thread to exit.
    pub fn close(&self) {
        let _ = self.control.send(Message::Close("closed by caller".to_string()));
        let handle = self.driver.lock().ok().and_then(|mut driver| driver.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("connection manager thread panicked");
            }
        }
    }

    /// Operations waiting for a reply or for a connection.
    pub fn queued(&self) -> usize {
        self.slots.in_use()
    }

    pub(crate) fn send(&self, message: Message) -> ClientResult<()> {
        self.control
            .send(message)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub(crate) fn control(&self) -> Sender<Message> {
        self.control.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.control.send(Message::Close("client dropped".to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    Authenticating,
    Identifying,
}

impl HandshakeStep {
    fn command(self) -> TcpCommand {
        match self {
            HandshakeStep::Authenticating => TcpCommand::Authenticate,
            HandshakeStep::Identifying => TcpCommand::IdentifyClient,
        }
    }
}

struct Handshake {
    step: HandshakeStep,
    correlation_id: Uuid,
    deadline: Instant,
}

struct Active {
    connection: Connection,
    heartbeat: HeartbeatMonitor,
    /// `None` once the connection is ready for operations.
    handshake: Option<Handshake>,
}

enum Phase {
    Idle,
    Connecting { attempt: u64 },
    Active(Active),
    Waiting { until: Instant },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconnect {
    Backoff,
    Immediate,
}

enum TickAction {
    Nothing,
    Connect,
    SendHeartbeat,
    Lost(ClientError),
}

struct Driver {
    settings: Arc<ConnectionSettings>,
    discoverer: Box<dyn EndpointDiscoverer>,
    state: Arc<Mutex<ConnectionState>>,
    listeners: Listeners,
    inbound: Sender<InboundEvent>,
    connection_name: String,
    phase: Phase,
    operations: OperationTable,
    subscriptions: SubscriptionRegistry,
    /// Reconnect attempts since the last successful handshake.
    attempts: u32,
    connect_seq: u64,
    failed: Option<Endpoint>,
}

impl Driver {
    fn run(mut self, control: Receiver<Message>, inbound: Receiver<InboundEvent>) {
        let ticker = crossbeam::channel::tick(self.settings.tick_period());
        debug!("connection manager started as '{}'", self.connection_name);

        loop {
            crossbeam::select! {
                recv(control) -> msg => {
                    match msg {
                        Ok(msg) => self.on_message(msg),
                        Err(_) => self.shutdown(
                            ClientError::ConnectionClosed,
                            SubscriptionDropReason::ConnectionClosed,
                            "all handles dropped",
                        ),
                    }
                }
                recv(inbound) -> event => {
                    if let Ok(event) = event {
                        self.on_inbound(event);
                    }
                }
                recv(ticker) -> _ => self.on_tick(Instant::now()),
            }

            if matches!(self.phase, Phase::Closed) {
                break;
            }
        }
        debug!("connection manager '{}' stopped", self.connection_name);
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Connect => {
                if matches!(self.phase, Phase::Idle) {
                    self.set_state(ConnectionState::Connecting);
                    self.start_connect();
                } else {
                    debug!("already connecting, ignoring connect");
                }
            }
            Message::Submit(operation) => self.start_operation(operation),
            Message::Cancel(id) => {
                if self.operations.cancel(id) {
                    debug!("operation {id:?} cancelled");
                }
            }
            Message::Subscribe(controller) => {
                let id = controller.id();
                self.subscriptions.insert(controller);
                if self.is_ready() {
                    if let Some(frame) = self.subscriptions.attach(id) {
                        self.send_frame(frame);
                    }
                }
            }
            Message::Unsubscribe { id, reason, error } => {
                if let Some(frame) = self.subscriptions.remove(id, reason, error) {
                    self.send_frame(frame);
                }
            }
            Message::Ack { id, event_ids } => {
                if let Some(frame) = self.subscriptions.ack(id, &event_ids) {
                    self.send_frame(frame);
                }
            }
            Message::Nak {
                id,
                event_ids,
                action,
                message,
            } => {
                if let Some(frame) = self.subscriptions.nak(id, &event_ids, action, message) {
                    self.send_frame(frame);
                }
            }
            Message::Close(reason) => self.shutdown(
                ClientError::ConnectionClosed,
                SubscriptionDropReason::Unsubscribed,
                &reason,
            ),
        }
    }

    fn on_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Established {
                attempt,
                endpoint,
                result,
            } => self.on_established(attempt, endpoint, result),
            InboundEvent::Frame {
                connection_id,
                frame,
            } => {
                if self.is_current(connection_id) {
                    self.on_frame(frame);
                } else {
                    trace!("dropping frame from stale connection {connection_id}");
                }
            }
            InboundEvent::Closed {
                connection_id,
                error,
            } => {
                if self.is_current(connection_id) {
                    self.connection_lost(error, Reconnect::Backoff);
                }
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let expired = self.operations.expire(now);
        if expired > 0 {
            debug!("{expired} operations timed out");
        }

        let operation_timeout = self.settings.operation_timeout;
        let action = match &mut self.phase {
            Phase::Waiting { until } if now >= *until => TickAction::Connect,
            Phase::Active(active) => match &active.handshake {
                Some(handshake) if now >= handshake.deadline => {
                    TickAction::Lost(ClientError::OperationTimedOut {
                        command: handshake.step.command(),
                        timeout: operation_timeout,
                    })
                }
                _ => match active.heartbeat.tick(now) {
                    HeartbeatAction::Idle => TickAction::Nothing,
                    HeartbeatAction::SendRequest => TickAction::SendHeartbeat,
                    HeartbeatAction::TimedOut => {
                        TickAction::Lost(ClientError::HeartbeatTimedOut(active.heartbeat.timeout()))
                    }
                },
            },
            _ => TickAction::Nothing,
        };

        match action {
            TickAction::Nothing => {}
            TickAction::Connect => self.start_connect(),
            TickAction::SendHeartbeat => {
                trace!("connection quiet, sending heartbeat request");
                self.send_frame(Frame::empty(TcpCommand::HeartbeatRequest, Uuid::new_v4()));
            }
            TickAction::Lost(error) => self.connection_lost(error, Reconnect::Backoff),
        }
    }

    fn start_connect(&mut self) {
        let endpoint = match self.discoverer.resolve(self.failed.as_ref()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("endpoint discovery failed: {e}");
                self.emit(ClientEvent::ErrorOccurred(e.to_string()));
                self.phase = Phase::Idle;
                self.schedule_reconnect(None);
                return;
            }
        };

        self.connect_seq += 1;
        let attempt = self.connect_seq;
        let sink = self.inbound.clone();
        let connect_timeout = self.settings.connect_timeout;
        let write_timeout = self.settings.write_timeout;
        let target = endpoint.clone();
        debug!("connecting to {endpoint} (attempt {attempt})");

        let spawned = thread::Builder::new()
            .name("eventlink-connect".to_string())
            .spawn(move || {
                let result = Connection::connect(target.clone(), connect_timeout, write_timeout);
                let _ = sink.send(InboundEvent::Established {
                    attempt,
                    endpoint: target,
                    result,
                });
            });

        match spawned {
            Ok(_) => self.phase = Phase::Connecting { attempt },
            Err(e) => {
                error!("could not spawn connect thread: {e}");
                self.failed = Some(endpoint);
                self.phase = Phase::Idle;
                self.schedule_reconnect(None);
            }
        }
    }

    fn on_established(
        &mut self,
        attempt: u64,
        endpoint: Endpoint,
        result: ClientResult<Connection>,
    ) {
        let expected = matches!(self.phase, Phase::Connecting { attempt: current } if current == attempt);
        if !expected {
            if let Ok(connection) = result {
                debug!("discarding late connection {}", connection.id());
                connection.close();
            }
            return;
        }

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                warn!("connect to {endpoint} failed: {e}");
                self.emit(ClientEvent::ErrorOccurred(e.to_string()));
                self.failed = Some(endpoint);
                self.phase = Phase::Idle;
                self.schedule_reconnect(None);
                return;
            }
        };

        if let Err(e) = connection.start_receiving(self.inbound.clone()) {
            warn!("could not start receiving on {endpoint}: {e}");
            connection.close();
            self.failed = Some(endpoint);
            self.phase = Phase::Idle;
            self.schedule_reconnect(None);
            return;
        }

        let now = Instant::now();
        self.phase = Phase::Active(Active {
            connection,
            heartbeat: HeartbeatMonitor::new(
                self.settings.heartbeat_interval,
                self.settings.heartbeat_timeout,
                now,
            ),
            handshake: None,
        });

        let first = match self.settings.default_credentials {
            Some(_) => HandshakeStep::Authenticating,
            None => HandshakeStep::Identifying,
        };
        self.send_handshake(first, now);
    }

    fn send_handshake(&mut self, step: HandshakeStep, now: Instant) {
        let correlation_id = Uuid::new_v4();
        let frame = match step {
            HandshakeStep::Authenticating => Frame::empty(TcpCommand::Authenticate, correlation_id)
                .with_credentials(self.settings.default_credentials.clone()),
            HandshakeStep::Identifying => {
                let identify = IdentifyClient {
                    version: CLIENT_VERSION,
                    connection_name: Some(self.connection_name.clone()),
                };
                match encode_payload(&identify) {
                    Ok(payload) => Frame::new(TcpCommand::IdentifyClient, correlation_id, payload),
                    Err(e) => {
                        self.connection_lost(e.into(), Reconnect::Backoff);
                        return;
                    }
                }
            }
        };

        let Phase::Active(active) = &mut self.phase else {
            return;
        };
        active.handshake = Some(Handshake {
            step,
            correlation_id,
            deadline: now + self.settings.operation_timeout,
        });
        debug!("connection {}: {:?}", active.connection.id(), step);
        if let Err(e) = active.connection.send(&frame) {
            self.connection_lost(e.into(), Reconnect::Backoff);
        }
    }

    fn on_handshake_reply(&mut self, step: HandshakeStep, command: TcpCommand, frame: Frame) {
        let now = Instant::now();
        match (step, command) {
            (HandshakeStep::Authenticating, TcpCommand::Authenticated) => {
                debug!("authenticated");
                self.send_handshake(HandshakeStep::Identifying, now);
            }
            (HandshakeStep::Authenticating, TcpCommand::NotAuthenticated) => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                warn!("authentication failed: {reason}");
                self.emit(ClientEvent::AuthenticationFailed(reason));
                self.send_handshake(HandshakeStep::Identifying, now);
            }
            (HandshakeStep::Identifying, TcpCommand::ClientIdentified) => self.on_ready(),
            (step, other) => {
                let error = ClientError::UnexpectedCommand {
                    expected: step.command().expected_reply(),
                    actual: other.code(),
                };
                self.connection_lost(error, Reconnect::Backoff);
            }
        }
    }

    fn on_ready(&mut self) {
        let Phase::Active(active) = &mut self.phase else {
            return;
        };
        active.handshake = None;
        let endpoint = active.connection.endpoint().clone();
        info!(
            "connection {} to {endpoint} ready",
            active.connection.id()
        );

        self.attempts = 0;
        self.failed = None;
        self.set_state(ConnectionState::Connected);
        self.emit(ClientEvent::Connected(endpoint));

        for frame in self.subscriptions.attach_all() {
            self.send_frame(frame);
        }
        for operation in self.operations.take_waiting() {
            self.start_operation(operation);
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let Phase::Active(active) = &mut self.phase else {
            return;
        };
        active.heartbeat.on_frame_received(Instant::now());
        let Some(command) = frame.tcp_command() else {
            return;
        };
        if matches!(
            command,
            TcpCommand::HeartbeatRequest | TcpCommand::HeartbeatResponse
        ) {
            return;
        }

        let handshake = active
            .handshake
            .as_ref()
            .map(|handshake| (handshake.step, handshake.correlation_id));
        if let Some((step, correlation_id)) = handshake {
            if correlation_id == frame.correlation_id {
                self.on_handshake_reply(step, command, frame);
            } else {
                debug!("dropping {command} received during handshake");
            }
            return;
        }

        if command == TcpCommand::NotHandled && self.redirect_if_not_master(&frame) {
            return;
        }

        let correlation_id = frame.correlation_id;
        if self.operations.contains(&correlation_id) {
            self.on_operation_reply(command, frame);
        } else if self.subscriptions.owns(&correlation_id) {
            if command == TcpCommand::NotHandled {
                // Not ready or too busy: ask again.
                if let Some(frame) = self.subscriptions.reattach(&correlation_id) {
                    self.send_frame(frame);
                }
            } else {
                self.subscriptions
                    .on_frame(&correlation_id, command, &frame.payload);
            }
        } else {
            debug!("no operation or subscription for {command} ({correlation_id})");
        }
    }

    /// Handles a not-master reply that names the leader. Returns `false` for every other
    /// not-handled reply.
    fn redirect_if_not_master(&mut self, frame: &Frame) -> bool {
        let Ok(message) = decode_payload::<NotHandled>(&frame.payload) else {
            return false;
        };
        if message.reason != NotHandledReason::NotMaster {
            return false;
        }
        let Some(leader) = message.master_info.and_then(|info| {
            u16::try_from(info.external_tcp_port)
                .ok()
                .map(|port| Endpoint::new(info.external_tcp_address, port))
        }) else {
            return false;
        };

        info!("node is not the leader, redirecting to {leader}");
        let error = ClientError::NotMaster(leader.to_string());
        if let Some(operation) = self.operations.take(&frame.correlation_id) {
            if let Some(operation) = operation.retry_or_fail(&error) {
                self.operations.requeue(operation);
            }
        }
        self.discoverer.redirect(leader);
        self.connection_lost(error, Reconnect::Immediate);
        true
    }

    fn on_operation_reply(&mut self, command: TcpCommand, frame: Frame) {
        let Some(operation) = self.operations.take(&frame.correlation_id) else {
            return;
        };
        let expected = operation.command.expected_reply();

        match command {
            command if Some(command) == expected => {
                let reply = Reply {
                    command,
                    payload: frame.payload,
                };
                match operation.inspect(&reply) {
                    ReplyDecision::Complete => operation.complete(reply),
                    ReplyDecision::Retry => {
                        let reason =
                            ClientError::ServerError(format!("{command} reported a transient failure"));
                        self.retry(operation, reason);
                    }
                }
            }
            TcpCommand::NotHandled => match decode_payload::<NotHandled>(&frame.payload) {
                Ok(message) => {
                    let reason = match message.reason {
                        NotHandledReason::NotReady => ClientError::NotReady,
                        NotHandledReason::TooBusy => ClientError::TooBusy,
                        NotHandledReason::NotMaster => ClientError::NotMaster("unknown".to_string()),
                    };
                    self.retry(operation, reason);
                }
                Err(e) => operation.fail(e.into()),
            },
            TcpCommand::BadRequest => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                operation.fail(ClientError::BadRequest(reason));
            }
            TcpCommand::NotAuthenticated => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                operation.fail(ClientError::NotAuthenticated(reason));
            }
            other => operation.fail(ClientError::UnexpectedCommand {
                expected,
                actual: other.code(),
            }),
        }
    }

    fn retry(&mut self, operation: Operation, reason: ClientError) {
        if let Some(operation) = operation.retry_or_fail(&reason) {
            self.start_operation(operation);
        }
    }

    /// Sends the operation when the connection is ready, otherwise queues it.
    fn start_operation(&mut self, operation: Operation) {
        let Phase::Active(active) = &self.phase else {
            self.operations.enqueue(operation);
            return;
        };
        if active.handshake.is_some() {
            self.operations.enqueue(operation);
            return;
        }

        let frame = self.operations.start(operation, Instant::now());
        match active.connection.send(&frame) {
            Ok(()) => {}
            Err(TransportError::Frame(e)) => {
                self.operations
                    .fail(&frame.correlation_id, TransportError::Frame(e).into());
            }
            Err(e) => self.connection_lost(e.into(), Reconnect::Backoff),
        }
    }

    /// Sends a frame that is not tracked by the operation table.
    fn send_frame(&mut self, frame: Frame) {
        let Phase::Active(active) = &self.phase else {
            return;
        };
        match active.connection.send(&frame) {
            Ok(()) => {}
            Err(TransportError::Frame(e)) => warn!("could not encode {:?}: {e}", frame.tcp_command()),
            Err(e) => self.connection_lost(e.into(), Reconnect::Backoff),
        }
    }

    fn connection_lost(&mut self, error: ClientError, reconnect: Reconnect) {
        if !matches!(self.phase, Phase::Active(_)) {
            return;
        }
        let Phase::Active(active) = mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let endpoint = active.connection.endpoint().clone();
        warn!(
            "connection {} to {endpoint} lost: {error}",
            active.connection.id()
        );
        active.connection.close();
        if active.handshake.is_none() {
            self.emit(ClientEvent::Disconnected(endpoint.clone()));
        }
        self.emit(ClientEvent::ErrorOccurred(error.to_string()));

        let expired = self.operations.expire(Instant::now());
        let (requeued, failed) = self.operations.on_connection_lost(&error);
        if expired > 0 {
            debug!("{expired} operations timed out with the connection");
        }
        if requeued + failed > 0 {
            debug!("{requeued} operations requeued, {failed} out of retries");
        }
        self.subscriptions.on_connection_lost();

        match reconnect {
            Reconnect::Backoff => {
                self.failed = Some(endpoint);
                self.schedule_reconnect(None);
            }
            Reconnect::Immediate => {
                self.failed = None;
                self.schedule_reconnect(Some(Duration::ZERO));
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Option<Duration>) {
        self.attempts += 1;
        if let Some(max) = self.settings.max_reconnections {
            if self.attempts > max {
                self.shutdown(
                    ClientError::CannotEstablishConnection { attempts: max },
                    SubscriptionDropReason::ConnectionClosed,
                    "reconnection limit reached",
                );
                return;
            }
        }

        let delay = delay.unwrap_or_else(|| self.settings.reconnect_backoff(self.attempts));
        self.set_state(ConnectionState::Reconnecting);
        info!("reconnecting in {delay:?} (attempt {})", self.attempts);
        self.emit(ClientEvent::Reconnecting {
            attempt: self.attempts,
        });

        if delay.is_zero() {
            self.start_connect();
        } else {
            self.phase = Phase::Waiting {
                until: Instant::now() + delay,
            };
        }
    }

    fn shutdown(&mut self, error: ClientError, reason: SubscriptionDropReason, message: &str) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        debug!(
            "failing {} in-flight and {} waiting operations, dropping {} subscriptions",
            self.operations.in_flight_len(),
            self.operations.waiting_len(),
            self.subscriptions.len()
        );
        if let Phase::Active(active) = mem::replace(&mut self.phase, Phase::Closed) {
            active.connection.close();
            if active.handshake.is_none() {
                self.emit(ClientEvent::Disconnected(active.connection.endpoint().clone()));
            }
        }

        self.operations.fail_all(error.clone());
        let subscription_error = (reason != SubscriptionDropReason::Unsubscribed).then_some(error);
        self.subscriptions.drop_all(reason, subscription_error);

        self.set_state(ConnectionState::Closed);
        info!("connection manager closed: {message}");
        self.emit(ClientEvent::Closed(message.to_string()));
    }

    fn is_current(&self, connection_id: ConnectionId) -> bool {
        matches!(&self.phase, Phase::Active(active) if active.connection.id() == connection_id)
    }

    fn is_ready(&self) -> bool {
        matches!(&self.phase, Phase::Active(active) if active.handshake.is_none())
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                debug!("state {} -> {next}", *state);
                *state = next;
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|listener| listener.send(event.clone()).is_ok());
        }
    }
}
