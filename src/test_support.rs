//! A scripted event store node for tests.
//!
//! [`FakeServer`] accepts connections on loopback, records every frame it reads and asks
//! a handler how to react. [`standard`] answers the handshake, heartbeats and pings the
//! way a healthy node does, and [`MemoryStore`] backs writes, reads and subscriptions
//! with in-memory streams.
use std::{
    collections::HashMap,
    io::Write,
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bincode::Encode;
use log::{debug, warn};
use uuid::Uuid;

use crate::{
    connection::Endpoint,
    protocol::{
        Frame, ProtocolTransport, TcpCommand, decode_payload, encode_payload,
        messages::{
            ConnectToPersistentSubscription, CreatePersistentSubscription,
            CreatePersistentSubscriptionCompleted, CreatePersistentSubscriptionResult,
            DeletePersistentSubscription, DeletePersistentSubscriptionCompleted,
            DeletePersistentSubscriptionResult, DeleteStream, DeleteStreamCompleted, DropReason,
            EventRecord, NewEvent, OperationResult, PersistentSubscriptionAckEvents,
            PersistentSubscriptionConfirmation, PersistentSubscriptionNakEvents,
            PersistentSubscriptionStreamEventAppeared, ReadEvent, ReadEventCompleted,
            ReadEventResult, ReadStreamEvents, ReadStreamEventsCompleted, ReadStreamResult,
            ResolvedIndexedEvent, StreamEventAppeared, SubscribeToStream,
            SubscriptionConfirmation, SubscriptionDropped, TransactionCommit,
            TransactionCommitCompleted, TransactionStart, TransactionStartCompleted,
            TransactionWrite, TransactionWriteCompleted, UpdatePersistentSubscription,
            UpdatePersistentSubscriptionCompleted, UpdatePersistentSubscriptionResult, WriteEvents,
            WriteEventsCompleted,
        },
    },
    settings::ConnectionSettings,
};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Settings with timers short enough for tests.
pub(crate) fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        operation_timeout: Duration::from_secs(2),
        operation_timeout_check_period: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(500),
        heartbeat_timeout: Duration::from_millis(500),
        reconnection_delay: Duration::from_millis(10),
        max_reconnection_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(500),
        ..ConnectionSettings::default()
    }
}

/// Which accepted connection a frame arrived on, counting from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Session {
    pub(crate) index: usize,
}

pub(crate) enum Reaction {
    Reply(Vec<Frame>),
    /// Bytes written as they are, bypassing frame encoding.
    Raw(Vec<u8>),
    Ignore,
    Disconnect,
}

type Handler = dyn Fn(&Session, &Frame) -> Reaction + Send + Sync;

pub(crate) struct FakeServer {
    endpoint: Endpoint,
    received: Arc<Mutex<Vec<(usize, Frame)>>>,
    sessions: Arc<AtomicUsize>,
}

impl FakeServer {
    pub(crate) fn start<H>(handler: H) -> Self
    where
        H: Fn(&Session, &Frame) -> Reaction + Send + Sync + 'static,
    {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let endpoint = Endpoint::from(listener.local_addr().expect("local address"));
        let handler: Arc<Handler> = Arc::new(handler);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&sessions);
        let log = Arc::clone(&received);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let session = Session {
                            index: accepted.fetch_add(1, Ordering::SeqCst),
                        };
                        let handler = Arc::clone(&handler);
                        let log = Arc::clone(&log);
                        thread::spawn(move || serve(session, stream, handler, log));
                    }
                    Err(e) => warn!("broken connection: {e:?}"),
                }
            }
        });

        Self {
            endpoint,
            received,
            sessions,
        }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Connections accepted so far.
    pub(crate) fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self, command: TcpCommand) -> Vec<Frame> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, frame)| frame.tcp_command() == Some(command))
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Polls until at least `count` frames of `command` arrived.
    pub(crate) fn wait_for(&self, command: TcpCommand, count: usize, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.received(command);
            if frames.len() >= count {
                return frames;
            }
            assert!(
                Instant::now() < deadline,
                "expected {count} {command} frames, got {}",
                frames.len()
            );
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn serve(
    session: Session,
    stream: TcpStream,
    handler: Arc<Handler>,
    received: Arc<Mutex<Vec<(usize, Frame)>>>,
) {
    let mut transport = ProtocolTransport::new(stream);
    loop {
        let frame = match transport.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("session {} ended: {e}", session.index);
                return;
            }
        };
        received.lock().unwrap().push((session.index, frame.clone()));

        match handler(&session, &frame) {
            Reaction::Reply(frames) => {
                for frame in frames {
                    if transport.write_frame(&frame).is_err() {
                        return;
                    }
                }
            }
            Reaction::Raw(bytes) => {
                if transport.get_ref().write_all(&bytes).is_err() {
                    return;
                }
            }
            Reaction::Ignore => {}
            Reaction::Disconnect => {
                let _ = transport.get_ref().shutdown(Shutdown::Both);
                return;
            }
        }
    }
}

pub(crate) fn reply<T: Encode>(command: TcpCommand, correlation_id: Uuid, message: &T) -> Frame {
    Frame::new(command, correlation_id, encode_payload(message).unwrap())
}

/// Answers heartbeat requests, the handshake and pings. `None` for anything else.
pub(crate) fn standard(frame: &Frame) -> Option<Reaction> {
    let answer = |command| Some(Reaction::Reply(vec![Frame::empty(command, frame.correlation_id)]));
    match frame.tcp_command()? {
        TcpCommand::HeartbeatRequest => answer(TcpCommand::HeartbeatResponse),
        TcpCommand::Authenticate => answer(TcpCommand::Authenticated),
        TcpCommand::IdentifyClient => answer(TcpCommand::ClientIdentified),
        TcpCommand::Ping => answer(TcpCommand::Pong),
        _ => None,
    }
}

#[derive(Default)]
struct Stream {
    events: Vec<EventRecord>,
    deleted: bool,
}

impl Stream {
    fn last_event_number(&self) -> Option<i64> {
        self.events.last().map(|event| event.event_number)
    }
}

struct Member {
    session: usize,
    correlation_id: Uuid,
    stream: String,
    group: Option<String>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    members: Vec<Member>,
    groups: HashMap<(String, String), i64>,
    transactions: HashMap<i64, (String, i64, Vec<NewEvent>)>,
    next_transaction: i64,
    position: i64,
    acked: Vec<Uuid>,
    naked: Vec<Uuid>,
}

/// In-memory streams behind write, read, transaction and subscription requests.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Handler that serves the handshake and everything the store understands.
    pub(crate) fn server(&self) -> FakeServer {
        let store = self.clone();
        FakeServer::start(move |session, frame| {
            standard(frame)
                .or_else(|| store.handle(session, frame))
                .unwrap_or(Reaction::Ignore)
        })
    }

    /// Appends without going through the wire.
    pub(crate) fn seed(&self, stream: &str, event_type: &str, count: usize) {
        let mut state = self.state.lock().unwrap();
        let events: Vec<NewEvent> = (0..count)
            .map(|_| NewEvent {
                event_id: Uuid::new_v4().into_bytes(),
                event_type: event_type.to_string(),
                is_json: true,
                data: b"{}".to_vec(),
                metadata: vec![],
            })
            .collect();
        state.append(stream, events);
    }

    pub(crate) fn acked(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().acked.clone()
    }

    pub(crate) fn naked(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().naked.clone()
    }

    pub(crate) fn handle(&self, session: &Session, frame: &Frame) -> Option<Reaction> {
        let command = frame.tcp_command()?;
        let corr = frame.correlation_id;
        let payload = &frame.payload;
        let mut state = self.state.lock().unwrap();

        let frames = match command {
            TcpCommand::WriteEvents => {
                let request: WriteEvents = decode_payload(payload).ok()?;
                let (completed, appended) =
                    state.write(&request.event_stream_id, request.expected_version, request.events);
                let mut frames = vec![reply(TcpCommand::WriteEventsCompleted, corr, &completed)];
                frames.extend(state.notify(session.index, &appended));
                frames
            }
            TcpCommand::DeleteStream => {
                let request: DeleteStream = decode_payload(payload).ok()?;
                let result = match state.check(&request.event_stream_id, request.expected_version) {
                    Ok(()) => {
                        state
                            .streams
                            .entry(request.event_stream_id)
                            .or_default()
                            .deleted = true;
                        OperationResult::Success
                    }
                    Err(result) => result,
                };
                let completed = DeleteStreamCompleted {
                    result,
                    message: None,
                    prepare_position: Some(state.position),
                    commit_position: Some(state.position),
                };
                vec![reply(TcpCommand::DeleteStreamCompleted, corr, &completed)]
            }
            TcpCommand::TransactionStart => {
                let request: TransactionStart = decode_payload(payload).ok()?;
                state.next_transaction += 1;
                let transaction_id = state.next_transaction;
                state.transactions.insert(
                    transaction_id,
                    (request.event_stream_id, request.expected_version, vec![]),
                );
                let completed = TransactionStartCompleted {
                    transaction_id,
                    result: OperationResult::Success,
                    message: None,
                };
                vec![reply(TcpCommand::TransactionStartCompleted, corr, &completed)]
            }
            TcpCommand::TransactionWrite => {
                let request: TransactionWrite = decode_payload(payload).ok()?;
                let result = match state.transactions.get_mut(&request.transaction_id) {
                    Some((_, _, pending)) => {
                        pending.extend(request.events);
                        OperationResult::Success
                    }
                    None => OperationResult::InvalidTransaction,
                };
                let completed = TransactionWriteCompleted {
                    transaction_id: request.transaction_id,
                    result,
                    message: None,
                };
                vec![reply(TcpCommand::TransactionWriteCompleted, corr, &completed)]
            }
            TcpCommand::TransactionCommit => {
                let request: TransactionCommit = decode_payload(payload).ok()?;
                let (completed, appended) = match state.transactions.remove(&request.transaction_id) {
                    Some((stream, expected, events)) => state.write(&stream, expected, events),
                    None => (
                        WriteEventsCompleted {
                            result: OperationResult::InvalidTransaction,
                            message: None,
                            first_event_number: -1,
                            last_event_number: -1,
                            prepare_position: None,
                            commit_position: None,
                            current_version: None,
                        },
                        vec![],
                    ),
                };
                let committed = TransactionCommitCompleted {
                    transaction_id: request.transaction_id,
                    result: completed.result,
                    message: completed.message,
                    first_event_number: completed.first_event_number,
                    last_event_number: completed.last_event_number,
                    prepare_position: completed.prepare_position,
                    commit_position: completed.commit_position,
                };
                let mut frames = vec![reply(TcpCommand::TransactionCommitCompleted, corr, &committed)];
                frames.extend(state.notify(session.index, &appended));
                frames
            }
            TcpCommand::ReadEvent => {
                let request: ReadEvent = decode_payload(payload).ok()?;
                let completed = state.read_event(&request.event_stream_id, request.event_number);
                vec![reply(TcpCommand::ReadEventCompleted, corr, &completed)]
            }
            TcpCommand::ReadStreamEventsForward => {
                let request: ReadStreamEvents = decode_payload(payload).ok()?;
                let completed = state.read(&request, true);
                vec![reply(TcpCommand::ReadStreamEventsForwardCompleted, corr, &completed)]
            }
            TcpCommand::ReadStreamEventsBackward => {
                let request: ReadStreamEvents = decode_payload(payload).ok()?;
                let completed = state.read(&request, false);
                vec![reply(TcpCommand::ReadStreamEventsBackwardCompleted, corr, &completed)]
            }
            TcpCommand::SubscribeToStream => {
                let request: SubscribeToStream = decode_payload(payload).ok()?;
                let last_event_number = state
                    .streams
                    .get(&request.event_stream_id)
                    .and_then(Stream::last_event_number);
                state.members.push(Member {
                    session: session.index,
                    correlation_id: corr,
                    stream: request.event_stream_id,
                    group: None,
                });
                let confirmation = SubscriptionConfirmation {
                    last_commit_position: state.position,
                    last_event_number,
                };
                vec![reply(TcpCommand::SubscriptionConfirmation, corr, &confirmation)]
            }
            TcpCommand::UnsubscribeFromStream => {
                state.members.retain(|member| member.correlation_id != corr);
                let dropped = SubscriptionDropped {
                    reason: DropReason::Unsubscribed,
                };
                vec![reply(TcpCommand::SubscriptionDropped, corr, &dropped)]
            }
            TcpCommand::CreatePersistentSubscription => {
                let request: CreatePersistentSubscription = decode_payload(payload).ok()?;
                let key = (request.event_stream_id, request.group_name);
                let result = if state.groups.contains_key(&key) {
                    CreatePersistentSubscriptionResult::AlreadyExists
                } else {
                    state.groups.insert(key, request.config.start_from);
                    CreatePersistentSubscriptionResult::Success
                };
                let completed = CreatePersistentSubscriptionCompleted {
                    result,
                    reason: None,
                };
                vec![reply(TcpCommand::CreatePersistentSubscriptionCompleted, corr, &completed)]
            }
            TcpCommand::UpdatePersistentSubscription => {
                let request: UpdatePersistentSubscription = decode_payload(payload).ok()?;
                let key = (request.event_stream_id, request.group_name);
                let result = match state.groups.get_mut(&key) {
                    Some(start_from) => {
                        *start_from = request.config.start_from;
                        UpdatePersistentSubscriptionResult::Success
                    }
                    None => UpdatePersistentSubscriptionResult::DoesNotExist,
                };
                let completed = UpdatePersistentSubscriptionCompleted {
                    result,
                    reason: None,
                };
                vec![reply(TcpCommand::UpdatePersistentSubscriptionCompleted, corr, &completed)]
            }
            TcpCommand::DeletePersistentSubscription => {
                let request: DeletePersistentSubscription = decode_payload(payload).ok()?;
                let key = (request.event_stream_id, request.group_name);
                let result = match state.groups.remove(&key) {
                    Some(_) => DeletePersistentSubscriptionResult::Success,
                    None => DeletePersistentSubscriptionResult::DoesNotExist,
                };
                let completed = DeletePersistentSubscriptionCompleted {
                    result,
                    reason: None,
                };
                vec![reply(TcpCommand::DeletePersistentSubscriptionCompleted, corr, &completed)]
            }
            TcpCommand::ConnectToPersistentSubscription => {
                let request: ConnectToPersistentSubscription = decode_payload(payload).ok()?;
                state.connect_member(session.index, corr, request)
            }
            TcpCommand::PersistentSubscriptionAckEvents => {
                let request: PersistentSubscriptionAckEvents = decode_payload(payload).ok()?;
                state
                    .acked
                    .extend(request.processed_event_ids.into_iter().map(Uuid::from_bytes));
                vec![]
            }
            TcpCommand::PersistentSubscriptionNakEvents => {
                let request: PersistentSubscriptionNakEvents = decode_payload(payload).ok()?;
                state
                    .naked
                    .extend(request.processed_event_ids.into_iter().map(Uuid::from_bytes));
                vec![]
            }
            _ => return None,
        };
        Some(Reaction::Reply(frames))
    }
}

impl State {
    fn check(&self, stream: &str, expected_version: i64) -> Result<(), OperationResult> {
        let existing = self.streams.get(stream);
        if existing.is_some_and(|s| s.deleted) {
            return Err(OperationResult::StreamDeleted);
        }
        let current = existing.and_then(Stream::last_event_number);
        let matches = match expected_version {
            -2 => true,
            -1 => current.is_none(),
            -4 => current.is_some(),
            n => current == Some(n),
        };
        if matches {
            Ok(())
        } else {
            Err(OperationResult::WrongExpectedVersion)
        }
    }

    fn append(&mut self, stream: &str, events: Vec<NewEvent>) -> Vec<EventRecord> {
        let records = self.streams.entry(stream.to_string()).or_default();
        let mut appended = vec![];
        for event in events {
            let record = EventRecord {
                event_stream_id: stream.to_string(),
                event_number: records.events.len() as i64,
                event_id: event.event_id,
                event_type: event.event_type,
                is_json: event.is_json,
                data: event.data,
                metadata: event.metadata,
                created_epoch: None,
            };
            records.events.push(record.clone());
            appended.push(record);
        }
        self.position += appended.len() as i64;
        appended
    }

    fn write(
        &mut self,
        stream: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> (WriteEventsCompleted, Vec<EventRecord>) {
        if let Err(result) = self.check(stream, expected_version) {
            let current_version = self.streams.get(stream).and_then(Stream::last_event_number);
            let completed = WriteEventsCompleted {
                result,
                message: None,
                first_event_number: -1,
                last_event_number: -1,
                prepare_position: None,
                commit_position: None,
                current_version,
            };
            return (completed, vec![]);
        }

        let appended = self.append(stream, events);
        let last = self.streams.get(stream).and_then(Stream::last_event_number);
        let completed = WriteEventsCompleted {
            result: OperationResult::Success,
            message: None,
            first_event_number: appended.first().map_or(-1, |e| e.event_number),
            last_event_number: last.unwrap_or(-1),
            prepare_position: Some(self.position),
            commit_position: Some(self.position),
            current_version: last,
        };
        (completed, appended)
    }

    /// Event-appeared frames for the subscriptions living on `session`.
    fn notify(&self, session: usize, appended: &[EventRecord]) -> Vec<Frame> {
        let mut frames = vec![];
        for member in self.members.iter().filter(|m| m.session == session) {
            for record in appended.iter().filter(|r| r.event_stream_id == member.stream) {
                let event = ResolvedIndexedEvent {
                    event: Some(record.clone()),
                    link: None,
                };
                frames.push(match member.group {
                    Some(_) => reply(
                        TcpCommand::PersistentSubscriptionStreamEventAppeared,
                        member.correlation_id,
                        &PersistentSubscriptionStreamEventAppeared {
                            event,
                            retry_count: Some(0),
                        },
                    ),
                    None => reply(
                        TcpCommand::StreamEventAppeared,
                        member.correlation_id,
                        &StreamEventAppeared { event },
                    ),
                });
            }
        }
        frames
    }

    fn connect_member(
        &mut self,
        session: usize,
        correlation_id: Uuid,
        request: ConnectToPersistentSubscription,
    ) -> Vec<Frame> {
        let key = (request.event_stream_id.clone(), request.group_name.clone());
        let Some(start_from) = self.groups.get(&key).copied() else {
            let dropped = SubscriptionDropped {
                reason: DropReason::NotFound,
            };
            return vec![reply(TcpCommand::SubscriptionDropped, correlation_id, &dropped)];
        };

        let history: Vec<EventRecord> = match self.streams.get(&request.event_stream_id) {
            Some(stream) if start_from >= 0 => stream
                .events
                .iter()
                .filter(|e| e.event_number >= start_from)
                .cloned()
                .collect(),
            _ => vec![],
        };
        let last_event_number = self
            .streams
            .get(&request.event_stream_id)
            .and_then(Stream::last_event_number);
        self.members.push(Member {
            session,
            correlation_id,
            stream: request.event_stream_id,
            group: Some(request.group_name),
        });

        let confirmation = PersistentSubscriptionConfirmation {
            last_commit_position: self.position,
            subscription_id: format!("{}::{}", key.0, key.1),
            last_event_number,
        };
        let mut frames = vec![reply(
            TcpCommand::PersistentSubscriptionConfirmation,
            correlation_id,
            &confirmation,
        )];
        let member = self.members.last().map(|m| m.correlation_id);
        for record in history {
            if let Some(correlation_id) = member {
                frames.push(reply(
                    TcpCommand::PersistentSubscriptionStreamEventAppeared,
                    correlation_id,
                    &PersistentSubscriptionStreamEventAppeared {
                        event: ResolvedIndexedEvent {
                            event: Some(record),
                            link: None,
                        },
                        retry_count: Some(0),
                    },
                ));
            }
        }
        frames
    }

    fn read_event(&self, stream: &str, event_number: i64) -> ReadEventCompleted {
        let (result, event) = match self.streams.get(stream) {
            None => (ReadEventResult::NoStream, None),
            Some(s) if s.deleted => (ReadEventResult::StreamDeleted, None),
            Some(s) => {
                let found = if event_number == -1 {
                    s.events.last()
                } else {
                    s.events.iter().find(|e| e.event_number == event_number)
                };
                match found {
                    Some(record) => (
                        ReadEventResult::Success,
                        Some(ResolvedIndexedEvent {
                            event: Some(record.clone()),
                            link: None,
                        }),
                    ),
                    None => (ReadEventResult::NotFound, None),
                }
            }
        };
        ReadEventCompleted {
            result,
            event,
            error: None,
        }
    }

    fn read(&self, request: &ReadStreamEvents, forward: bool) -> ReadStreamEventsCompleted {
        let empty = |result| ReadStreamEventsCompleted {
            events: vec![],
            result,
            next_event_number: -1,
            last_event_number: -1,
            is_end_of_stream: true,
            last_commit_position: self.position,
            error: None,
        };
        let stream = match self.streams.get(&request.event_stream_id) {
            None => return empty(ReadStreamResult::NoStream),
            Some(s) if s.deleted => return empty(ReadStreamResult::StreamDeleted),
            Some(s) => s,
        };

        let max = usize::try_from(request.max_count).unwrap_or(0);
        let last = stream.last_event_number().unwrap_or(-1);
        let records: Vec<EventRecord> = if forward {
            stream
                .events
                .iter()
                .filter(|e| e.event_number >= request.from_event_number)
                .take(max)
                .cloned()
                .collect()
        } else {
            let from = if request.from_event_number < 0 {
                last
            } else {
                request.from_event_number
            };
            stream
                .events
                .iter()
                .rev()
                .filter(|e| e.event_number <= from)
                .take(max)
                .cloned()
                .collect()
        };

        let (next_event_number, is_end_of_stream) = match (forward, records.last()) {
            (true, Some(r)) => (r.event_number + 1, r.event_number >= last),
            (true, None) => (request.from_event_number, true),
            (false, Some(r)) => (r.event_number - 1, r.event_number == 0),
            (false, None) => (-1, true),
        };
        ReadStreamEventsCompleted {
            events: records
                .into_iter()
                .map(|record| ResolvedIndexedEvent {
                    event: Some(record),
                    link: None,
                })
                .collect(),
            result: ReadStreamResult::Success,
            next_event_number,
            last_event_number: last,
            is_end_of_stream,
            last_commit_position: self.position,
            error: None,
        }
    }
}
