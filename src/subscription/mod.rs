//! Subscriptions.
//!
//! A subscription is a long-lived registry entry in the connection manager, keyed by a
//! stable [`SubscriptionId`] and re-attached to every new physical connection. Events are
//! handed to a dedicated dispatcher thread per subscription which runs the caller's
//! handler, so a slow handler never stalls the receive loop or the manager.
//!
//! # Key Components
//!
//! - [`VolatileSubscription`]: live events of one stream, in arrival order.
//! - [`PersistentSubscription`]: a member of a server-side consumer group with explicit
//!   ack/nak and a bounded in-flight buffer.
//! - [`CatchUpSubscription`]: history from a checkpoint followed by live events.
//!
//! # See Also
//!
//! - [`Client`](crate::Client): Entry points that open subscriptions.
mod catchup;
mod controller;

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use uuid::Uuid;

use crate::{
    connection::{ConnectionManager, Message},
    error::{ClientError, ClientResult},
    event::ResolvedEvent,
    protocol::{
        TcpCommand,
        messages::{ConsumerStrategy, DropReason, NakAction, PersistentSubscriptionConfig},
    },
};

pub use catchup::{CatchUpSettings, CatchUpSubscription};
pub use controller::SubscriptionState;

pub(crate) use controller::{
    SubscriptionController, SubscriptionKind, SubscriptionMessage, SubscriptionRegistry,
    SubscriptionRequest,
};

/// Error type returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    SubscriberMaxCountReached,
    ConnectionClosed,
    EventHandlerError,
    ProcessingQueueOverflow,
    ServerError,
    CatchUpError,
}

impl From<DropReason> for SubscriptionDropReason {
    fn from(value: DropReason) -> Self {
        match value {
            DropReason::Unsubscribed => SubscriptionDropReason::Unsubscribed,
            DropReason::AccessDenied => SubscriptionDropReason::AccessDenied,
            DropReason::NotFound => SubscriptionDropReason::NotFound,
            DropReason::PersistentSubscriptionDeleted => {
                SubscriptionDropReason::PersistentSubscriptionDeleted
            }
            DropReason::SubscriberMaxCountReached => {
                SubscriptionDropReason::SubscriberMaxCountReached
            }
        }
    }
}

/// Why a subscription ended, and the error behind it when there was one.
#[derive(Debug, Clone)]
pub struct Dropped {
    pub reason: SubscriptionDropReason,
    pub error: Option<ClientError>,
}

/// What the server reported when it accepted a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub last_commit_position: i64,
    pub last_event_number: Option<i64>,
    /// Server-side id of a persistent subscription.
    pub subscription_id: Option<String>,
}

/// Shared by every handle kind: identity, the manager's control channel and the outcome
/// recorded by the dispatcher when the subscription ends.
#[derive(Clone)]
struct Handle {
    id: SubscriptionId,
    stream: String,
    confirmation: Confirmation,
    control: Sender<Message>,
    outcome: Arc<Mutex<Option<Dropped>>>,
    done: Receiver<()>,
}

impl Handle {
    fn unsubscribe_with(&self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        let _ = self.control.send(Message::Unsubscribe {
            id: self.id,
            reason,
            error,
        });
    }

    fn dropped(&self) -> Option<Dropped> {
        self.outcome.lock().ok().and_then(|outcome| outcome.clone())
    }

    fn wait_dropped(&self, timeout: Duration) -> Option<Dropped> {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => self.dropped(),
            _ => None,
        }
    }
}

/// Subscription kinds the dispatcher can run a handler for.
trait Dispatch: Clone + Send + 'static {
    fn handle(&self) -> &Handle;

    /// Called after the handler accepted an event.
    fn event_handled(&self, _event: &ResolvedEvent) {}
}

/// Registers the subscription with the manager and blocks until it is confirmed.
fn open(
    manager: &ConnectionManager,
    request: SubscriptionRequest,
    timeout: Duration,
) -> ClientResult<(Handle, Receiver<SubscriptionMessage>, Sender<()>)> {
    let id = SubscriptionId::next();
    let stream = request.stream.clone();
    let command = match request.kind {
        SubscriptionKind::Volatile => TcpCommand::SubscribeToStream,
        SubscriptionKind::Persistent { .. } => TcpCommand::ConnectToPersistentSubscription,
    };
    let (events_tx, events) = crossbeam::channel::unbounded();
    let (confirm_tx, confirm_rx) = crossbeam::channel::bounded(1);
    let controller = SubscriptionController::new(id, request, events_tx, confirm_tx);
    manager.send(Message::Subscribe(controller))?;

    let confirmation = match confirm_rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(RecvTimeoutError::Timeout) => {
            return Err(abandon(&manager.control(), id, command, timeout));
        }
        Err(RecvTimeoutError::Disconnected) => return Err(ClientError::ConnectionClosed),
    };

    let (done_tx, done) = crossbeam::channel::bounded(0);
    let handle = Handle {
        id,
        stream,
        confirmation,
        control: manager.control(),
        outcome: Arc::new(Mutex::new(None)),
        done,
    };
    Ok((handle, events, done_tx))
}

/// Gives up on a subscribe that was not confirmed in time. The connection is healthy,
/// so the local drop is recorded as a server error.
fn abandon(
    control: &Sender<Message>,
    id: SubscriptionId,
    command: TcpCommand,
    timeout: Duration,
) -> ClientError {
    let error = ClientError::OperationTimedOut { command, timeout };
    let _ = control.send(Message::Unsubscribe {
        id,
        reason: SubscriptionDropReason::ServerError,
        error: Some(error.clone()),
    });
    error
}

fn spawn_dispatcher<S, F>(
    subscription: S,
    events: Receiver<SubscriptionMessage>,
    done: Sender<()>,
    mut handler: F,
) -> ClientResult<()>
where
    S: Dispatch,
    F: FnMut(&S, &ResolvedEvent) -> Result<(), HandlerError> + Send + 'static,
{
    let id = subscription.handle().id;
    thread::Builder::new()
        .name(format!("eventlink-sub-{}", id.0))
        .spawn(move || {
            let _done = done;
            let handle = subscription.handle().clone();
            let mut failed = false;
            let mut outcome = Dropped {
                reason: SubscriptionDropReason::ConnectionClosed,
                error: None,
            };

            for message in events.iter() {
                match message {
                    SubscriptionMessage::Event(event) if !failed => {
                        match handler(&subscription, &event) {
                            Ok(()) => subscription.event_handled(&event),
                            Err(e) => {
                                error!("subscription {id} handler failed: {e}");
                                failed = true;
                                handle.unsubscribe_with(
                                    SubscriptionDropReason::EventHandlerError,
                                    Some(ClientError::EventHandler(e.to_string())),
                                );
                            }
                        }
                    }
                    SubscriptionMessage::Event(_) => {}
                    SubscriptionMessage::Dropped { reason, error } => {
                        outcome = Dropped { reason, error };
                        break;
                    }
                }
            }

            debug!("subscription {id} dispatcher exiting: {:?}", outcome.reason);
            if let Ok(mut slot) = handle.outcome.lock() {
                *slot = Some(outcome);
            }
        })
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    Ok(())
}

/// Live events of one stream.
#[derive(Clone)]
pub struct VolatileSubscription {
    handle: Handle,
}

impl Dispatch for VolatileSubscription {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl VolatileSubscription {
    pub(crate) fn start<F>(
        manager: &ConnectionManager,
        request: SubscriptionRequest,
        handler: F,
    ) -> ClientResult<Self>
    where
        F: FnMut(&Self, &ResolvedEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        let (handle, events, done) = open(manager, request, manager.settings().operation_timeout)?;
        let subscription = Self { handle };
        spawn_dispatcher(subscription.clone(), events, done, handler)?;
        Ok(subscription)
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn stream(&self) -> &str {
        &self.handle.stream
    }

    pub fn last_event_number(&self) -> Option<i64> {
        self.handle.confirmation.last_event_number
    }

    pub fn last_commit_position(&self) -> i64 {
        self.handle.confirmation.last_commit_position
    }

    pub fn unsubscribe(&self) {
        self.handle
            .unsubscribe_with(SubscriptionDropReason::Unsubscribed, None);
    }

    /// `None` while the subscription is live.
    pub fn dropped(&self) -> Option<Dropped> {
        self.handle.dropped()
    }

    pub fn wait_dropped(&self, timeout: Duration) -> Option<Dropped> {
        self.handle.wait_dropped(timeout)
    }
}

/// Membership in a persistent subscription group.
#[derive(Clone)]
pub struct PersistentSubscription {
    handle: Handle,
    group: String,
    auto_ack: bool,
}

impl Dispatch for PersistentSubscription {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn event_handled(&self, event: &ResolvedEvent) {
        if self.auto_ack {
            self.ack(event);
        }
    }
}

impl PersistentSubscription {
    pub(crate) fn start<F>(
        manager: &ConnectionManager,
        request: SubscriptionRequest,
        auto_ack: bool,
        handler: F,
    ) -> ClientResult<Self>
    where
        F: FnMut(&Self, &ResolvedEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        let group = match &request.kind {
            SubscriptionKind::Persistent { group, .. } => group.clone(),
            SubscriptionKind::Volatile => String::new(),
        };
        let (handle, events, done) = open(manager, request, manager.settings().operation_timeout)?;
        info!(
            "joined group '{group}' on '{}' as {:?}",
            handle.stream, handle.confirmation.subscription_id
        );
        let subscription = Self {
            handle,
            group,
            auto_ack,
        };
        spawn_dispatcher(subscription.clone(), events, done, handler)?;
        Ok(subscription)
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn stream(&self) -> &str {
        &self.handle.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// The id the server assigned to this member of the group.
    pub fn subscription_id(&self) -> Option<&str> {
        self.handle.confirmation.subscription_id.as_deref()
    }

    pub fn ack(&self, event: &ResolvedEvent) {
        self.ack_ids(vec![event.original_event_id()]);
    }

    /// Fire-and-forget. Acks sent while disconnected are dropped; the server redelivers.
    pub fn ack_ids(&self, event_ids: Vec<Uuid>) {
        let _ = self.handle.control.send(Message::Ack {
            id: self.handle.id,
            event_ids,
        });
    }

    pub fn nak(&self, events: &[ResolvedEvent], action: NakAction, reason: impl Into<String>) {
        let _ = self.handle.control.send(Message::Nak {
            id: self.handle.id,
            event_ids: events.iter().map(ResolvedEvent::original_event_id).collect(),
            action,
            message: Some(reason.into()),
        });
    }

    pub fn unsubscribe(&self) {
        self.handle
            .unsubscribe_with(SubscriptionDropReason::Unsubscribed, None);
    }

    pub fn dropped(&self) -> Option<Dropped> {
        self.handle.dropped()
    }

    pub fn wait_dropped(&self, timeout: Duration) -> Option<Dropped> {
        self.handle.wait_dropped(timeout)
    }
}

/// Configuration of a persistent subscription group, sent on create and update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    /// First event number the group reads. `-1` starts at the end of the stream.
    pub start_from: i64,
    pub message_timeout: Duration,
    pub extra_statistics: bool,
    pub live_buffer_size: u32,
    pub read_batch_size: u32,
    pub history_buffer_size: u32,
    pub max_retry_count: u32,
    pub checkpoint_after: Duration,
    pub min_checkpoint_count: u32,
    pub max_checkpoint_count: u32,
    /// `0` means unlimited.
    pub max_subscriber_count: u32,
    pub consumer_strategy: ConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            message_timeout: Duration::from_secs(30),
            extra_statistics: false,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            max_retry_count: 10,
            checkpoint_after: Duration::from_secs(2),
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategy::RoundRobin,
        }
    }
}

impl PersistentSubscriptionSettings {
    pub(crate) fn to_wire(&self) -> PersistentSubscriptionConfig {
        let int = |n: u32| i32::try_from(n).unwrap_or(i32::MAX);
        let millis = |d: Duration| i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
        PersistentSubscriptionConfig {
            resolve_link_tos: self.resolve_link_tos,
            start_from: self.start_from,
            message_timeout_ms: millis(self.message_timeout),
            record_statistics: self.extra_statistics,
            live_buffer_size: int(self.live_buffer_size),
            read_batch_size: int(self.read_batch_size),
            buffer_size: int(self.history_buffer_size),
            max_retry_count: int(self.max_retry_count),
            checkpoint_after_ms: millis(self.checkpoint_after),
            checkpoint_min_count: int(self.min_checkpoint_count),
            checkpoint_max_count: int(self.max_checkpoint_count),
            subscriber_max_count: int(self.max_subscriber_count),
            consumer_strategy: self.consumer_strategy,
        }
    }
}
