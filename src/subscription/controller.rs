use std::collections::{HashMap, HashSet, VecDeque};

use crossbeam::channel::Sender;
use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{ClientError, ClientResult},
    event::ResolvedEvent,
    protocol::{
        Credentials, Frame, TcpCommand, decode_payload, encode_payload,
        messages::{
            ConnectToPersistentSubscription, NakAction, PersistentSubscriptionAckEvents,
            PersistentSubscriptionConfirmation, PersistentSubscriptionNakEvents,
            PersistentSubscriptionStreamEventAppeared, StreamEventAppeared, SubscribeToStream,
            SubscriptionConfirmation, SubscriptionDropped,
        },
    },
};

use super::{Confirmation, SubscriptionDropReason, SubscriptionId};

/// What a controller hands to the dispatcher thread of its subscription.
#[derive(Debug)]
pub(crate) enum SubscriptionMessage {
    Event(ResolvedEvent),
    Dropped {
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Confirmed,
    Dropped,
}

#[derive(Debug, Clone)]
pub(crate) enum SubscriptionKind {
    Volatile,
    Persistent { group: String, buffer_size: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct SubscriptionRequest {
    pub(crate) stream: String,
    pub(crate) resolve_link_tos: bool,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) kind: SubscriptionKind,
}

/// Server side state of one subscription as seen from the manager thread.
pub(crate) struct SubscriptionController {
    id: SubscriptionId,
    request: SubscriptionRequest,
    state: SubscriptionState,
    correlation_id: Option<Uuid>,
    server_subscription_id: Option<String>,
    in_flight: HashSet<Uuid>,
    backlog: VecDeque<ResolvedEvent>,
    events: Sender<SubscriptionMessage>,
    confirmation: Option<Sender<ClientResult<Confirmation>>>,
}

impl SubscriptionController {
    pub(crate) fn new(
        id: SubscriptionId,
        request: SubscriptionRequest,
        events: Sender<SubscriptionMessage>,
        confirmation: Sender<ClientResult<Confirmation>>,
    ) -> Self {
        Self {
            id,
            request,
            state: SubscriptionState::Pending,
            correlation_id: None,
            server_subscription_id: None,
            in_flight: HashSet::new(),
            backlog: VecDeque::new(),
            events,
            confirmation: Some(confirmation),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.state
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.state == SubscriptionState::Dropped
    }

    /// Request that (re)attaches the subscription to the current connection. Every call
    /// mints a new correlation id and restarts in-flight accounting, since the server
    /// redelivers whatever was not acknowledged.
    pub(crate) fn subscribe_frame(&mut self) -> ClientResult<Frame> {
        let correlation_id = Uuid::new_v4();
        self.correlation_id = Some(correlation_id);
        self.state = SubscriptionState::Pending;
        self.in_flight.clear();
        self.backlog.clear();

        let (command, payload) = match &self.request.kind {
            SubscriptionKind::Volatile => (
                TcpCommand::SubscribeToStream,
                encode_payload(&SubscribeToStream {
                    event_stream_id: self.request.stream.clone(),
                    resolve_link_tos: self.request.resolve_link_tos,
                })?,
            ),
            SubscriptionKind::Persistent { group, buffer_size } => (
                TcpCommand::ConnectToPersistentSubscription,
                encode_payload(&ConnectToPersistentSubscription {
                    group_name: group.clone(),
                    event_stream_id: self.request.stream.clone(),
                    allowed_in_flight_messages: i32::try_from(*buffer_size).unwrap_or(i32::MAX),
                })?,
            ),
        };

        debug!(
            "subscription {} on '{}' attaching as {correlation_id}",
            self.id, self.request.stream
        );
        Ok(Frame::new(command, correlation_id, payload)
            .with_credentials(self.request.credentials.clone()))
    }

    pub(crate) fn unsubscribe_frame(&self) -> Option<Frame> {
        let correlation_id = self.correlation_id?;
        if self.is_dropped() {
            return None;
        }
        Some(
            Frame::empty(TcpCommand::UnsubscribeFromStream, correlation_id)
                .with_credentials(self.request.credentials.clone()),
        )
    }

    /// Handles a frame carrying this subscription's correlation id.
    pub(crate) fn on_frame(&mut self, command: TcpCommand, payload: &[u8]) {
        if self.is_dropped() {
            return;
        }
        if let Err(error) = self.apply(command, payload) {
            warn!("subscription {} failed: {error}", self.id);
            let reason = match error {
                ClientError::NotAuthenticated(_) | ClientError::AccessDenied(_) => {
                    SubscriptionDropReason::AccessDenied
                }
                _ => SubscriptionDropReason::ServerError,
            };
            self.drop_with(reason, Some(error));
        }
    }

    fn apply(&mut self, command: TcpCommand, payload: &[u8]) -> ClientResult<()> {
        match command {
            TcpCommand::SubscriptionConfirmation => {
                let message: SubscriptionConfirmation = decode_payload(payload)?;
                self.confirm(Confirmation {
                    last_commit_position: message.last_commit_position,
                    last_event_number: message.last_event_number,
                    subscription_id: None,
                });
            }
            TcpCommand::PersistentSubscriptionConfirmation => {
                let message: PersistentSubscriptionConfirmation = decode_payload(payload)?;
                self.server_subscription_id = Some(message.subscription_id.clone());
                self.confirm(Confirmation {
                    last_commit_position: message.last_commit_position,
                    last_event_number: message.last_event_number,
                    subscription_id: Some(message.subscription_id),
                });
            }
            TcpCommand::StreamEventAppeared => {
                let message: StreamEventAppeared = decode_payload(payload)?;
                if let Some(event) = ResolvedEvent::from_wire(message.event, None) {
                    self.deliver(event);
                }
            }
            TcpCommand::PersistentSubscriptionStreamEventAppeared => {
                let message: PersistentSubscriptionStreamEventAppeared = decode_payload(payload)?;
                if let Some(event) = ResolvedEvent::from_wire(message.event, message.retry_count) {
                    self.admit(event);
                }
            }
            TcpCommand::SubscriptionDropped => {
                let message: SubscriptionDropped = decode_payload(payload)?;
                self.drop_with(message.reason.into(), None);
            }
            TcpCommand::NotAuthenticated => {
                return Err(ClientError::NotAuthenticated(
                    String::from_utf8_lossy(payload).into_owned(),
                ));
            }
            TcpCommand::BadRequest => {
                return Err(ClientError::BadRequest(
                    String::from_utf8_lossy(payload).into_owned(),
                ));
            }
            other => {
                return Err(ClientError::UnexpectedCommand {
                    expected: None,
                    actual: other.code(),
                });
            }
        }
        Ok(())
    }

    fn confirm(&mut self, confirmation: Confirmation) {
        info!(
            "subscription {} on '{}' confirmed at {:?}",
            self.id, self.request.stream, confirmation.last_event_number
        );
        self.state = SubscriptionState::Confirmed;
        if let Some(sink) = self.confirmation.take() {
            let _ = sink.send(Ok(confirmation));
        }
    }

    fn deliver(&self, event: ResolvedEvent) {
        trace!(
            "subscription {} delivering {}@{}",
            self.id,
            event.original_event_number(),
            event.original_stream_id()
        );
        let _ = self.events.send(SubscriptionMessage::Event(event));
    }

    /// Persistent delivery: at most `buffer_size` events are handed out unacknowledged.
    fn admit(&mut self, event: ResolvedEvent) {
        let capacity = match self.request.kind {
            SubscriptionKind::Persistent { buffer_size, .. } => buffer_size,
            SubscriptionKind::Volatile => usize::MAX,
        };
        if self.in_flight.len() < capacity {
            self.in_flight.insert(event.original_event_id());
            self.deliver(event);
        } else if self.backlog.len() < capacity {
            trace!("subscription {} buffer full, holding event", self.id);
            self.backlog.push_back(event);
        } else {
            let error = ClientError::ServerError(format!(
                "server exceeded {capacity} unacknowledged events"
            ));
            warn!("subscription {} failed: {error}", self.id);
            self.drop_with(SubscriptionDropReason::ServerError, Some(error));
        }
    }

    fn settle(&mut self, event_ids: &[Uuid]) {
        for id in event_ids {
            self.in_flight.remove(id);
        }
        while let Some(event) = self.backlog.pop_front() {
            if let SubscriptionKind::Persistent { buffer_size, .. } = self.request.kind {
                if self.in_flight.len() >= buffer_size {
                    self.backlog.push_front(event);
                    break;
                }
            }
            self.in_flight.insert(event.original_event_id());
            self.deliver(event);
        }
    }

    fn settle_frame(&mut self, event_ids: &[Uuid]) -> Option<(Uuid, String)> {
        if self.state != SubscriptionState::Confirmed {
            return None;
        }
        let correlation_id = self.correlation_id?;
        let subscription_id = self.server_subscription_id.clone()?;
        self.settle(event_ids);
        Some((correlation_id, subscription_id))
    }

    pub(crate) fn ack(&mut self, event_ids: &[Uuid]) -> ClientResult<Option<Frame>> {
        let Some((correlation_id, subscription_id)) = self.settle_frame(event_ids) else {
            return Ok(None);
        };
        let payload = encode_payload(&PersistentSubscriptionAckEvents {
            subscription_id,
            processed_event_ids: event_ids.iter().map(|id| id.into_bytes()).collect(),
        })?;
        Ok(Some(
            Frame::new(TcpCommand::PersistentSubscriptionAckEvents, correlation_id, payload)
                .with_credentials(self.request.credentials.clone()),
        ))
    }

    pub(crate) fn nak(
        &mut self,
        event_ids: &[Uuid],
        action: NakAction,
        message: Option<String>,
    ) -> ClientResult<Option<Frame>> {
        let Some((correlation_id, subscription_id)) = self.settle_frame(event_ids) else {
            return Ok(None);
        };
        let payload = encode_payload(&PersistentSubscriptionNakEvents {
            subscription_id,
            processed_event_ids: event_ids.iter().map(|id| id.into_bytes()).collect(),
            message,
            action,
        })?;
        Ok(Some(
            Frame::new(TcpCommand::PersistentSubscriptionNakEvents, correlation_id, payload)
                .with_credentials(self.request.credentials.clone()),
        ))
    }

    pub(crate) fn on_connection_lost(&mut self) {
        if self.is_dropped() {
            return;
        }
        self.state = SubscriptionState::Pending;
        self.correlation_id = None;
        self.in_flight.clear();
        self.backlog.clear();
    }

    pub(crate) fn drop_with(&mut self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        if self.is_dropped() {
            return;
        }
        info!(
            "subscription {} on '{}' dropped: {reason:?}",
            self.id, self.request.stream
        );
        self.state = SubscriptionState::Dropped;
        if let Some(sink) = self.confirmation.take() {
            let _ = sink.send(Err(ClientError::SubscriptionDropped(reason)));
        }
        let _ = self.events.send(SubscriptionMessage::Dropped { reason, error });
    }
}

/// Live subscriptions keyed by their stable handle, plus the correlation ids they are
/// attached under on the current connection.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    controllers: HashMap<SubscriptionId, SubscriptionController>,
    by_correlation: HashMap<Uuid, SubscriptionId>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.controllers.len()
    }

    pub(crate) fn insert(&mut self, controller: SubscriptionController) {
        self.controllers.insert(controller.id(), controller);
    }

    pub(crate) fn owns(&self, correlation_id: &Uuid) -> bool {
        self.by_correlation.contains_key(correlation_id)
    }

    /// Subscribe request for one subscription. A request that cannot be encoded drops
    /// the subscription.
    pub(crate) fn attach(&mut self, id: SubscriptionId) -> Option<Frame> {
        let controller = self.controllers.get_mut(&id)?;
        match controller.subscribe_frame() {
            Ok(frame) => {
                self.by_correlation.insert(frame.correlation_id, id);
                Some(frame)
            }
            Err(error) => {
                controller.drop_with(SubscriptionDropReason::ServerError, Some(error));
                self.controllers.remove(&id);
                None
            }
        }
    }

    pub(crate) fn attach_all(&mut self) -> Vec<Frame> {
        let ids: Vec<SubscriptionId> = self.controllers.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.attach(id)).collect()
    }

    /// Repeats the subscribe request of whichever subscription owns `correlation_id`.
    pub(crate) fn reattach(&mut self, correlation_id: &Uuid) -> Option<Frame> {
        let id = self.by_correlation.remove(correlation_id)?;
        self.attach(id)
    }

    pub(crate) fn on_frame(&mut self, correlation_id: &Uuid, command: TcpCommand, payload: &[u8]) {
        let Some(id) = self.by_correlation.get(correlation_id).copied() else {
            return;
        };
        if let Some(controller) = self.controllers.get_mut(&id) {
            controller.on_frame(command, payload);
        }
        self.purge(id);
    }

    /// Drops a subscription locally and returns the unsubscribe request, if it is
    /// attached to the current connection.
    pub(crate) fn remove(
        &mut self,
        id: SubscriptionId,
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    ) -> Option<Frame> {
        let controller = self.controllers.get_mut(&id)?;
        let frame = controller.unsubscribe_frame();
        controller.drop_with(reason, error);
        self.purge(id);
        frame
    }

    pub(crate) fn ack(&mut self, id: SubscriptionId, event_ids: &[Uuid]) -> Option<Frame> {
        let controller = self.controllers.get_mut(&id)?;
        controller.ack(event_ids).unwrap_or_else(|e| {
            warn!("subscription {id} could not encode ack: {e}");
            None
        })
    }

    pub(crate) fn nak(
        &mut self,
        id: SubscriptionId,
        event_ids: &[Uuid],
        action: NakAction,
        message: Option<String>,
    ) -> Option<Frame> {
        let controller = self.controllers.get_mut(&id)?;
        controller.nak(event_ids, action, message).unwrap_or_else(|e| {
            warn!("subscription {id} could not encode nak: {e}");
            None
        })
    }

    pub(crate) fn on_connection_lost(&mut self) {
        let confirmed = self
            .controllers
            .values()
            .filter(|c| c.state() == SubscriptionState::Confirmed)
            .count();
        if confirmed > 0 {
            debug!("detaching {confirmed} confirmed subscriptions");
        }
        self.by_correlation.clear();
        for controller in self.controllers.values_mut() {
            controller.on_connection_lost();
        }
    }

    pub(crate) fn drop_all(&mut self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        self.by_correlation.clear();
        for (_, mut controller) in self.controllers.drain() {
            controller.drop_with(reason, error.clone());
        }
    }

    fn purge(&mut self, id: SubscriptionId) {
        if self.controllers.get(&id).is_some_and(|c| c.is_dropped()) {
            self.controllers.remove(&id);
            self.by_correlation.retain(|_, owner| *owner != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::{Receiver, bounded, unbounded};

    use crate::protocol::messages::{DropReason, EventRecord, ResolvedIndexedEvent};

    use super::*;

    struct Fixture {
        controller: SubscriptionController,
        events: Receiver<SubscriptionMessage>,
        confirmation: Receiver<ClientResult<Confirmation>>,
    }

    fn persistent(buffer_size: usize) -> Fixture {
        let (events_tx, events) = unbounded();
        let (confirm_tx, confirmation) = bounded(1);
        let request = SubscriptionRequest {
            stream: "orders".to_string(),
            resolve_link_tos: false,
            credentials: None,
            kind: SubscriptionKind::Persistent {
                group: "billing".to_string(),
                buffer_size,
            },
        };
        Fixture {
            controller: SubscriptionController::new(
                SubscriptionId::next(),
                request,
                events_tx,
                confirm_tx,
            ),
            events,
            confirmation,
        }
    }

    fn appeared(number: i64) -> (Uuid, Vec<u8>) {
        let id = Uuid::new_v4();
        let payload = encode_payload(&PersistentSubscriptionStreamEventAppeared {
            event: ResolvedIndexedEvent {
                event: Some(EventRecord {
                    event_stream_id: "orders".to_string(),
                    event_number: number,
                    event_id: id.into_bytes(),
                    event_type: "OrderPlaced".to_string(),
                    is_json: true,
                    data: b"{}".to_vec(),
                    metadata: vec![],
                    created_epoch: None,
                }),
                link: None,
            },
            retry_count: Some(0),
        })
        .unwrap();
        (id, payload)
    }

    fn confirm(controller: &mut SubscriptionController) {
        let payload = encode_payload(&PersistentSubscriptionConfirmation {
            last_commit_position: 100,
            subscription_id: "orders::billing".to_string(),
            last_event_number: Some(4),
        })
        .unwrap();
        controller.on_frame(TcpCommand::PersistentSubscriptionConfirmation, &payload);
    }

    fn delivered(events: &Receiver<SubscriptionMessage>) -> Vec<i64> {
        events
            .try_iter()
            .filter_map(|message| match message {
                SubscriptionMessage::Event(event) => Some(event.original_event_number()),
                SubscriptionMessage::Dropped { .. } => None,
            })
            .collect()
    }

    #[test]
    fn confirmation_resolves_subscribe() {
        let mut fixture = persistent(10);
        let frame = fixture.controller.subscribe_frame().unwrap();
        assert_eq!(
            frame.tcp_command(),
            Some(TcpCommand::ConnectToPersistentSubscription)
        );
        let request: ConnectToPersistentSubscription = decode_payload(&frame.payload).unwrap();
        assert_eq!(request.allowed_in_flight_messages, 10);

        confirm(&mut fixture.controller);
        assert_eq!(fixture.controller.state(), SubscriptionState::Confirmed);
        let confirmation = fixture.confirmation.try_recv().unwrap().unwrap();
        assert_eq!(confirmation.subscription_id.as_deref(), Some("orders::billing"));
        assert_eq!(confirmation.last_event_number, Some(4));
    }

    #[test]
    fn full_buffer_holds_events_until_ack() {
        let mut fixture = persistent(2);
        fixture.controller.subscribe_frame().unwrap();
        confirm(&mut fixture.controller);

        let mut ids = vec![];
        for number in 0..4 {
            let (id, payload) = appeared(number);
            ids.push(id);
            fixture
                .controller
                .on_frame(TcpCommand::PersistentSubscriptionStreamEventAppeared, &payload);
        }
        assert_eq!(delivered(&fixture.events), vec![0, 1]);

        let ack = fixture.controller.ack(&ids[..1]).unwrap().unwrap();
        assert_eq!(
            ack.tcp_command(),
            Some(TcpCommand::PersistentSubscriptionAckEvents)
        );
        let ack: PersistentSubscriptionAckEvents = decode_payload(&ack.payload).unwrap();
        assert_eq!(ack.subscription_id, "orders::billing");
        assert_eq!(ack.processed_event_ids, vec![ids[0].into_bytes()]);
        assert_eq!(delivered(&fixture.events), vec![2]);

        let nak = fixture
            .controller
            .nak(&ids[1..3], NakAction::Retry, Some("busy".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(
            nak.tcp_command(),
            Some(TcpCommand::PersistentSubscriptionNakEvents)
        );
        assert_eq!(delivered(&fixture.events), vec![3]);
    }

    #[test]
    fn reconnect_resets_in_flight_accounting() {
        let mut fixture = persistent(1);
        let first = fixture.controller.subscribe_frame().unwrap();
        confirm(&mut fixture.controller);
        for number in 0..2 {
            let (_, payload) = appeared(number);
            fixture
                .controller
                .on_frame(TcpCommand::PersistentSubscriptionStreamEventAppeared, &payload);
        }
        assert_eq!(delivered(&fixture.events), vec![0]);

        fixture.controller.on_connection_lost();
        assert_eq!(fixture.controller.state(), SubscriptionState::Pending);
        let second = fixture.controller.subscribe_frame().unwrap();
        assert_ne!(first.correlation_id, second.correlation_id);
        confirm(&mut fixture.controller);

        // The server redelivers the unacknowledged event.
        let (_, payload) = appeared(0);
        fixture
            .controller
            .on_frame(TcpCommand::PersistentSubscriptionStreamEventAppeared, &payload);
        assert_eq!(delivered(&fixture.events), vec![0]);
    }

    #[test]
    fn server_drop_fails_pending_subscribe() {
        let mut fixture = persistent(10);
        fixture.controller.subscribe_frame().unwrap();
        let payload = encode_payload(&SubscriptionDropped {
            reason: DropReason::NotFound,
        })
        .unwrap();
        fixture
            .controller
            .on_frame(TcpCommand::SubscriptionDropped, &payload);

        assert!(fixture.controller.is_dropped());
        assert!(matches!(
            fixture.confirmation.try_recv().unwrap(),
            Err(ClientError::SubscriptionDropped(SubscriptionDropReason::NotFound))
        ));
        assert!(matches!(
            fixture.events.try_recv().unwrap(),
            SubscriptionMessage::Dropped {
                reason: SubscriptionDropReason::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn registry_routes_by_correlation_and_purges_dropped() {
        let fixture = persistent(10);
        let id = fixture.controller.id();
        let mut registry = SubscriptionRegistry::new();
        registry.insert(fixture.controller);

        let frames = registry.attach_all();
        assert_eq!(frames.len(), 1);
        let correlation_id = frames[0].correlation_id;
        assert!(registry.owns(&correlation_id));

        let unsubscribe = registry
            .remove(id, SubscriptionDropReason::Unsubscribed, None)
            .unwrap();
        assert_eq!(
            unsubscribe.tcp_command(),
            Some(TcpCommand::UnsubscribeFromStream)
        );
        assert_eq!(unsubscribe.correlation_id, correlation_id);
        assert!(!registry.owns(&correlation_id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn overflowing_backlog_drops_the_subscription() {
        let mut fixture = persistent(2);
        fixture.controller.subscribe_frame().unwrap();
        confirm(&mut fixture.controller);

        // Two in flight, two held, the fifth is more than the server was allowed.
        for number in 0..5 {
            let (_, payload) = appeared(number);
            fixture
                .controller
                .on_frame(TcpCommand::PersistentSubscriptionStreamEventAppeared, &payload);
        }

        assert!(fixture.controller.is_dropped());
        let messages: Vec<SubscriptionMessage> = fixture.events.try_iter().collect();
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[2],
            SubscriptionMessage::Dropped {
                reason: SubscriptionDropReason::ServerError,
                error: Some(ClientError::ServerError(_)),
            }
        ));
    }
}
