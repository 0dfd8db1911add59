//! Outstanding operations.
//!
//! Every request a caller submits becomes one [`Operation`]: the command, its encoded
//! payload, credentials, retry budget and the channel its result is delivered on. The
//! [`OperationTable`] keys in-flight operations by the correlation id of the frame that
//! carried them and keeps operations that are waiting for a connection in submission
//! order.
//!
//! An operation is consumed when it completes or fails, so a result is delivered at most
//! once per operation however many times it was reissued.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    error::{ClientError, ClientResult},
    protocol::{Credentials, Frame, TcpCommand},
};

use super::manager::Message;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an operation across reissues. Correlation ids change per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A reply frame routed back to the operation that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub command: TcpCommand,
    pub payload: Bytes,
}

/// What to do with a reply of the expected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    Complete,
    /// The server could not process the request right now; reissue it.
    Retry,
}

pub type ReplyInspector = fn(&Reply) -> ReplyDecision;

/// Bounded count of operations that are queued or in flight.
#[derive(Debug, Clone)]
pub(crate) struct QueueSlots {
    used: Arc<AtomicUsize>,
    limit: usize,
}

impl QueueSlots {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            used: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub(crate) fn try_acquire(&self) -> ClientResult<QueueSlot> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map_err(|_| ClientError::MaxQueueSizeLimitReached { limit: self.limit })?;
        Ok(QueueSlot {
            used: Arc::clone(&self.used),
        })
    }

    pub(crate) fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// Released when the owning operation is dropped.
#[derive(Debug)]
pub(crate) struct QueueSlot {
    used: Arc<AtomicUsize>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.used.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct Operation {
    pub(crate) id: OperationId,
    pub(crate) command: TcpCommand,
    pub(crate) payload: Bytes,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_count: u32,
    inspector: Option<ReplyInspector>,
    sink: Sender<ClientResult<Reply>>,
    _slot: QueueSlot,
}

impl Operation {
    pub(crate) fn new(
        command: TcpCommand,
        payload: Bytes,
        credentials: Option<Credentials>,
        timeout: Duration,
        max_retries: u32,
        slot: QueueSlot,
    ) -> (Self, Receiver<ClientResult<Reply>>) {
        let (sink, result) = crossbeam::channel::bounded(1);
        let operation = Self {
            id: OperationId::next(),
            command,
            payload,
            credentials,
            timeout,
            max_retries,
            retry_count: 0,
            inspector: None,
            sink,
            _slot: slot,
        };
        (operation, result)
    }

    pub(crate) fn with_inspector(mut self, inspector: Option<ReplyInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub(crate) fn inspect(&self, reply: &Reply) -> ReplyDecision {
        self.inspector
            .map(|inspect| inspect(reply))
            .unwrap_or(ReplyDecision::Complete)
    }

    fn frame(&self, correlation_id: Uuid) -> Frame {
        Frame::new(self.command, correlation_id, self.payload.clone())
            .with_credentials(self.credentials.clone())
    }

    pub(crate) fn complete(self, reply: Reply) {
        trace!("{} completed with {}", self.command, reply.command);
        let _ = self.sink.send(Ok(reply));
    }

    pub(crate) fn fail(self, error: ClientError) {
        debug!("{} failed: {error}", self.command);
        let _ = self.sink.send(Err(error));
    }

    /// Spends one retry, or fails the operation once the budget is gone.
    pub(crate) fn retry_or_fail(mut self, reason: &ClientError) -> Option<Self> {
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            debug!(
                "retrying {} ({}/{}) after: {reason}",
                self.command, self.retry_count, self.max_retries
            );
            Some(self)
        } else {
            let error = ClientError::RetriesLimitReached {
                command: self.command,
                retries: self.max_retries,
            };
            self.fail(error);
            None
        }
    }
}

struct InFlight {
    operation: Operation,
    deadline: Instant,
}

/// Operations in flight on the current connection plus those waiting for one.
#[derive(Default)]
pub(crate) struct OperationTable {
    in_flight: HashMap<Uuid, InFlight>,
    waiting: VecDeque<Operation>,
}

impl OperationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, operation: Operation) {
        self.waiting.push_back(operation);
    }

    /// Puts an operation at the head of the waiting queue.
    pub(crate) fn requeue(&mut self, operation: Operation) {
        self.waiting.push_front(operation);
    }

    pub(crate) fn take_waiting(&mut self) -> VecDeque<Operation> {
        std::mem::take(&mut self.waiting)
    }

    /// Assigns a fresh correlation id and deadline and returns the frame to send.
    pub(crate) fn start(&mut self, operation: Operation, now: Instant) -> Frame {
        let correlation_id = Uuid::new_v4();
        let frame = operation.frame(correlation_id);
        let deadline = now + operation.timeout;
        self.in_flight.insert(
            correlation_id,
            InFlight {
                operation,
                deadline,
            },
        );
        frame
    }

    pub(crate) fn contains(&self, correlation_id: &Uuid) -> bool {
        self.in_flight.contains_key(correlation_id)
    }

    pub(crate) fn take(&mut self, correlation_id: &Uuid) -> Option<Operation> {
        self.in_flight
            .remove(correlation_id)
            .map(|in_flight| in_flight.operation)
    }

    pub(crate) fn complete(&mut self, correlation_id: &Uuid, reply: Reply) -> bool {
        match self.take(correlation_id) {
            Some(operation) => {
                operation.complete(reply);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail(&mut self, correlation_id: &Uuid, error: ClientError) -> bool {
        match self.take(correlation_id) {
            Some(operation) => {
                operation.fail(error);
                true
            }
            None => false,
        }
    }

    /// Fails every in-flight operation whose deadline has passed. Timeouts are final.
    pub(crate) fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for correlation_id in &expired {
            if let Some(operation) = self.take(correlation_id) {
                warn!("{} ({correlation_id}) timed out", operation.command);
                let error = ClientError::OperationTimedOut {
                    command: operation.command,
                    timeout: operation.timeout,
                };
                operation.fail(error);
            }
        }
        expired.len()
    }

    /// Moves everything in flight back to the front of the waiting queue, oldest first,
    /// spending one retry each. Operations without retries left fail. Returns
    /// `(requeued, failed)`.
    pub(crate) fn on_connection_lost(&mut self, reason: &ClientError) -> (usize, usize) {
        let mut lost: Vec<Operation> = self
            .in_flight
            .drain()
            .map(|(_, in_flight)| in_flight.operation)
            .collect();
        lost.sort_by_key(|operation| operation.id);

        let total = lost.len();
        let mut requeued: Vec<Operation> = lost
            .into_iter()
            .filter_map(|operation| operation.retry_or_fail(reason))
            .collect();
        let retried = requeued.len();

        while let Some(operation) = requeued.pop() {
            self.waiting.push_front(operation);
        }
        (retried, total - retried)
    }

    pub(crate) fn cancel(&mut self, id: OperationId) -> bool {
        let in_flight = self
            .in_flight
            .iter()
            .find(|(_, in_flight)| in_flight.operation.id == id)
            .map(|(correlation_id, _)| *correlation_id);
        if let Some(correlation_id) = in_flight {
            return self.fail(&correlation_id, ClientError::Cancelled);
        }

        match self.waiting.iter().position(|operation| operation.id == id) {
            Some(index) => {
                if let Some(operation) = self.waiting.remove(index) {
                    operation.fail(ClientError::Cancelled);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_all(&mut self, error: ClientError) {
        for (_, in_flight) in self.in_flight.drain() {
            in_flight.operation.fail(error.clone());
        }
        for operation in self.waiting.drain(..) {
            operation.fail(error.clone());
        }
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}

/// Result of a submitted operation, delivered when its reply is routed back.
pub struct PendingReply {
    id: OperationId,
    command: TcpCommand,
    result: Receiver<ClientResult<Reply>>,
    control: Sender<Message>,
}

impl PendingReply {
    pub(crate) fn new(
        id: OperationId,
        command: TcpCommand,
        result: Receiver<ClientResult<Reply>>,
        control: Sender<Message>,
    ) -> Self {
        Self {
            id,
            command,
            result,
            control,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn command(&self) -> TcpCommand {
        self.command
    }

    /// Blocks until the operation completes, fails or times out.
    pub fn wait(self) -> ClientResult<Reply> {
        self.result
            .recv()
            .unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Like [`wait`](Self::wait), giving up locally after `timeout`. `None` means the
    /// operation is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ClientResult<Reply>> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(ClientError::ConnectionClosed)),
        }
    }

    pub fn try_result(&self) -> Option<ClientResult<Reply>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ClientError::ConnectionClosed)),
        }
    }

    /// Removes the operation from the table and frees its queue slot. The server may
    /// still have processed the request.
    pub fn cancel(self) {
        let _ = self.control.send(Message::Cancel(self.id));
    }
}
