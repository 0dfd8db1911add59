//! Payload schemas carried behind the frame header.
//!
//! Every request and reply payload is a `bincode` encoded struct. Integers are little
//! endian with fixed width so that the payload follows the same conventions as the frame
//! header. Identifiers that are UUIDs on the server side travel as raw 16 byte arrays.
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};

use super::TransportError;

pub(crate) fn payload_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Serializes a payload struct.
pub fn encode_payload<T: Encode>(message: &T) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::encode_to_vec(message, payload_config())?)
}

/// Deserializes a payload struct. Trailing bytes are rejected.
pub fn decode_payload<T: Decode<()>>(bytes: &[u8]) -> Result<T, TransportError> {
    let (message, read) = bincode::decode_from_slice(bytes, payload_config())?;
    if read != bytes.len() {
        return Err(TransportError::TrailingBytes {
            expected: read,
            actual: bytes.len(),
        });
    }
    Ok(message)
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum OperationResult {
    Success,
    PrepareTimeout,
    CommitTimeout,
    ForwardTimeout,
    WrongExpectedVersion,
    StreamDeleted,
    InvalidTransaction,
    AccessDenied,
}

impl OperationResult {
    /// Results the server reports when a write could not be confirmed in time. The write
    /// is safe to reissue.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            OperationResult::PrepareTimeout
                | OperationResult::CommitTimeout
                | OperationResult::ForwardTimeout
        )
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct NewEvent {
    pub event_id: [u8; 16],
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct EventRecord {
    pub event_stream_id: String,
    pub event_number: i64,
    pub event_id: [u8; 16],
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub created_epoch: Option<i64>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ResolvedIndexedEvent {
    pub event: Option<EventRecord>,
    pub link: Option<EventRecord>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WriteEvents {
    pub event_stream_id: String,
    pub expected_version: i64,
    pub events: Vec<NewEvent>,
    pub require_master: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WriteEventsCompleted {
    pub result: OperationResult,
    pub message: Option<String>,
    pub first_event_number: i64,
    pub last_event_number: i64,
    pub prepare_position: Option<i64>,
    pub commit_position: Option<i64>,
    pub current_version: Option<i64>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct DeleteStream {
    pub event_stream_id: String,
    pub expected_version: i64,
    pub require_master: bool,
    pub hard_delete: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct DeleteStreamCompleted {
    pub result: OperationResult,
    pub message: Option<String>,
    pub prepare_position: Option<i64>,
    pub commit_position: Option<i64>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TransactionStart {
    pub event_stream_id: String,
    pub expected_version: i64,
    pub require_master: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TransactionStartCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TransactionWrite {
    pub transaction_id: i64,
    pub events: Vec<NewEvent>,
    pub require_master: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TransactionWriteCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TransactionCommit {
    pub transaction_id: i64,
    pub require_master: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct TransactionCommitCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: Option<String>,
    pub first_event_number: i64,
    pub last_event_number: i64,
    pub prepare_position: Option<i64>,
    pub commit_position: Option<i64>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ReadEvent {
    pub event_stream_id: String,
    pub event_number: i64,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ReadEventResult {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
    Error,
    AccessDenied,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ReadEventCompleted {
    pub result: ReadEventResult,
    pub event: Option<ResolvedIndexedEvent>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ReadStreamEvents {
    pub event_stream_id: String,
    pub from_event_number: i64,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ReadStreamResult {
    Success,
    NoStream,
    StreamDeleted,
    NotModified,
    Error,
    AccessDenied,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ReadStreamEventsCompleted {
    pub events: Vec<ResolvedIndexedEvent>,
    pub result: ReadStreamResult,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
    pub last_commit_position: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct SubscribeToStream {
    pub event_stream_id: String,
    pub resolve_link_tos: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct SubscriptionConfirmation {
    pub last_commit_position: i64,
    pub last_event_number: Option<i64>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct StreamEventAppeared {
    pub event: ResolvedIndexedEvent,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum DropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    SubscriberMaxCountReached,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct SubscriptionDropped {
    pub reason: DropReason,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ConsumerStrategy {
    DispatchToSingle,
    RoundRobin,
    Pinned,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct PersistentSubscriptionConfig {
    pub resolve_link_tos: bool,
    pub start_from: i64,
    pub message_timeout_ms: i32,
    pub record_statistics: bool,
    pub live_buffer_size: i32,
    pub read_batch_size: i32,
    pub buffer_size: i32,
    pub max_retry_count: i32,
    pub checkpoint_after_ms: i32,
    pub checkpoint_min_count: i32,
    pub checkpoint_max_count: i32,
    pub subscriber_max_count: i32,
    pub consumer_strategy: ConsumerStrategy,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct CreatePersistentSubscription {
    pub group_name: String,
    pub event_stream_id: String,
    pub config: PersistentSubscriptionConfig,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum CreatePersistentSubscriptionResult {
    Success,
    AlreadyExists,
    Fail,
    AccessDenied,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct CreatePersistentSubscriptionCompleted {
    pub result: CreatePersistentSubscriptionResult,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct UpdatePersistentSubscription {
    pub group_name: String,
    pub event_stream_id: String,
    pub config: PersistentSubscriptionConfig,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum UpdatePersistentSubscriptionResult {
    Success,
    DoesNotExist,
    Fail,
    AccessDenied,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct UpdatePersistentSubscriptionCompleted {
    pub result: UpdatePersistentSubscriptionResult,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct DeletePersistentSubscription {
    pub group_name: String,
    pub event_stream_id: String,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum DeletePersistentSubscriptionResult {
    Success,
    DoesNotExist,
    Fail,
    AccessDenied,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct DeletePersistentSubscriptionCompleted {
    pub result: DeletePersistentSubscriptionResult,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ConnectToPersistentSubscription {
    pub group_name: String,
    pub event_stream_id: String,
    pub allowed_in_flight_messages: i32,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct PersistentSubscriptionConfirmation {
    pub last_commit_position: i64,
    pub subscription_id: String,
    pub last_event_number: Option<i64>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct PersistentSubscriptionStreamEventAppeared {
    pub event: ResolvedIndexedEvent,
    pub retry_count: Option<i32>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct PersistentSubscriptionAckEvents {
    pub subscription_id: String,
    pub processed_event_ids: Vec<[u8; 16]>,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum NakAction {
    Unknown,
    Park,
    Retry,
    Skip,
    Stop,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct PersistentSubscriptionNakEvents {
    pub subscription_id: String,
    pub processed_event_ids: Vec<[u8; 16]>,
    pub message: Option<String>,
    pub action: NakAction,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum NotHandledReason {
    NotReady,
    TooBusy,
    NotMaster,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct MasterInfo {
    pub external_tcp_address: String,
    pub external_tcp_port: i32,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct NotHandled {
    pub reason: NotHandledReason,
    pub master_info: Option<MasterInfo>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct IdentifyClient {
    pub version: i32,
    pub connection_name: Option<String>,
}
