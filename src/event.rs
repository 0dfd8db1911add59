//! Events and operation results as seen by callers.
//!
//! The wire schemas in [`messages`](crate::protocol::messages) are converted into these
//! types at the edge of the client so that callers work with `Uuid`s and typed enums
//! rather than raw arrays and sentinel integers.
use uuid::Uuid;

use crate::{
    error::{ClientError, ClientResult},
    protocol::messages::{EventRecord, NewEvent, ResolvedIndexedEvent},
};

/// Optimistic concurrency check for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip the check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist, at any version.
    StreamExists,
    /// The last event in the stream must have this number.
    Exact(u64),
}

impl ExpectedVersion {
    /// Wire form. Exact versions above `i64::MAX` have no wire form and are rejected.
    pub fn as_i64(self) -> ClientResult<i64> {
        match self {
            ExpectedVersion::Any => Ok(-2),
            ExpectedVersion::NoStream => Ok(-1),
            ExpectedVersion::StreamExists => Ok(-4),
            ExpectedVersion::Exact(n) => {
                i64::try_from(n).map_err(|_| ClientError::ExpectedVersionOutOfRange(n))
            }
        }
    }
}

/// An event to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl EventData {
    pub fn json(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: data.into(),
            metadata: Vec::new(),
        }
    }

    pub fn binary(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            is_json: false,
            ..Self::json(event_type, data)
        }
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub(crate) fn to_wire(&self) -> NewEvent {
        NewEvent {
            event_id: self.event_id.into_bytes(),
            event_type: self.event_type.clone(),
            is_json: self.is_json,
            data: self.data.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_id: Uuid,
    pub event_number: i64,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub created_epoch: Option<i64>,
}

impl From<EventRecord> for RecordedEvent {
    fn from(value: EventRecord) -> Self {
        Self {
            stream_id: value.event_stream_id,
            event_id: Uuid::from_bytes(value.event_id),
            event_number: value.event_number,
            event_type: value.event_type,
            is_json: value.is_json,
            data: value.data,
            metadata: value.metadata,
            created_epoch: value.created_epoch,
        }
    }
}

/// An event delivered to a reader or subscriber, with the link that pointed at it when
/// link resolution was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    /// The resolved event. For an unresolvable link this is the link record itself.
    pub event: RecordedEvent,
    pub link: Option<RecordedEvent>,
    /// Number of times a persistent subscription has redelivered this event.
    pub retry_count: Option<u32>,
}

impl ResolvedEvent {
    pub(crate) fn from_wire(value: ResolvedIndexedEvent, retry_count: Option<i32>) -> Option<Self> {
        let retry_count = retry_count.map(|n| n.max(0) as u32);
        match (value.event, value.link) {
            (Some(event), link) => Some(Self {
                event: event.into(),
                link: link.map(Into::into),
                retry_count,
            }),
            (None, Some(link)) => {
                let link: RecordedEvent = link.into();
                Some(Self {
                    event: link.clone(),
                    link: Some(link),
                    retry_count,
                })
            }
            (None, None) => None,
        }
    }

    /// The record that was actually read from the stream: the link when one was
    /// followed, otherwise the event.
    pub fn original_event(&self) -> &RecordedEvent {
        self.link.as_ref().unwrap_or(&self.event)
    }

    pub fn original_event_id(&self) -> Uuid {
        self.original_event().event_id
    }

    pub fn original_event_number(&self) -> i64 {
        self.original_event().event_number
    }

    pub fn original_stream_id(&self) -> &str {
        &self.original_event().stream_id
    }
}

/// Position of a write in the server's transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub commit: i64,
    pub prepare: i64,
}

impl Position {
    pub(crate) fn from_wire(commit: Option<i64>, prepare: Option<i64>) -> Self {
        Self {
            commit: commit.unwrap_or(-1),
            prepare: prepare.unwrap_or(-1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub next_expected_version: i64,
    pub log_position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub log_position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// One page of a stream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: i64,
    pub read_direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    pub event_number: i64,
    pub event: Option<ResolvedEvent>,
}
