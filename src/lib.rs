pub mod connection;
pub mod event;
pub mod protocol;
pub mod settings;
pub mod subscription;

mod client;
mod error;

#[cfg(test)]
mod test_support;

pub use client::{Client, Transaction};
pub use connection::{ClientEvent, ConnectionState, Endpoint};
pub use error::{ClientError, ClientResult};
pub use event::{
    DeleteResult, EventData, EventReadResult, EventReadStatus, ExpectedVersion, Position,
    ReadDirection, RecordedEvent, ResolvedEvent, SliceReadStatus, StreamEventsSlice, WriteResult,
};
pub use protocol::Credentials;
pub use settings::{ConnectionSettings, ConnectionString};
