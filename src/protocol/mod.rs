//! Client-server communication protocol.
//!
//! This module defines the binary protocol spoken between the client and the event store:
//! the frame format, the command table and the payload schemas. It is stateless; the
//! [`connection`](crate::connection) layer owns sockets and correlation.
//!
//! # Overview
//!
//! Every exchange is a [`Frame`]: a length prefixed header naming a [`TcpCommand`], a set
//! of flags, a 16 byte correlation id that pairs requests with replies, optional
//! credentials and a payload. Payloads are the `bincode` encoded structs found in
//! [`messages`].
//!
//! # Key Components
//!
//! - [`Frame`] / [`FrameReader`]: the wire codec.
//! - [`TcpCommand`]: command codes and the reply each request expects.
//! - [`ProtocolTransport`]: frame reader/writer over a bidirectional byte stream.
//!
//! # Binary Format
//!
//! - A 4 byte little-endian length counts everything that follows it.
//! - Command (1 byte), flags (1 byte) and correlation id (16 bytes) follow.
//! - When the authenticated flag is set, length prefixed username and password follow.
//! - The remainder is the payload, possibly empty.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): Sends frames and routes replies.
mod command;
mod frame;
pub mod messages;
mod transport;

pub use command::{CommandDescriptor, DESCRIPTORS, TcpCommand};
pub use frame::{
    Credentials, FLAG_AUTHENTICATED, FLAG_NONE, Frame, FrameError, FrameReader, HEADER_SIZE,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
pub use messages::{decode_payload, encode_payload};
pub use transport::{ProtocolTransport, TransportError};
