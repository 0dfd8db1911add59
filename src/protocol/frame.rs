//! Frame encoding and decoding for the wire protocol.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! +--------+---------+-------+----------------+-------------------------+---------+
//! | length | command | flags | correlation id | credentials (optional)  | payload |
//! |   4    |    1    |   1   |       16       | 1 + user + 1 + password |   ...   |
//! +--------+---------+-------+----------------+-------------------------+---------+
//! ```
//!
//! `length` counts every byte after itself. Credentials are present only when the
//! [`FLAG_AUTHENTICATED`] bit is set.
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use super::TcpCommand;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Command, flags and correlation id.
pub const HEADER_SIZE: usize = 18;

/// Largest frame body accepted from a peer (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const FLAG_NONE: u8 = 0x00;
pub const FLAG_AUTHENTICATED: u8 = 0x01;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {len} bytes is shorter than the 18 byte header")]
    TooShort { len: usize },

    #[error("malformed frame: declared length {declared} but {available} bytes available")]
    LengthMismatch { declared: usize, available: usize },

    #[error("malformed frame: length {len} exceeds the 64 MiB limit")]
    Oversized { len: usize },

    #[error("malformed frame: credentials truncated")]
    CredentialsTruncated,

    #[error("malformed frame: credentials are not valid utf-8")]
    CredentialsEncoding,

    #[error("{field} is {len} bytes, credentials fields are limited to 255 bytes")]
    CredentialsTooLong { field: &'static str, len: usize },
}

impl FrameError {
    /// Whether the error came from bytes received from a peer. Those are fatal to the
    /// connection they arrived on.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::CredentialsTooLong { .. })
    }
}

/// Username and password attached to an authenticated frame.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        2 + self.username.len() + self.password.len()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw command code. Kept raw so that unknown commands survive decoding and can be
    /// reported by the router instead of failing the connection.
    pub command: u8,
    pub flags: u8,
    pub correlation_id: Uuid,
    pub credentials: Option<Credentials>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: TcpCommand, correlation_id: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.code(),
            flags: FLAG_NONE,
            correlation_id,
            credentials: None,
            payload: payload.into(),
        }
    }

    /// Frame without payload, e.g. heartbeats and pings.
    pub fn empty(command: TcpCommand, correlation_id: Uuid) -> Self {
        Self::new(command, correlation_id, Bytes::new())
    }

    /// Attaches credentials and keeps the authenticated flag in sync with them.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.flags = match credentials {
            Some(_) => self.flags | FLAG_AUTHENTICATED,
            None => self.flags & !FLAG_AUTHENTICATED,
        };
        self.credentials = credentials;
        self
    }

    pub fn tcp_command(&self) -> Option<TcpCommand> {
        TcpCommand::from_code(self.command)
    }

    pub fn is_authenticated(&self) -> bool {
        self.flags & FLAG_AUTHENTICATED != 0
    }

    /// Value written to the length prefix.
    pub fn encoded_len(&self) -> usize {
        let auth = match &self.credentials {
            Some(credentials) if self.is_authenticated() => credentials.encoded_len(),
            _ => 0,
        };
        HEADER_SIZE + auth + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let credentials = match &self.credentials {
            Some(credentials) if self.is_authenticated() => {
                check_field("username", &credentials.username)?;
                check_field("password", &credentials.password)?;
                Some(credentials)
            }
            _ => None,
        };

        buf.reserve(LENGTH_PREFIX_SIZE + self.encoded_len());
        buf.put_u32_le(self.encoded_len() as u32);
        buf.put_u8(self.command);
        buf.put_u8(self.flags);
        buf.put_slice(self.correlation_id.as_bytes());
        if let Some(credentials) = credentials {
            buf.put_u8(credentials.username.len() as u8);
            buf.put_slice(credentials.username.as_bytes());
            buf.put_u8(credentials.password.len() as u8);
            buf.put_slice(credentials.password.as_bytes());
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode_to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes exactly one frame, length prefix included. The buffer must hold the whole
    /// frame and nothing else.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < LENGTH_PREFIX_SIZE {
            return Err(FrameError::TooShort { len: bytes.len() });
        }
        let mut prefix = &bytes[..LENGTH_PREFIX_SIZE];
        let declared = prefix.get_u32_le() as usize;
        if declared < HEADER_SIZE {
            return Err(FrameError::TooShort { len: declared });
        }

        let available = bytes.len() - LENGTH_PREFIX_SIZE;
        if declared != available {
            return Err(FrameError::LengthMismatch {
                declared,
                available,
            });
        }

        Self::decode_body(Bytes::copy_from_slice(&bytes[LENGTH_PREFIX_SIZE..]))
    }

    /// Decodes a frame body, i.e. everything the length prefix covers.
    pub fn decode_body(mut body: Bytes) -> Result<Self, FrameError> {
        if body.len() < HEADER_SIZE {
            return Err(FrameError::TooShort { len: body.len() });
        }

        let command = body.get_u8();
        let flags = body.get_u8();
        let mut id = [0u8; 16];
        body.copy_to_slice(&mut id);

        let credentials = if flags & FLAG_AUTHENTICATED != 0 {
            let username = read_field(&mut body)?;
            let password = read_field(&mut body)?;
            Some(Credentials { username, password })
        } else {
            None
        };

        Ok(Self {
            command,
            flags,
            correlation_id: Uuid::from_bytes(id),
            credentials,
            payload: body,
        })
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), FrameError> {
    if value.len() > u8::MAX as usize {
        return Err(FrameError::CredentialsTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn read_field(body: &mut Bytes) -> Result<String, FrameError> {
    if !body.has_remaining() {
        return Err(FrameError::CredentialsTruncated);
    }
    let len = body.get_u8() as usize;
    if body.remaining() < len {
        return Err(FrameError::CredentialsTruncated);
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::CredentialsEncoding)
}

/// Accumulates bytes read from a socket and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns `Ok(None)` until a whole frame has been buffered. A prefix that can never
    /// describe a valid frame is an error immediately.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = {
            let mut peek = &self.buf[..LENGTH_PREFIX_SIZE];
            peek.get_u32_le() as usize
        };
        if declared < HEADER_SIZE {
            return Err(FrameError::TooShort { len: declared });
        }
        if declared > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized { len: declared });
        }
        if self.buf.len() < LENGTH_PREFIX_SIZE + declared {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        let body = self.buf.split_to(declared).freeze();
        Frame::decode_body(body).map(Some)
    }
}
