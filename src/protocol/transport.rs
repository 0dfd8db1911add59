use std::io::{self, Read, Write};

use bytes::BytesMut;
use thiserror::Error;

use super::{Frame, FrameError, FrameReader};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode payload: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode payload: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("payload has trailing bytes: decoded {expected} of {actual}")]
    TrailingBytes { expected: usize, actual: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed by peer")]
    Closed,
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Malformed input from the peer, as opposed to a socket failure.
    pub fn is_malformed(&self) -> bool {
        matches!(self, TransportError::Frame(e) if e.is_malformed())
    }
}

/// Frame level reader/writer over any byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    reader: FrameReader,
    scratch: Box<[u8]>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            reader: FrameReader::new(),
            scratch: vec![0u8; 16 * 1024].into_boxed_slice(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len() + 4);
        frame.encode(&mut buf)?;
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocks until one whole frame has been read.
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self.reader.next_frame()? {
                return Ok(frame);
            }

            let n = self.stream.read(&mut self.scratch)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.reader.extend(&self.scratch[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use uuid::Uuid;

    use crate::protocol::{Credentials, TcpCommand};

    use super::*;

    #[test]
    fn read_write_frame() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let frame = Frame::new(TcpCommand::WriteEvents, Uuid::new_v4(), &b"body"[..])
            .with_credentials(Some(Credentials::new("admin", "changeit")));

        transport.write_frame(&frame).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let read = transport.read_frame().unwrap();
        assert_eq!(read, frame);
    }

    #[test]
    fn read_several_frames() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let ping = Frame::empty(TcpCommand::Ping, Uuid::new_v4());
        let pong = Frame::empty(TcpCommand::Pong, ping.correlation_id);

        transport.write_frame(&ping).unwrap();
        transport.write_frame(&pong).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_frame().unwrap(), ping);
        assert_eq!(transport.read_frame().unwrap(), pong);
        assert!(matches!(transport.read_frame(), Err(TransportError::Closed)));
    }

    #[test]
    fn malformed_input_is_flagged() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0]);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        let err = transport.read_frame().unwrap_err();
        assert!(err.is_malformed());
    }
}
