use std::io::{self, ErrorKind, Read, Write};

use log::trace;
use thiserror::Error;

use super::{Request, request::RequestError};

/// Size of the big-endian length prefix in front of every frame.
pub const HEADER_LEN: usize = 4;

/// Largest payload either side is willing to allocate for.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when a read timed out before any byte of a frame arrived.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Io(e) => is_timeout_kind(e.kind()),
            _ => false,
        }
    }
}

fn is_timeout_kind(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Writes `data` as a single length-prefixed frame.
pub fn send<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), TransportError> {
    if data.len() > MAX_FRAME_LEN {
        return Err(TransportError::TooLarge(data.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(data);
    writer.write_all(&frame)?;
    writer.flush()?;

    trace!("sent frame of {} bytes", data.len());
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream before sending anything. A
/// stream that ends part way through a frame is reported as
/// [`TransportError::Truncated`]; callers must treat that as fatal for the
/// connection.
///
/// With a read timeout set on the underlying stream, a timeout that fires before
/// the first header byte is returned as an error for which
/// [`TransportError::is_timeout`] holds. Once a frame has started, timeouts are
/// retried until the frame completes or the peer goes away.
pub fn recv<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError> {
    let mut header = [0u8; HEADER_LEN];
    let received = fill(reader, &mut header, true)?;
    if received == 0 {
        return Ok(None);
    }
    if received < HEADER_LEN {
        return Err(TransportError::Truncated {
            expected: HEADER_LEN,
            received,
        });
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > MAX_FRAME_LEN {
        return Err(TransportError::TooLarge(size));
    }

    let mut data = vec![0u8; size];
    let received = fill(reader, &mut data, false)?;
    if received < size {
        return Err(TransportError::Truncated {
            expected: size,
            received,
        });
    }

    trace!("received frame of {size} bytes");
    Ok(Some(data))
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8], idle: bool) -> Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout_kind(e.kind()) && !(idle && filled == 0) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Framed request/response exchange over a bidirectional stream.
#[derive(Debug)]
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        let bytes = req.to_vec()?;
        send(&mut self.stream, &bytes)
    }

    pub fn read_request(&mut self) -> Result<Option<Request>, TransportError> {
        match recv(&mut self.stream)? {
            Some(bytes) => Ok(Some(Request::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_payload(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        recv(&mut self.stream)
    }
}
