//! Decode workers.
//!
//! Decoding a sweep is the expensive step the whole server exists to avoid. The
//! [`Decode`] trait is the boundary to whatever actually parses an archive; this
//! crate never looks inside the bytes it returns.
//!
//! # Overview
//!
//! - [`ReaderPool`] runs a fixed number of workers. Each one takes a
//!   [`PendingTask`] off the shared task queue, decodes it, and pushes a
//!   [`DecodeResult`] onto the result queue for the publishers.
//! - Each worker owns its own decoder, built by a [`DecoderFactory`].
//! - [`ProcessDecoder`] forwards every task to a child process, so a decoder that
//!   crashes or leaks only takes its own process down. The child side runs
//!   [`run_worker`]. Stopping the pool kills these children, so a hung decode
//!   never holds up shutdown.
//! - [`FileDecoder`] is the reference decoder: it reads the file, or the archive
//!   members named by `tarinfo`, and packs them into a [`Sweep`].
//!
//! A decode that fails is logged and dropped. No result is produced for it.
mod file;
mod pool;
mod process;
mod sweep;

use std::{io, sync::Arc};

use bincode::config::{BigEndian, Configuration, Fixint};
use serde_json::Value;
use thiserror::Error;

use crate::{connection::ConnectionId, protocol::TransportError};

pub use file::FileDecoder;
pub use pool::ReaderPool;
pub use process::{ProcessDecoder, WorkerReply, WorkerTask, process_factory, run_worker};
pub use sweep::{Sweep, SweepMember};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read sweep: {0}")]
    Io(#[from] io::Error),
    #[error("invalid tarinfo: {0}")]
    Tarinfo(#[from] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("reader transport: {0}")]
    Transport(#[from] TransportError),
    #[error("reader process exited")]
    WorkerExited,
    #[error("reader stopped")]
    Stopped,
    #[error("{0}")]
    Failed(String),
}

/// Turns a sweep path (plus optional archive member info) into payload bytes.
pub trait Decode: Send {
    fn decode(&mut self, path: &str, tarinfo: Option<&Value>) -> Result<Vec<u8>, DecodeError>;

    /// Hook that aborts a decode running on another thread, for decoders whose
    /// work can be cut short. Later decodes fail with [`DecodeError::Stopped`].
    fn interrupter(&self) -> Option<Interrupt> {
        None
    }
}

impl<D: Decode + ?Sized> Decode for Box<D> {
    fn decode(&mut self, path: &str, tarinfo: Option<&Value>) -> Result<Vec<u8>, DecodeError> {
        (**self).decode(path, tarinfo)
    }

    fn interrupter(&self) -> Option<Interrupt> {
        (**self).interrupter()
    }
}

/// See [`Decode::interrupter`].
pub type Interrupt = Arc<dyn Fn() + Send + Sync>;

/// Builds the decoder for the reader with the given index.
pub type DecoderFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn Decode>, DecodeError> + Send + Sync>;

/// A cache miss waiting for a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub connection: ConnectionId,
    pub path: String,
    pub tarinfo: Option<Value>,
}

/// A decoded payload on its way back to `connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeResult {
    pub connection: ConnectionId,
    pub path: String,
    pub payload: Vec<u8>,
}

pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}
