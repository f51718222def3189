use std::{
    ffi::OsString,
    io::{BufReader, Read, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex},
};

use bincode::Encode;
use log::{debug, info, warn};
use serde_json::Value;

use crate::{protocol::transport, sync::lock};

use super::{Decode, DecodeError, DecoderFactory, Interrupt, wire_config};

/// Task sent to a reader process. `tarinfo` travels as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Encode, bincode::Decode)]
pub struct WorkerTask {
    pub path: String,
    pub tarinfo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, bincode::Decode)]
pub enum WorkerReply {
    Payload(Vec<u8>),
    Failed(String),
}

/// Child handle shared with the decoder's [`Interrupt`]. Once halted, no new
/// child is started.
#[derive(Debug, Default)]
struct Slot {
    child: Option<Child>,
    halted: bool,
}

#[derive(Debug)]
struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Decoder that runs each decode in a child process.
///
/// The child is started lazily and speaks length-prefixed bincode on its
/// stdin/stdout (see [`run_worker`]). When the child dies the current decode
/// fails and the next one starts a fresh process.
///
/// The [`Interrupt`] from [`Decode::interrupter`] kills the child from another
/// thread, which ends a decode blocked on the child's reply.
#[derive(Debug)]
pub struct ProcessDecoder {
    program: PathBuf,
    args: Vec<OsString>,
    slot: Arc<Mutex<Slot>>,
    pipes: Option<Pipes>,
}

impl ProcessDecoder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            slot: Arc::default(),
            pipes: None,
        }
    }

    /// OS pid of the current child, if one is running.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.slot).child.as_ref().map(Child::id)
    }

    fn pipes(&mut self) -> Result<&mut Pipes, DecodeError> {
        if self.pipes.is_none() {
            let mut slot = lock(&self.slot);
            if slot.halted {
                return Err(DecodeError::Stopped);
            }

            let mut child = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()?;
            info!("started reader process {}", child.id());

            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            slot.child = Some(child);
            if let (Some(stdin), Some(stdout)) = (stdin, stdout) {
                self.pipes = Some(Pipes {
                    stdin,
                    stdout: BufReader::new(stdout),
                });
            }
        }

        self.pipes.as_mut().ok_or(DecodeError::WorkerExited)
    }

    fn exchange(&mut self, frame: &[u8]) -> Result<WorkerReply, DecodeError> {
        let pipes = self.pipes()?;
        transport::send(&mut pipes.stdin, frame)?;

        match transport::recv(&mut pipes.stdout)? {
            Some(bytes) => {
                let (reply, _) = bincode::decode_from_slice(&bytes, wire_config())?;
                Ok(reply)
            }
            None => Err(DecodeError::WorkerExited),
        }
    }

    fn reap(&mut self) {
        self.pipes = None;
        let child = lock(&self.slot).child.take();

        if let Some(mut child) = child {
            let pid = child.id();
            let _ = child.kill();
            match child.wait() {
                Ok(status) => debug!("reader process {pid} exited: {status}"),
                Err(e) => warn!("failed to reap reader process {pid}: {e}"),
            }
        }
    }
}

fn halt(slot: &Mutex<Slot>) {
    let mut slot = lock(slot);
    slot.halted = true;

    if let Some(child) = slot.child.as_mut() {
        debug!("killing reader process {}", child.id());
        if let Err(e) = child.kill() {
            warn!("failed to kill reader process {}: {e}", child.id());
        }
    }
}

impl Decode for ProcessDecoder {
    fn decode(&mut self, path: &str, tarinfo: Option<&Value>) -> Result<Vec<u8>, DecodeError> {
        let task = WorkerTask {
            path: path.to_string(),
            tarinfo: tarinfo.map(|info| info.to_string()),
        };
        let frame = bincode::encode_to_vec(task, wire_config())?;

        match self.exchange(&frame) {
            Ok(WorkerReply::Payload(payload)) => Ok(payload),
            Ok(WorkerReply::Failed(reason)) => Err(DecodeError::Failed(reason)),
            Err(e) => {
                self.reap();
                Err(e)
            }
        }
    }

    fn interrupter(&self) -> Option<Interrupt> {
        let slot = Arc::clone(&self.slot);
        Some(Arc::new(move || halt(&slot)))
    }
}

impl Drop for ProcessDecoder {
    fn drop(&mut self) {
        self.reap();
    }
}

/// Factory that gives every reader its own `program args...` child.
pub fn process_factory(program: PathBuf, args: Vec<OsString>) -> DecoderFactory {
    Arc::new(move |_: usize| -> Result<Box<dyn Decode>, DecodeError> {
        Ok(Box::new(ProcessDecoder::new(program.clone(), args.clone())))
    })
}

/// Child side of [`ProcessDecoder`]: answers framed tasks until `input` closes.
///
/// Decode failures are reported back as [`WorkerReply::Failed`] and do not end
/// the loop.
pub fn run_worker<D, R, W>(decoder: &mut D, mut input: R, mut output: W) -> Result<(), DecodeError>
where
    D: Decode + ?Sized,
    R: Read,
    W: Write,
{
    while let Some(bytes) = transport::recv(&mut input)? {
        let (task, _): (WorkerTask, _) = bincode::decode_from_slice(&bytes, wire_config())?;

        let reply = match decode_task(decoder, &task) {
            Ok(payload) => WorkerReply::Payload(payload),
            Err(e) => {
                warn!("failed to decode {}: {e}", task.path);
                WorkerReply::Failed(e.to_string())
            }
        };

        let frame = bincode::encode_to_vec(reply, wire_config())?;
        transport::send(&mut output, &frame)?;
    }

    debug!("reader input closed");
    Ok(())
}

fn decode_task<D: Decode + ?Sized>(decoder: &mut D, task: &WorkerTask) -> Result<Vec<u8>, DecodeError> {
    let tarinfo = match &task.tarinfo {
        Some(text) => Some(serde_json::from_str::<Value>(text)?),
        None => None,
    };
    decoder.decode(&task.path, tarinfo.as_ref())
}
