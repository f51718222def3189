use std::{
    fmt, io, mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{config::ServerConfig, sync::lock, thread::WorkerGroup};

use super::{Decode, DecodeResult, DecoderFactory, Interrupt, PendingTask};

/// Fixed-size pool of decode workers fed by one task queue.
pub struct ReaderPool {
    group: WorkerGroup,
    interrupts: Arc<Mutex<Vec<Interrupt>>>,
}

impl ReaderPool {
    /// Starts `config.readers` workers. Each builds its decoder with `factory`,
    /// waits out `config.reader_delay`, then serves `tasks` until stopped.
    pub fn spawn(
        config: &ServerConfig,
        factory: DecoderFactory,
        tasks: Receiver<PendingTask>,
        results: Sender<DecodeResult>,
    ) -> io::Result<Self> {
        let tasks = Arc::new(Mutex::new(tasks));
        let interrupts: Arc<Mutex<Vec<Interrupt>>> = Arc::default();
        let poll = config.poll_interval;
        let delay = config.reader_delay;

        let shared = Arc::clone(&interrupts);
        let group = WorkerGroup::spawn("reader", config.readers, move |id, running| {
            let reader = Reader {
                id,
                tasks: &tasks,
                results: &results,
                interrupts: &shared,
                poll,
            };
            reader.run(&factory, running, delay);
        })?;

        info!("started {} reader(s)", group.size());
        Ok(Self { group, interrupts })
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Signals every worker, interrupts decodes that support it, and joins them.
    ///
    /// Child processes are killed, so a hung decode cannot hold the join up. An
    /// in-process decode already under way finishes first.
    pub fn stop(&mut self) {
        self.group.halt();

        let interrupts = mem::take(&mut *lock(&self.interrupts));
        if !interrupts.is_empty() {
            debug!("interrupting {} decoder(s)", interrupts.len());
        }
        for interrupt in &interrupts {
            interrupt();
        }

        self.group.stop();
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ReaderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPool")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

struct Reader<'a> {
    id: usize,
    tasks: &'a Mutex<Receiver<PendingTask>>,
    results: &'a Sender<DecodeResult>,
    interrupts: &'a Mutex<Vec<Interrupt>>,
    poll: Duration,
}

impl Reader<'_> {
    fn run(&self, factory: &DecoderFactory, running: &AtomicBool, delay: Duration) {
        let start = Instant::now() + delay;
        while running.load(Ordering::SeqCst) && Instant::now() < start {
            thread::sleep(self.poll.min(start.saturating_duration_since(Instant::now())));
        }

        let mut decoder: Option<Box<dyn Decode>> = None;
        while running.load(Ordering::SeqCst) {
            if decoder.is_none() {
                match factory(self.id) {
                    Ok(built) => {
                        if let Some(interrupt) = built.interrupter() {
                            // Checked under the lock so `stop` cannot miss it.
                            let mut interrupts = lock(self.interrupts);
                            if !running.load(Ordering::SeqCst) {
                                break;
                            }
                            interrupts.push(interrupt);
                        }
                        decoder = Some(built);
                    }
                    Err(e) => {
                        error!("reader {} failed to start its decoder: {e}", self.id);
                        thread::sleep(self.poll);
                        continue;
                    }
                }
            }

            let task = match lock(self.tasks).recv_timeout(self.poll) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if let Some(current) = decoder.as_mut() {
                if !self.handle(&mut **current, task) {
                    break;
                }
            }
        }
    }

    /// Decodes one task. Returns `false` once nobody is listening for results.
    fn handle(&self, decoder: &mut dyn Decode, task: PendingTask) -> bool {
        let started = Instant::now();

        match decoder.decode(&task.path, task.tarinfo.as_ref()) {
            Ok(payload) => {
                debug!(
                    "reader {} decoded {} for {} in {:?}",
                    self.id,
                    task.path,
                    task.connection,
                    started.elapsed()
                );
                let result = DecodeResult {
                    connection: task.connection,
                    path: task.path,
                    payload,
                };
                self.results.send(result).is_ok()
            }
            Err(e) => {
                warn!(
                    "reader {} dropped {} for {}: {e}",
                    self.id, task.path, task.connection
                );
                true
            }
        }
    }
}
