use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
};

use crate::{cache::LruCache, config::ServerConfig, connection::Registry, reader::PendingTask};

use super::ServerError;

/// Server-wide state, built once per [`ProductServer`](super::ProductServer) and
/// shared by reference with the connector, concierges and publishers.
#[derive(Debug)]
pub(crate) struct ServerContext {
    pub config: ServerConfig,
    pub cache: LruCache,
    pub registry: Registry,
    accepting: AtomicBool,
    tasks: Sender<PendingTask>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, tasks: Sender<PendingTask>) -> Self {
        Self {
            cache: LruCache::new(config.capacity, config.compression),
            registry: Registry::new(),
            accepting: AtomicBool::new(true),
            tasks,
            config,
        }
    }

    /// False once shutdown has begun; connector and concierges wind down.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn submit(&self, task: PendingTask) -> Result<(), ServerError> {
        self.tasks.send(task).map_err(|_| ServerError::QueueClosed)
    }
}
