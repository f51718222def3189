use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
    },
};

use log::{debug, info, warn};

use crate::{reader::DecodeResult, sync::lock, thread::WorkerGroup};

use super::{ServerContext, cache_key};

/// Threads that route decode results back to their connections.
///
/// For each result: drop it if the connection has gone away, otherwise cache the
/// payload, write it to the client and release the waiting concierge.
#[derive(Debug)]
pub struct Publisher {
    group: WorkerGroup,
}

impl Publisher {
    pub(crate) fn spawn(
        context: Arc<ServerContext>,
        results: Receiver<DecodeResult>,
    ) -> io::Result<Self> {
        let results = Arc::new(Mutex::new(results));
        let size = context.config.publishers;

        let group = WorkerGroup::spawn("publisher", size, move |id, running| {
            collect(id, &context, &results, running);
        })?;

        info!("started {} publisher(s)", group.size());
        Ok(Self { group })
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn stop(&mut self) {
        self.group.stop();
    }
}

fn collect(
    id: usize,
    context: &ServerContext,
    results: &Mutex<Receiver<DecodeResult>>,
    running: &AtomicBool,
) {
    let poll = context.config.poll_interval;

    while running.load(Ordering::SeqCst) {
        let result = match lock(results).recv_timeout(poll) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        debug!("publisher {id} received {}", result.path);
        deliver(context, result);
    }
}

pub(crate) fn deliver(context: &ServerContext, result: DecodeResult) {
    let key = cache_key(&result.path);

    let Some(connection) = context.registry.get(result.connection) else {
        debug!("discarding {key}, connection {} is gone", result.connection);
        return;
    };

    if let Err(e) = context.cache.put(key, &result.payload) {
        warn!("failed to cache {key}: {e}");
    }

    info!("drive: {key} -> {}", connection.id());
    if let Err(e) = connection.send(&result.payload) {
        warn!("failed to deliver {key} to {}: {e}", connection.id());
    }
    connection.resolve();
}
