use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::{debug, error};

/// Fixed set of named threads sharing one running flag.
///
/// Each thread runs the same loop body, which is handed its index and the flag
/// and is expected to return soon after the flag clears. Dropping the group
/// stops it.
#[derive(Debug)]
pub(crate) struct WorkerGroup {
    name: &'static str,
    running: Arc<AtomicBool>,
    workers: Vec<Worker>,
}

impl WorkerGroup {
    pub fn spawn<F>(name: &'static str, size: usize, body: F) -> io::Result<Self>
    where
        F: Fn(usize, &AtomicBool) + Send + Sync + 'static,
    {
        assert!(size > 0);

        let running = Arc::new(AtomicBool::new(true));
        let body = Arc::new(body);
        let mut group = Self {
            name,
            running,
            workers: Vec::with_capacity(size),
        };

        for id in 0..size {
            let worker = Worker::new(name, id, Arc::clone(&group.running), Arc::clone(&body));
            match worker {
                Ok(worker) => group.workers.push(worker),
                Err(e) => {
                    group.stop();
                    return Err(e);
                }
            }
        }

        Ok(group)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Clears the running flag without waiting for the threads.
    pub fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Clears the running flag and joins every thread.
    pub fn stop(&mut self) {
        self.halt();

        for worker in self.workers.drain(..) {
            debug!("shutting down {}[{}]", self.name, worker.id);

            if worker.thread.join().is_err() {
                error!("{}[{}] panicked", self.name, worker.id);
            }
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new<F>(name: &str, id: usize, running: Arc<AtomicBool>, body: Arc<F>) -> io::Result<Self>
    where
        F: Fn(usize, &AtomicBool) + Send + Sync + 'static,
    {
        let thread = thread::Builder::new()
            .name(format!("{name}[{id}]"))
            .spawn(move || {
                debug!("worker {id} started");
                body(id, &running);
                debug!("worker {id} stopped");
            })?;

        Ok(Self { id, thread })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use super::*;

    #[test]
    fn stop_joins_every_worker() {
        let loops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loops);
        let mut group = WorkerGroup::spawn("test", 3, move |_, running| {
            while running.load(Ordering::SeqCst) {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        assert_eq!(group.size(), 3);
        thread::sleep(Duration::from_millis(20));
        group.stop();

        assert!(!group.running.load(Ordering::SeqCst));
        assert_eq!(group.size(), 0);
        let after = loops.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(loops.load(Ordering::SeqCst), after);
    }
}
