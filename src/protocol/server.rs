use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    cache::{CacheSize, LruCache},
    config::ServerConfig,
    connection::ConnectionState,
    reader::{DecodeResult, DecoderFactory, PendingTask, ReaderPool},
    shutdown::ShutdownHandle,
};

use super::{
    ProtocolTransport, Publisher, Request, ServerContext, TransportError, cache_key,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server already started")]
    AlreadyStarted,
    #[error("task queue closed")]
    QueueClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

/// What the connector hands back when it stops accepting.
type Connector = JoinHandle<(TcpListener, Vec<JoinHandle<()>>)>;

type Queues = (
    mpsc::Receiver<PendingTask>,
    mpsc::Sender<DecodeResult>,
    mpsc::Receiver<DecodeResult>,
);

struct Running {
    connector: Connector,
    readers: ReaderPool,
    publisher: Publisher,
}

/// Sweep cache server.
///
/// Binds on construction, serves after [`ProductServer::start`], and tears down
/// in a fixed order on [`ProductServer::stop`]: stop accepting and close every
/// connection, then join the readers, then the publishers, then close the
/// listener. Dropping a running server stops it.
pub struct ProductServer {
    context: Arc<ServerContext>,
    address: SocketAddr,
    factory: DecoderFactory,
    listener: Option<TcpListener>,
    queues: Option<Queues>,
    running: Option<Running>,
    shutdown: ShutdownHandle,
}

impl ProductServer {
    pub fn new(config: ServerConfig, factory: DecoderFactory) -> Result<Self, ServerError> {
        let config = config.normalized();
        let listener = TcpListener::bind(config.address).map_err(|source| ServerError::Bind {
            address: config.address,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;

        let (tasks, task_queue) = mpsc::channel();
        let (results, result_queue) = mpsc::channel();

        Ok(Self {
            context: Arc::new(ServerContext::new(config, tasks)),
            address,
            factory,
            listener: Some(listener),
            queues: Some((task_queue, results, result_queue)),
            running: None,
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    pub fn cache(&self) -> &LruCache {
        &self.context.cache
    }

    pub fn stats(&self) -> CacheSize {
        self.context.cache.size()
    }

    /// Number of open client connections.
    pub fn connections(&self) -> usize {
        self.context.registry.len()
    }

    /// Number of connections waiting on a decode.
    pub fn tasked(&self) -> usize {
        self.context.registry.tasked()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts readers, publishers and the connector.
    pub fn start(&mut self) -> Result<(), ServerError> {
        let (Some(listener), Some((task_queue, results, result_queue))) =
            (self.listener.take(), self.queues.take())
        else {
            return Err(ServerError::AlreadyStarted);
        };

        let readers = ReaderPool::spawn(
            &self.context.config,
            Arc::clone(&self.factory),
            task_queue,
            results,
        )?;
        let publisher = Publisher::spawn(Arc::clone(&self.context), result_queue)?;

        let context = Arc::clone(&self.context);
        let connector = thread::Builder::new()
            .name("connector".into())
            .spawn(move || accept(listener, context))?;

        let cache = &self.context.cache;
        info!(
            "listening at {}, caching up to {} sweep(s) ({:?})",
            self.address,
            cache.capacity(),
            cache.compression()
        );
        self.running = Some(Running {
            connector,
            readers,
            publisher,
        });
        Ok(())
    }

    /// Blocks until shutdown is requested through a [`ShutdownHandle`].
    pub fn wait(&self) {
        self.shutdown.wait();
    }

    /// Ordered shutdown. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shutdown.request();
        self.context.stop_accepting();

        let Some(mut running) = self.running.take() else {
            self.listener.take();
            return;
        };
        info!("stopping ...");

        let (listener, concierges) = match running.connector.join() {
            Ok(out) => (Some(out.0), out.1),
            Err(_) => {
                error!("connector panicked");
                (None, Vec::new())
            }
        };

        self.context.registry.shutdown_all();
        for concierge in concierges {
            if concierge.join().is_err() {
                error!("concierge panicked");
            }
        }

        running.readers.stop();
        running.publisher.stop();
        drop(listener);

        self.context.registry.clear();
        self.context.cache.clear();
        info!("stopped");
    }
}

impl Drop for ProductServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connector loop: polls the listener until shutdown, spawning a concierge per
/// connection.
fn accept(listener: TcpListener, context: Arc<ServerContext>) -> (TcpListener, Vec<JoinHandle<()>>) {
    let mut concierges: Vec<JoinHandle<()>> = Vec::new();
    let poll = context.config.poll_interval;

    while context.is_accepting() {
        match listener.accept() {
            Ok((stream, peer)) => {
                concierges.retain(|handle| !handle.is_finished());
                match open(stream, peer, &context) {
                    Ok(handle) => concierges.push(handle),
                    Err(e) => warn!("failed to open connection from {peer}: {e}"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                warn!("broken connection: {e:?}");
                thread::sleep(poll);
            }
        }
    }

    debug!("connector stopped with {} concierge(s)", concierges.len());
    (listener, concierges)
}

fn open(
    stream: TcpStream,
    peer: SocketAddr,
    context: &Arc<ServerContext>,
) -> io::Result<JoinHandle<()>> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(context.config.poll_interval))?;

    let id = context.registry.next_id();
    let state = Arc::new(ConnectionState::new(id, peer, &stream)?);
    context.registry.insert(Arc::clone(&state));
    info!("connection {id} from {peer}");

    let concierge = Concierge {
        transport: ProtocolTransport::new(stream),
        connection: state,
        context: Arc::clone(context),
        state: ConciergeState::Idle,
    };
    thread::Builder::new()
        .name(format!("concierge-{}", id.get()))
        .spawn(move || concierge.run())
        .inspect_err(|_| {
            context.registry.remove(id);
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConciergeState {
    Idle,
    Requesting,
    CacheHit,
    AwaitingDecode,
    Closed,
}

/// Request/response loop for one connection.
struct Concierge {
    transport: ProtocolTransport<TcpStream>,
    connection: Arc<ConnectionState>,
    context: Arc<ServerContext>,
    state: ConciergeState,
}

impl Concierge {
    fn run(mut self) {
        if let Err(e) = self.serve() {
            debug!("connection {}: {e}", self.connection.id());
        }
        self.close();
    }

    fn transition(&mut self, state: ConciergeState) {
        if self.state != state {
            debug!("connection {}: {:?} -> {:?}", self.connection.id(), self.state, state);
            self.state = state;
        }
    }

    fn serve(&mut self) -> Result<(), ServerError> {
        while self.context.is_accepting() {
            self.transition(ConciergeState::Idle);

            let request = match self.transport.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            };

            self.transition(ConciergeState::Requesting);
            match request {
                Request::Stats => {
                    let stats = self.context.cache.size().to_string();
                    self.connection.send(stats.as_bytes())?;
                }
                Request::Sweep { path, tarinfo } => self.lookup(path, tarinfo)?,
            }
        }
        Ok(())
    }

    fn lookup(&mut self, path: String, tarinfo: Option<serde_json::Value>) -> Result<(), ServerError> {
        let key = cache_key(&path);

        if let Some(blob) = self.context.cache.get(key) {
            self.transition(ConciergeState::CacheHit);
            info!("cache: {key} -> {}", self.connection.id());
            self.connection.send(&blob)?;
            return Ok(());
        }

        self.transition(ConciergeState::AwaitingDecode);
        debug!("request: {key} from {}", self.connection.id());
        self.connection.mark_tasked();
        self.context.submit(PendingTask {
            connection: self.connection.id(),
            path,
            tarinfo,
        })?;

        // A client that left is noticed on the next read once the publisher
        // has answered; a half-closed one still gets its reply.
        let poll = self.context.config.poll_interval;
        while !self.connection.wait_resolved(poll) {
            if !self.context.is_accepting() {
                break;
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.transition(ConciergeState::Closed);
        self.context.registry.remove(self.connection.id());
        self.connection.shutdown();
        info!(
            "connection {} from {} closed",
            self.connection.id(),
            self.connection.peer()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::Shutdown,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    };

    use serde_json::Value;

    use super::*;
    use crate::{
        config::ClientConfig,
        protocol::{ProductClient, transport},
        reader::{Decode, DecodeError, process_factory},
    };

    /// Counts decodes per path; paths containing `slow` take a while, `bad` fail.
    #[derive(Clone, Default)]
    struct Counting {
        calls: Arc<Mutex<HashMap<String, usize>>>,
        total: Arc<AtomicUsize>,
    }

    impl Counting {
        fn calls(&self, path: &str) -> usize {
            self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
        }

        fn factory(&self) -> DecoderFactory {
            let decoder = self.clone();
            Arc::new(move |_: usize| -> Result<Box<dyn Decode>, DecodeError> {
                Ok(Box::new(decoder.clone()))
            })
        }
    }

    impl Decode for Counting {
        fn decode(&mut self, path: &str, tarinfo: Option<&Value>) -> Result<Vec<u8>, DecodeError> {
            *self.calls.lock().unwrap().entry(path.to_string()).or_default() += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            if path.contains("slow") {
                thread::sleep(Duration::from_millis(200));
            }
            if path.contains("bad") {
                return Err(DecodeError::Failed(format!("cannot decode {path}")));
            }
            let info = tarinfo.map(|t| t.to_string()).unwrap_or_default();
            Ok(format!("sweep:{path}{info}").into_bytes())
        }
    }

    fn server(decoder: &Counting) -> ProductServer {
        let config = ServerConfig::default()
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_readers(2)
            .with_capacity(8)
            .with_poll_interval(Duration::from_millis(10));
        let mut server = ProductServer::new(config, decoder.factory()).unwrap();
        server.start().unwrap();
        server
    }

    fn client(server: &ProductServer, sockets: usize) -> ProductClient {
        ProductClient::connect(ClientConfig::new(server.local_addr()).with_sockets(sockets))
            .unwrap()
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn second_request_is_served_from_cache() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let client = client(&server, 1);

        let first = client.get("/mnt/data/A.nc", None).unwrap().unwrap();
        let second = client.get("/mnt/data/A.nc", None).unwrap().unwrap();

        assert_eq!(first, b"sweep:/mnt/data/A.nc".to_vec());
        assert_eq!(second, first);
        assert_eq!(decoder.calls("/mnt/data/A.nc"), 1);
        assert!(server.cache().contains("A.nc"));
    }

    #[test]
    fn tarinfo_reaches_the_decoder() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let client = client(&server, 1);

        let tarinfo = serde_json::json!({"Z": ["A-Z.nc", 1, 0, 512]});
        let payload = client.get("A.tar", Some(tarinfo.clone())).unwrap().unwrap();

        assert_eq!(payload, format!("sweep:A.tar{tarinfo}").into_bytes());
    }

    #[test]
    fn concurrent_clients_get_their_own_payloads() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let address = server.local_addr();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                thread::spawn(move || {
                    let client =
                        ProductClient::connect(ClientConfig::new(address).with_sockets(1)).unwrap();
                    let path = if i % 2 == 0 {
                        format!("slow-{i}.nc")
                    } else {
                        format!("fast-{i}.nc")
                    };
                    let payload = client.get(&path, None).unwrap().unwrap();
                    (path, payload)
                })
            })
            .collect();

        for handle in handles {
            let (path, payload) = handle.join().unwrap();
            assert_eq!(payload, format!("sweep:{path}").into_bytes());
        }
    }

    #[test]
    fn stats_on_empty_cache() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let client = client(&server, 1);

        assert_eq!(client.stats().unwrap().unwrap(), "0 item(s)   0 B");

        client.get("A.nc", None).unwrap().unwrap();
        let expected = format!("1 item(s)   {} B", b"sweep:A.nc".len());
        assert_eq!(client.stats().unwrap().unwrap(), expected);
        assert_eq!(server.stats().to_string(), expected);
        assert_eq!(server.config().capacity, 8);
    }

    #[test]
    fn second_request_waits_for_the_first() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();

        let slow = Request::sweep("slow.nc", None).to_vec().unwrap();
        let fast = Request::sweep("fast.nc", None).to_vec().unwrap();
        transport::send(&mut stream, &slow).unwrap();
        transport::send(&mut stream, &fast).unwrap();

        let first = transport::recv(&mut stream).unwrap().unwrap();
        let second = transport::recv(&mut stream).unwrap().unwrap();
        assert_eq!(first, b"sweep:slow.nc".to_vec());
        assert_eq!(second, b"sweep:fast.nc".to_vec());
    }

    #[test]
    fn malformed_request_closes_the_connection() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();

        transport::send(&mut stream, b"{oops").unwrap();

        assert!(transport::recv(&mut stream).unwrap().is_none());
        assert!(eventually(|| server.connections() == 0));
    }

    #[test]
    fn disconnect_while_tasked_is_cleaned_up() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();

        let slow = Request::sweep("slow-gone.nc", None).to_vec().unwrap();
        transport::send(&mut stream, &slow).unwrap();
        assert!(eventually(|| server.tasked() == 1));
        drop(stream);

        assert!(eventually(|| server.connections() == 0));
        assert_eq!(server.tasked(), 0);
        assert_eq!(decoder.calls("slow-gone.nc"), 1);
    }

    #[test]
    fn half_closed_client_still_gets_its_reply() {
        let decoder = Counting::default();
        let server = server(&decoder);
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();

        let slow = Request::sweep("slow-half.nc", None).to_vec().unwrap();
        transport::send(&mut stream, &slow).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let reply = transport::recv(&mut stream).unwrap();
        assert_eq!(reply, Some(b"sweep:slow-half.nc".to_vec()));
        assert!(transport::recv(&mut stream).unwrap().is_none());
        assert!(eventually(|| server.connections() == 0));
    }

    #[cfg(unix)]
    #[test]
    fn stop_is_bounded_when_a_reader_child_hangs() {
        let config = ServerConfig::default()
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_readers(2)
            .with_poll_interval(Duration::from_millis(10));
        let factory = process_factory("sleep".into(), vec!["30".into()]);
        let mut server = ProductServer::new(config, factory).unwrap();
        server.start().unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        let hung = Request::sweep("hung.nc", None).to_vec().unwrap();
        transport::send(&mut stream, &hung).unwrap();
        assert!(eventually(|| server.tasked() == 1));
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        server.stop();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(transport::recv(&mut stream).unwrap().is_none());
    }

    #[test]
    fn failed_decode_leaves_connection_tasked() {
        let decoder = Counting::default();
        let mut server = server(&decoder);
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let bad = Request::sweep("bad.nc", None).to_vec().unwrap();
        transport::send(&mut stream, &bad).unwrap();

        assert!(transport::recv(&mut stream).unwrap_err().is_timeout());
        assert_eq!(server.tasked(), 1);

        server.stop();
        stream.set_read_timeout(None).unwrap();
        assert!(transport::recv(&mut stream).unwrap().is_none());
    }

    #[test]
    fn shutdown_with_work_in_flight_is_bounded() {
        let decoder = Counting::default();
        let mut server = server(&decoder);

        let streams: Vec<_> = (0..4)
            .map(|i| {
                let mut stream = TcpStream::connect(server.local_addr()).unwrap();
                let request = Request::sweep(format!("slow-{i}.nc"), None).to_vec().unwrap();
                transport::send(&mut stream, &request).unwrap();
                stream
            })
            .collect();
        assert!(eventually(|| server.tasked() == 4));

        let started = Instant::now();
        server.stop();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!server.is_running());
        assert_eq!(server.connections(), 0);
        assert!(server.cache().is_empty());
        drop(streams);

        server.stop();
    }

    #[test]
    fn start_twice_is_rejected() {
        let decoder = Counting::default();
        let mut server = server(&decoder);

        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
    }

    #[test]
    fn bind_failure_is_reported() {
        let decoder = Counting::default();
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig::default().with_address(taken.local_addr().unwrap());

        assert!(matches!(
            ProductServer::new(config, decoder.factory()),
            Err(ServerError::Bind { .. })
        ));
    }

    #[test]
    fn shutdown_handle_releases_wait() {
        let decoder = Counting::default();
        let mut server = server(&decoder);
        let handle = server.shutdown_handle();

        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.request();
        });
        server.wait();
        server.stop();
        trigger.join().unwrap();
    }
}
