//! Runtime settings for the server and client.
//!
//! Both binaries map their command-line arguments onto these structs; library
//! users build them directly. Worker counts are clamped into the ranges below
//! when a server or client is created, so out-of-range values never reach the
//! thread pools.
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use crate::cache::Compression;

pub const DEFAULT_PORT: u16 = 6969;
pub const DEFAULT_ADDRESS: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT));

pub const MIN_READERS: usize = 2;
pub const MAX_READERS: usize = 16;
pub const DEFAULT_READERS: usize = 4;

pub const MIN_PUBLISHERS: usize = 1;
pub const MAX_PUBLISHERS: usize = 4;

pub const MIN_SOCKETS: usize = 1;
pub const MAX_SOCKETS: usize = 16;
pub const DEFAULT_SOCKETS: usize = 6;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub address: SocketAddr,
    /// Number of decode workers.
    pub readers: usize,
    /// Number of publisher threads.
    pub publishers: usize,
    /// Maximum number of cached sweeps.
    pub capacity: usize,
    pub compression: Compression,
    /// Upper bound on how long any loop waits before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Delay before readers start taking tasks.
    pub reader_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            readers: DEFAULT_READERS,
            publishers: MIN_PUBLISHERS,
            capacity: DEFAULT_CAPACITY,
            compression: Compression::None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reader_delay: Duration::ZERO,
        }
    }
}

impl ServerConfig {
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_readers(mut self, readers: usize) -> Self {
        self.readers = readers;
        self
    }

    pub fn with_publishers(mut self, publishers: usize) -> Self {
        self.publishers = publishers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reader_delay(mut self, reader_delay: Duration) -> Self {
        self.reader_delay = reader_delay;
        self
    }

    /// Clamps every field into its supported range.
    pub fn normalized(mut self) -> Self {
        self.readers = self.readers.clamp(MIN_READERS, MAX_READERS);
        self.publishers = self.publishers.clamp(MIN_PUBLISHERS, MAX_PUBLISHERS);
        self.capacity = self.capacity.max(1);
        self.poll_interval = self.poll_interval.max(Duration::from_millis(1));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub address: SocketAddr,
    /// Number of persistent sockets.
    pub sockets: usize,
    /// Give up on a reply after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            sockets: DEFAULT_SOCKETS,
            timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn with_sockets(mut self, sockets: usize) -> Self {
        self.sockets = sockets;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn normalized(mut self) -> Self {
        self.sockets = self.sockets.clamp(MIN_SOCKETS, MAX_SOCKETS);
        self.timeout = self.timeout.filter(|t| !t.is_zero());
        self
    }
}
