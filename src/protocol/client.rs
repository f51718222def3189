use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    string::FromUtf8Error,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{config::ClientConfig, sync::lock};

use super::{ProtocolTransport, Request, RequestError, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stats reply is not UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

/// Pool of persistent connections to a [`ProductServer`](super::ProductServer).
///
/// Each socket carries at most one request at a time; concurrent callers are
/// spread over the sockets round-robin and queue on a socket's lock when it is
/// busy.
#[derive(Debug)]
pub struct ProductClient {
    config: ClientConfig,
    sockets: Vec<Mutex<ProtocolTransport<TcpStream>>>,
    next: AtomicUsize,
}

impl ProductClient {
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let config = config.normalized();
        let sockets = (0..config.sockets)
            .map(|_| open(&config).map(|stream| Mutex::new(ProtocolTransport::new(stream))))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("opened {} socket(s) to {}", sockets.len(), config.address);
        Ok(Self {
            config,
            sockets,
            next: AtomicUsize::new(0),
        })
    }

    /// Number of sockets in the pool.
    pub fn size(&self) -> usize {
        self.sockets.len()
    }

    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Requests the decoded sweep at `path`.
    ///
    /// `Ok(None)` means the server closed the connection (or the configured
    /// timeout elapsed) without answering.
    pub fn get(&self, path: &str, tarinfo: Option<Value>) -> Result<Option<Vec<u8>>, ClientError> {
        self.exchange(&Request::sweep(path, tarinfo))
    }

    /// Requests the server's cache diagnostics.
    pub fn stats(&self) -> Result<Option<String>, ClientError> {
        match self.exchange(&Request::Stats)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes)?)),
            None => Ok(None),
        }
    }

    /// Shuts every socket down. Later requests return `Ok(None)` or reconnect.
    pub fn close(&self) {
        for socket in &self.sockets {
            let _ = lock(socket).get_ref().shutdown(Shutdown::Both);
        }
    }

    fn exchange(&self, request: &Request) -> Result<Option<Vec<u8>>, ClientError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sockets.len();
        let mut transport = lock(&self.sockets[index]);

        if let Err(e) = transport.write_request(request) {
            warn!("socket {index} failed to send: {e}");
            self.reconnect(index, &mut transport);
            return Err(e.into());
        }

        match transport.read_payload() {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => {
                debug!("socket {index} closed by server");
                self.reconnect(index, &mut transport);
                Ok(None)
            }
            Err(e) if e.is_timeout() => {
                warn!("socket {index} timed out waiting for a reply");
                // A late reply would be read by the next request, so start over.
                self.reconnect(index, &mut transport);
                Ok(None)
            }
            Err(e) => {
                self.reconnect(index, &mut transport);
                Err(e.into())
            }
        }
    }

    fn reconnect(&self, index: usize, transport: &mut ProtocolTransport<TcpStream>) {
        let _ = transport.get_ref().shutdown(Shutdown::Both);
        match open(&self.config) {
            Ok(stream) => *transport = ProtocolTransport::new(stream),
            Err(e) => warn!("socket {index} could not reconnect: {e}"),
        }
    }
}

fn open(config: &ClientConfig) -> Result<TcpStream, ClientError> {
    let connect = || -> io::Result<TcpStream> {
        let stream = TcpStream::connect(config.address)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.timeout)?;
        Ok(stream)
    };
    connect().map_err(|source| ClientError::Connect {
        address: config.address,
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread, time::Duration};

    use super::*;
    use crate::protocol::transport;

    /// Answers `count` requests per connection with the request bytes, then hangs up.
    fn echo_server(count: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                thread::spawn(move || {
                    for _ in 0..count {
                        match transport::recv(&mut stream).unwrap() {
                            Some(bytes) => transport::send(&mut stream, &bytes).unwrap(),
                            None => return,
                        }
                    }
                });
            }
        });
        address
    }

    #[test]
    fn get_sends_json_request() {
        let client = ProductClient::connect(ClientConfig::new(echo_server(usize::MAX))).unwrap();

        let reply = client.get("/data/A.nc", None).unwrap().unwrap();
        assert_eq!(
            Request::from_slice(&reply).unwrap(),
            Request::sweep("/data/A.nc", None)
        );
    }

    #[test]
    fn stats_returns_text() {
        let client = ProductClient::connect(ClientConfig::new(echo_server(usize::MAX))).unwrap();

        assert_eq!(client.stats().unwrap().unwrap(), r#"{"stats":true}"#);
    }

    #[test]
    fn sockets_are_used_round_robin() {
        let client = ProductClient::connect(
            ClientConfig::new(echo_server(1)).with_sockets(3),
        )
        .unwrap();
        assert_eq!(client.size(), 3);

        // Every socket answers exactly once, so three requests need three sockets.
        for _ in 0..3 {
            assert!(client.get("A.nc", None).unwrap().is_some());
        }
    }

    #[test]
    fn hang_up_yields_none_then_reconnects() {
        let client = ProductClient::connect(ClientConfig::new(echo_server(1)).with_sockets(1)).unwrap();

        assert!(client.get("A.nc", None).unwrap().is_some());
        assert!(!matches!(client.get("B.nc", None), Ok(Some(_))));
        assert!(client.get("C.nc", None).unwrap().is_some());
    }

    #[test]
    fn timeout_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ClientConfig::new(listener.local_addr().unwrap())
            .with_sockets(1)
            .with_timeout(Some(Duration::from_millis(50)));
        let client = ProductClient::connect(config).unwrap();

        assert!(client.get("A.nc", None).unwrap().is_none());
        drop(listener);
    }

    #[test]
    fn refused_connection_is_an_error() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        assert!(matches!(
            ProductClient::connect(ClientConfig::new(address)),
            Err(ClientError::Connect { .. })
        ));
    }
}
