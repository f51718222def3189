//! Client-server cache protocol.
//!
//! This module holds both ends of the sweep cache: the [`ProductServer`] that
//! accepts connections and answers requests, and the [`ProductClient`] that
//! short-lived processes use to ask for sweeps.
//!
//! # Overview
//!
//! A client sends one framed JSON [`Request`] at a time and blocks for the reply.
//! On the server, a concierge thread per connection looks the sweep up in the
//! [`LruCache`](crate::cache::LruCache). A hit is answered straight away; a miss
//! is queued for the [reader pool](crate::reader::ReaderPool) and the concierge
//! sleeps until a publisher thread has cached the decoded payload and written it
//! back on the same connection.
//!
//! # Binary Format
//!
//! Every message in either direction is a frame:
//!
//! - a 4-byte big-endian unsigned length,
//! - followed by exactly that many payload bytes.
//!
//! Request payloads are UTF-8 JSON, either `{"path": "...", "tarinfo": ...}` or
//! `{"stats": true}`. Response payloads are the opaque decoded sweep, or for a
//! stats request a UTF-8 string such as `"3 item(s)   1024 B"`.
//!
//! There are no error responses. A server that cannot answer closes the
//! connection, and the client reports that as an empty result.
//!
//! # See Also
//!
//! - [`reader`](crate::reader): decode workers behind the cache.
//! - [`connection`](crate::connection): per-connection state shared with publishers.
mod client;
mod context;
mod publisher;
mod request;
mod server;
pub mod transport;

pub use client::{ClientError, ProductClient};
pub use publisher::Publisher;
pub use request::{Request, RequestError, cache_key};
pub use server::{ProductServer, ServerError};
pub use transport::{ProtocolTransport, TransportError};

pub(crate) use context::ServerContext;
