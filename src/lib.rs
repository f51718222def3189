pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod reader;
mod shutdown;
mod sync;
mod thread;

pub use cache::{CacheSize, Compression, LruCache};
pub use cli::{Command, prompt};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{ProductClient, ProductServer, Request};
pub use reader::{Decode, DecodeError, DecoderFactory, FileDecoder, Sweep};
pub use shutdown::ShutdownHandle;
