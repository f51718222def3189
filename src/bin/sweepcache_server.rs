use std::{env, error::Error, ffi::OsString, io, net::SocketAddr, time::Duration};

use clap::{Parser, Subcommand};
use log::info;
use sweepcache::{
    Compression, FileDecoder, ProductServer, ServerConfig,
    config::{DEFAULT_ADDRESS, DEFAULT_CAPACITY, DEFAULT_READERS, MIN_PUBLISHERS},
    reader::{process_factory, run_worker},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Option<Mode>,
    /// Listen for new connections at address
    #[arg(short, long, default_value_t = DEFAULT_ADDRESS)]
    address: SocketAddr,
    /// Number of decode worker processes
    #[arg(short, long, default_value_t = DEFAULT_READERS)]
    readers: usize,
    /// Number of publisher threads
    #[arg(short, long, default_value_t = MIN_PUBLISHERS)]
    publishers: usize,
    /// Maximum number of cached sweeps
    #[arg(short, long, default_value_t = DEFAULT_CAPACITY)]
    cache: usize,
    /// Store cached sweeps zlib-compressed
    #[arg(long)]
    compress: bool,
    /// Shutdown polling interval in milliseconds
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Decode tasks framed on stdin and answer on stdout
    #[command(hide = true)]
    Reader,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Logs go to stderr, which keeps a reader's stdout free for frames.
    env_logger::init();

    let cli = Cli::parse();
    if let Some(Mode::Reader) = cli.mode {
        return reader();
    }

    let config = ServerConfig::default()
        .with_address(cli.address)
        .with_readers(cli.readers)
        .with_publishers(cli.publishers)
        .with_capacity(cli.cache)
        .with_compression(if cli.compress {
            Compression::zlib()
        } else {
            Compression::None
        })
        .with_poll_interval(Duration::from_millis(cli.poll_ms.max(1)));

    let factory = process_factory(env::current_exe()?, vec![OsString::from("reader")]);
    let mut server = ProductServer::new(config, factory)?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || handle.request())?;

    server.start()?;
    info!(
        "serving sweeps on {} with {} reader process(es)",
        server.local_addr(),
        server.config().readers
    );

    server.wait();
    info!("shutting down, cache holds {}", server.stats());
    server.stop();
    Ok(())
}

fn reader() -> Result<(), Box<dyn Error>> {
    // The parent owns shutdown; a reader leaves once its stdin closes.
    ctrlc::set_handler(|| {})?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_worker(&mut FileDecoder, stdin.lock(), stdout.lock())?;
    Ok(())
}
