use std::{
    collections::VecDeque,
    error::Error,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use sweepcache::{
    ClientConfig, Command, ProductClient, Sweep,
    config::{DEFAULT_ADDRESS, DEFAULT_SOCKETS},
    prompt,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value_t = DEFAULT_ADDRESS)]
    address: SocketAddr,
    /// Number of sockets kept open to the server
    #[arg(short, long, default_value_t = DEFAULT_SOCKETS)]
    sockets: usize,
    /// Give up on a reply after this many milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,
    /// Sweeps to request; without any, an interactive prompt is opened
    files: Vec<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig::new(cli.address)
        .with_sockets(cli.sockets)
        .with_timeout(cli.timeout_ms.map(Duration::from_millis));
    let client = ProductClient::connect(config)?;

    if cli.files.is_empty() {
        interactive(&client)
    } else {
        batch(&client, cli.files)
    }
}

/// Requests every file with at most two requests in flight per socket.
fn batch(client: &ProductClient, files: Vec<PathBuf>) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let count = files.len();
    let queue = Mutex::new(files.into_iter().collect::<VecDeque<_>>());
    let workers = (2 * client.size()).min(count);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some(path) = next else { break };
                    fetch(client, &path.to_string_lossy(), None);
                }
            });
        }
    });

    println!(
        "{count} request(s) in {:.3} s",
        start.elapsed().as_secs_f64()
    );
    print_stats(client);
    Ok(())
}

fn interactive(client: &ProductClient) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(stdin.lock(), writer) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Stats => print_stats(client),
            Command::Get { path, tarinfo } => fetch(client, &path, tarinfo),
        }
    }

    client.close();
    Ok(())
}

fn fetch(client: &ProductClient, path: &str, tarinfo: Option<serde_json::Value>) {
    match client.get(path, tarinfo) {
        Ok(Some(payload)) => match Sweep::from_bytes(&payload) {
            Ok(sweep) => println!(
                "{path}: {} B, {} member(s) [{}]",
                payload.len(),
                sweep.members.len(),
                sweep.symbols().join(", ")
            ),
            Err(_) => println!("{path}: {} B", payload.len()),
        },
        Ok(None) => eprintln!("{path}: no reply"),
        Err(e) => eprintln!("{path}: {e}"),
    }
}

fn print_stats(client: &ProductClient) {
    match client.stats() {
        Ok(Some(stats)) => println!("{stats}"),
        Ok(None) => eprintln!("stats: no reply"),
        Err(e) => eprintln!("stats: {e}"),
    }
}

/// StdOut wrapper that automatically flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
