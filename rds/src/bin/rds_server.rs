//! RDS broker daemon.
//!
//! Binds the local datagram endpoint and the TCP listener, then relays
//! messages between connected clients until interrupted.
//!
//! # Usage
//!
//! ```sh
//! rds-server --bind 0.0.0.0:27300 --protocol-errors reject
//! rds-server --datagram-path /tmp/rds.sock --bind 127.0.0.1:0
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM`: Graceful shutdown

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use rds::broker::{DEFAULT_BACKLOG, DEFAULT_STREAM_PORT, ProtocolErrorPolicy};
use rds::net::DatagramAddr;
use rds::{Broker, BrokerConfig, BrokerError};

#[derive(Parser, Debug)]
#[command(name = "rds-server")]
#[command(about = "Developer-mode message broker")]
struct Args {
    /// Bind the datagram endpoint at a filesystem path
    #[arg(long, conflicts_with = "datagram_name")]
    datagram_path: Option<PathBuf>,

    /// Bind the datagram endpoint at an abstract name (Linux only)
    #[arg(long)]
    datagram_name: Option<String>,

    /// TCP listener address
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_STREAM_PORT)))]
    bind: SocketAddr,

    /// TCP listen backlog
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: i32,

    /// Sleep after an idle cycle, in microseconds
    #[arg(long, default_value_t = 100)]
    idle_sleep_us: u64,

    /// Reaction to unserved control opcodes: ignore, reject or fatal
    #[arg(long, default_value_t = ProtocolErrorPolicy::Reject)]
    protocol_errors: ProtocolErrorPolicy,

    /// Datagram socket buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,
}

impl Args {
    fn into_config(self) -> BrokerConfig {
        let datagram_addr = match (self.datagram_path, self.datagram_name) {
            (Some(path), _) => DatagramAddr::path(path),
            (None, Some(name)) => DatagramAddr::abstract_name(name),
            (None, None) => DatagramAddr::well_known(),
        };

        BrokerConfig {
            datagram_addr,
            stream_addr: self.bind,
            backlog: self.backlog,
            idle_sleep: Duration::from_micros(self.idle_sleep_us),
            protocol_errors: self.protocol_errors,
            datagram_buffer_size: self.buffer_size,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    rds::init_tracing();

    match run(args.into_config()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rds-server: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: BrokerConfig) -> Result<(), BrokerError> {
    let mut broker = Broker::bind(config)?;
    if let Ok((datagram, stream)) = broker.local_addrs() {
        eprintln!("rds-server: listening on {datagram} and tcp {stream}");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        eprintln!("rds-server: cannot install signal handler: {e}");
    }

    broker.run(&shutdown)?;
    eprintln!("rds-server: stopped");
    Ok(())
}
