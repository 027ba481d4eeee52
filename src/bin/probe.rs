//! RDMA cache-residency prober
//!
//! Start the server with no host argument, then point the client at it:
//!
//!   rdma-probe -d mlx5_0 -g 3
//!   rdma-probe -d mlx5_0 -g 3 -m random -n 5000 server-host > probes.csv
//!
//! Run with `--loopback` to drive both roles in one process without RDMA
//! hardware.

use anyhow::{Context, Result};
use clap::Parser;
use rdma_cache_probe::config::{ProbeConfig, ProbeMode, DEFAULT_TCP_PORT};
use rdma_cache_probe::rendezvous::RendezvousChannel;
use rdma_cache_probe::session;
use rdma_cache_probe::transport::{Backend, LoopbackFabric, TransportConfig};
use std::io::{self, BufWriter};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rdma-probe")]
#[command(about = "Time RDMA reads of remote memory to infer cache residency")]
struct Args {
    /// Server to connect to; listen for a client when omitted
    host: Option<String>,

    /// TCP port of the rendezvous channel
    #[arg(short, long, default_value_t = DEFAULT_TCP_PORT)]
    port: u16,

    /// RDMA device name (first device found when omitted)
    #[arg(short = 'd', long)]
    ib_dev: Option<String>,

    /// Port of the RDMA device
    #[arg(short = 'i', long, default_value = "1")]
    ib_port: u8,

    /// GID index; enables global routing (required on RoCE)
    #[arg(short = 'g', long)]
    gid_idx: Option<u8>,

    /// Number of probes in random and fixed-flush modes
    #[arg(short = 'n', long, default_value = "1000")]
    iterations: u64,

    /// How targets are chosen
    #[arg(short, long, value_enum, default_value_t = ProbeMode::Sequential)]
    mode: ProbeMode,

    /// Bytes per operation and per cell of the server buffer
    #[arg(short = 's', long, default_value = "8")]
    msg_size: usize,

    /// Columns of the server buffer
    #[arg(short = 'c', long, default_value = "1024")]
    column_count: usize,

    /// Rows of the server buffer
    #[arg(short = 'r', long, default_value = "8192")]
    row_count: usize,

    /// Seed for random mode
    #[arg(long)]
    seed: Option<u64>,

    /// Counter frequency in cycles per microsecond; measured when omitted
    #[arg(long)]
    cycles_per_usec: Option<f64>,

    /// Completion timeout of the initial message, in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Do not pin the prober to its starting CPU
    #[arg(long, default_value_t = false)]
    no_pin: bool,

    /// Run server and client in this process over an in-memory fabric
    #[arg(long, default_value_t = false)]
    loopback: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            server_name: self.host.clone(),
            tcp_port: self.port,
            transport: TransportConfig {
                device: self.ib_dev.clone(),
                ib_port: self.ib_port,
                gid_index: self.gid_idx,
                backend: Backend::Verbs,
            },
            iterations: self.iterations,
            mode: self.mode,
            msg_size: self.msg_size,
            column_count: self.column_count,
            row_count: self.row_count,
            seed: self.seed,
            pin_cpu: !self.no_pin,
            cycles_per_usec: self.cycles_per_usec,
            poll_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn run_loopback(mut config: ProbeConfig) -> Result<()> {
    let fabric = LoopbackFabric::new();
    config.transport.backend = Backend::Loopback(fabric);

    let listener = TcpListener::bind("127.0.0.1:0").context("binding loopback listener")?;
    let port = listener.local_addr()?.port();

    let mut server_config = config.clone();
    server_config.server_name = None;
    let server = thread::spawn(move || -> Result<()> {
        let channel = RendezvousChannel::accept(&listener)?;
        session::run_with_channel(&server_config, channel, &mut io::sink())?;
        Ok(())
    });

    config.server_name = Some("127.0.0.1".to_string());
    config.tcp_port = port;
    let client = RendezvousChannel::connect("127.0.0.1", port)
        .context("connecting to loopback server")
        .and_then(|channel| {
            let mut out = BufWriter::new(io::stdout().lock());
            Ok(session::run_with_channel(&config, channel, &mut out)?)
        });

    let server = server
        .join()
        .map_err(|_| anyhow::anyhow!("loopback server thread panicked"))?;
    let summary = client?;
    server?;
    tracing::info!("Loopback run finished with {} probes", summary.probes);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Records go to stdout; keep logs on stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = args.probe_config();
    tracing::info!("=== RDMA Probe Configuration ===");
    tracing::info!(
        "Role: {}",
        match &config.server_name {
            Some(host) => format!("client of {}:{}", host, config.tcp_port),
            None => format!("server on port {}", config.tcp_port),
        }
    );
    tracing::info!("Mode: {:?}", config.mode);
    tracing::info!(
        "Grid: {} rows x {} columns of {} bytes",
        config.row_count,
        config.column_count,
        config.msg_size
    );
    tracing::info!("Transport: {}", if args.loopback { "Loopback" } else { "RDMA" });
    tracing::info!("================================");

    if args.loopback {
        return run_loopback(config);
    }

    let mut out = BufWriter::new(io::stdout().lock());
    let summary = session::run(&config, &mut out)?;
    tracing::info!("Done ({:?}, {} probes)", summary.role, summary.probes);
    Ok(())
}
