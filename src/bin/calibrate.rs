//! Measure the cycle counter against the wall clock
//!
//! Run with: cargo run --bin cycle-calibrate -- --rounds 5

use anyhow::{ensure, Result};
use clap::Parser;
use rdma_cache_probe::timer::{cpuinfo_mhz, Calibration, HardwareTimer};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cycle-calibrate")]
#[command(about = "Report the cycle counter frequency used by rdma-probe")]
struct Args {
    /// Measurement window per round, in milliseconds
    #[arg(long, default_value = "100")]
    window_ms: u64,

    /// Number of rounds
    #[arg(long, default_value = "3")]
    rounds: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    ensure!(args.rounds > 0, "--rounds must be at least 1");

    let window = Duration::from_millis(args.window_ms);
    let mut samples = Vec::with_capacity(args.rounds as usize);
    for round in 1..=args.rounds {
        let calibration = Calibration::measure(&HardwareTimer, window);
        tracing::info!("Round {}: {:.3} cycles/usec", round, calibration.cycles_per_usec());
        samples.push(calibration.cycles_per_usec());
    }

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let spread = samples
        .iter()
        .map(|s| (s - mean).abs())
        .fold(0.0_f64, f64::max);
    println!("{:.3}", mean);
    tracing::info!("Mean {:.3} cycles/usec (max deviation {:.3})", mean, spread);

    match cpuinfo_mhz() {
        Some(mhz) => tracing::info!("/proc/cpuinfo reports {:.3} MHz", mhz),
        None => tracing::info!("No frequency in /proc/cpuinfo"),
    }
    Ok(())
}
