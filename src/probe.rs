//! Timed read-write-read probes
//!
//! A probe reads the target cell (cold), writes it back with its first
//! byte bumped, then reads it again (warm). If the remote NIC or host
//! served the cold read from memory and the warm read from cache, the
//! cold read is measurably slower.

use crate::config::ProbeMode;
use crate::endpoint::{not_registered, RemoteMemoryEndpoint};
use crate::error::{ProbeError, Result};
use crate::flush::CacheFlush;
use crate::protocol::Barrier;
use crate::sampler::{AddressSampler, CACHE_LINE_SIZE};
use crate::timer::{Calibration, CycleTimer, HardwareTimer};
use crate::transport::Opcode;
use std::fmt;
use std::io::Write;

/// Added to the first byte before it is written back
const TOUCH_INCREMENT: u8 = 2;

/// Timing of one probe
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeResult {
    pub target_address: u64,
    pub cold_read_cycles: u64,
    pub write_cycles: u64,
    pub warm_read_cycles: u64,
    /// `cold - warm`; negative when the warm read was slower
    pub delta_cycles: i64,
    pub cold_latency_ns: f64,
    pub warm_latency_ns: f64,
    /// First byte returned by the cold read
    pub cold_value: u8,
}

/// CSV record: `cold_cycles,warm_cycles,cold_ns,warm_ns`
impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{:.6},{:.6}",
            self.cold_read_cycles, self.warm_read_cycles, self.cold_latency_ns, self.warm_latency_ns
        )
    }
}

pub struct ProbeEngine<T: CycleTimer = HardwareTimer> {
    timer: T,
    calibration: Calibration,
    msg_size: usize,
}

impl<T: CycleTimer> ProbeEngine<T> {
    pub fn new(timer: T, calibration: Calibration, msg_size: usize) -> Self {
        Self {
            timer,
            calibration,
            msg_size,
        }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// One signalled operation on the whole client buffer, from post to completion.
    #[inline]
    fn timed(&self, endpoint: &mut RemoteMemoryEndpoint, kind: Opcode) -> Result<u64> {
        let start = self.timer.start();
        endpoint.post_operation(kind, 0, self.msg_size)?;
        endpoint.poll_until_complete()?;
        let stop = self.timer.stop();
        Ok(stop.saturating_sub(start))
    }

    /// Probe `target_address` on the peer.
    ///
    /// The endpoint's remote target is restored afterwards, also on error.
    pub fn probe(&self, endpoint: &mut RemoteMemoryEndpoint, target_address: u64) -> Result<ProbeResult> {
        endpoint.with_remote_target(target_address, |endpoint| {
            let cold_read_cycles = self.timed(endpoint, Opcode::RdmaRead)?;
            let cold_value = endpoint.local_byte(0)?;

            let touched = cold_value.wrapping_add(TOUCH_INCREMENT);
            endpoint.set_local_byte(0, touched)?;
            let write_cycles = self.timed(endpoint, Opcode::RdmaWrite)?;

            let warm_read_cycles = self.timed(endpoint, Opcode::RdmaRead)?;

            let result = ProbeResult {
                target_address,
                cold_read_cycles,
                write_cycles,
                warm_read_cycles,
                delta_cycles: cold_read_cycles as i64 - warm_read_cycles as i64,
                cold_latency_ns: self.calibration.cycles_to_ns(cold_read_cycles),
                warm_latency_ns: self.calibration.cycles_to_ns(warm_read_cycles),
                cold_value,
            };
            tracing::trace!(
                "{:#x}: read {} in {} cycles, wrote {} in {} cycles, diff {} cycles",
                target_address,
                cold_value,
                cold_read_cycles,
                touched,
                write_cycles,
                result.delta_cycles
            );
            Ok(result)
        })
    }

    /// Probe every target of `sampler`, writing one CSV line per probe.
    ///
    /// In fixed-flush mode each probe is followed by the `A`/`B` barrier
    /// pair so the server can flush between probes. Returns the number of
    /// probes run.
    pub fn run(
        &self,
        endpoint: &mut RemoteMemoryEndpoint,
        sampler: AddressSampler,
        mode: ProbeMode,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let mut probes = 0;
        for target in sampler {
            let result = self.probe(endpoint, target)?;
            writeln!(out, "{}", result).map_err(ProbeError::Output)?;
            probes += 1;

            if mode == ProbeMode::FixedFlush {
                endpoint.sync(Barrier::FlushStart)?;
                endpoint.sync(Barrier::FlushDone)?;
            }
        }
        out.flush().map_err(ProbeError::Output)?;
        tracing::info!("Finished {} probes", probes);
        Ok(probes)
    }
}

/// Passive side of fixed-flush mode: between the `A` and `B` barriers of
/// each probe, evict the first line of the local buffer.
pub fn serve_fixed_flush(
    endpoint: &mut RemoteMemoryEndpoint,
    iterations: u64,
    flush: CacheFlush,
) -> Result<()> {
    if endpoint.buffer().is_none() {
        return Err(not_registered());
    }
    for _ in 0..iterations {
        endpoint.sync(Barrier::FlushStart)?;
        let line = endpoint.buffer().ok_or_else(not_registered)?.as_slice();
        flush.flush_line(&line[..line.len().min(CACHE_LINE_SIZE)]);
        endpoint.sync(Barrier::FlushDone)?;
    }
    tracing::info!("Flushed the first line {} times", iterations);
    Ok(())
}
