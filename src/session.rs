//! A complete run of one role, from rendezvous to teardown

use crate::config::{ProbeConfig, ProbeMode, Role};
use crate::connection::ConnectionEstablisher;
use crate::endpoint::RemoteMemoryEndpoint;
use crate::error::{ProbeError, Result};
use crate::flush::CacheFlush;
use crate::probe::{serve_fixed_flush, ProbeEngine};
use crate::protocol::Barrier;
use crate::rendezvous::RendezvousChannel;
use crate::sampler::{AddressSampler, AddressSpace};
use crate::timer::{Calibration, HardwareTimer};
use crate::transport::{new_transport, AccessFlags, Opcode};
use std::io::{self, Write};

/// What a finished run did
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub role: Role,
    /// Probes run; always zero on the server
    pub probes: u64,
    /// Counter frequency used for the ns columns (client only)
    pub cycles_per_usec: Option<f64>,
}

/// Open the rendezvous socket for `config`'s role and run to completion.
pub fn run(config: &ProbeConfig, out: &mut dyn Write) -> Result<RunSummary> {
    config.validate()?;
    let channel = match &config.server_name {
        Some(host) => RendezvousChannel::connect(host, config.tcp_port),
        None => RendezvousChannel::listen(config.tcp_port),
    }
    .map_err(|source| ProbeError::HandshakeFailed {
        context: "rendezvous connection",
        source,
    })?;
    run_with_channel(config, channel, out)
}

/// Run one role over an already connected rendezvous socket.
///
/// Probe records go to `out`. Teardown always runs; when both the run and
/// the teardown fail, the run's error is returned.
pub fn run_with_channel(
    config: &ProbeConfig,
    channel: RendezvousChannel,
    out: &mut dyn Write,
) -> Result<RunSummary> {
    config.validate()?;
    let role = config.role();

    let flush = match (role, config.mode) {
        (Role::Server, ProbeMode::FixedFlush) => Some(
            CacheFlush::detect()
                .ok_or(ProbeError::Unsupported("fixed-flush mode needs a cache flush instruction"))?,
        ),
        _ => None,
    };
    if role == Role::Client && config.pin_cpu {
        pin_to_current_cpu();
    }

    tracing::info!(
        "Starting {:?} (mode {:?}, msg size {}, {} x {} cells)",
        role,
        config.mode,
        config.msg_size,
        config.row_count,
        config.column_count
    );
    let transport = new_transport(&config.transport)?;
    let mut endpoint = RemoteMemoryEndpoint::open(role, transport, &config.transport, channel)?;

    let result = drive(config, &mut endpoint, flush, out);
    match (result, endpoint.close()) {
        (Ok(summary), Ok(())) => {
            tracing::info!("Run finished");
            Ok(summary)
        }
        (Ok(_), Err(teardown)) => Err(teardown),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown)) => {
            tracing::warn!("{}", teardown);
            Err(e)
        }
    }
}

fn drive(
    config: &ProbeConfig,
    endpoint: &mut RemoteMemoryEndpoint,
    flush: Option<CacheFlush>,
    out: &mut dyn Write,
) -> Result<RunSummary> {
    let role = config.role();
    let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
    endpoint.allocate_and_register(config.buffer_size(), config.msg_size, access)?;

    ConnectionEstablisher::for_endpoint(endpoint).establish(endpoint, config.msg_size)?;

    // the server's first cell lands in the client's pre-posted receive
    if role == Role::Server {
        endpoint.post_operation(Opcode::Send, 0, config.msg_size)?;
    }
    endpoint.poll_completion(config.poll_timeout)?;
    if role == Role::Client {
        tracing::debug!("Initial message: {}", endpoint.local_byte(0)?);
    }
    endpoint.sync(Barrier::Ready)?;

    let mut summary = RunSummary {
        role,
        probes: 0,
        cycles_per_usec: None,
    };
    match role {
        Role::Client => {
            let calibration = match config.cycles_per_usec.and_then(Calibration::fixed) {
                Some(calibration) => calibration,
                None => Calibration::measure(&HardwareTimer, Calibration::DEFAULT_WINDOW),
            };
            tracing::info!("Counter runs at {:.3} cycles/usec", calibration.cycles_per_usec());
            summary.cycles_per_usec = Some(calibration.cycles_per_usec());

            let base = endpoint
                .remote_target()
                .ok_or_else(|| ProbeError::HandshakeFailed {
                    context: "remote routing info",
                    source: io::Error::new(io::ErrorKind::NotFound, "missing after handshake"),
                })?;
            let space = AddressSpace {
                base,
                row_count: config.row_count,
                column_count: config.column_count,
                msg_size: config.msg_size,
            };
            tracing::info!(
                "Probing {} targets",
                AddressSampler::planned_probes(config.mode, &space, config.iterations)
            );
            let sampler = AddressSampler::new(config.mode, space, config.iterations, config.seed);
            let engine = ProbeEngine::new(HardwareTimer, calibration, config.msg_size);
            summary.probes = engine.run(endpoint, sampler, config.mode, out)?;
        }
        Role::Server => {
            if let Some(flush) = flush {
                serve_fixed_flush(endpoint, config.iterations, flush)?;
            }
        }
    }

    // the server must not tear down while the client is still reading
    endpoint.sync(Barrier::Wrapup)?;
    Ok(summary)
}

/// Keep the prober on the CPU it started on.
fn pin_to_current_cpu() {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        tracing::warn!(
            "Could not determine the current CPU: {}",
            io::Error::last_os_error()
        );
        return;
    }
    if core_affinity::set_for_current(core_affinity::CoreId { id: cpu as usize }) {
        tracing::info!("Pinned prober to CPU {}", cpu);
    } else {
        tracing::warn!("Could not pin prober to CPU {}", cpu);
    }
}
