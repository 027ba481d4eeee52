pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod flush;
pub mod memory;
pub mod probe;
pub mod protocol;
pub mod rendezvous;
pub mod sampler;
pub mod session;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{ProbeConfig, ProbeMode, Role};
pub use connection::ConnectionEstablisher;
pub use endpoint::RemoteMemoryEndpoint;
pub use error::{ProbeError, Result};
pub use probe::{ProbeEngine, ProbeResult};
pub use protocol::{Barrier, RemoteRoutingInfo};
pub use rendezvous::RendezvousChannel;
pub use sampler::{AddressSampler, AddressSpace, SamplingBitmap};
pub use session::{run, run_with_channel, RunSummary};
pub use timer::{Calibration, CycleTimer, HardwareTimer};
pub use transport::{Backend, LoopbackFabric, TransportConfig};
