//! Reliable-connection setup and the routing handshake

use crate::config::Role;
use crate::endpoint::RemoteMemoryEndpoint;
use crate::error::{ProbeError, Result};
use crate::protocol::{Barrier, RemoteRoutingInfo};
use crate::transport::{AccessFlags, GlobalRoute, PathMtu, StateTransition};

pub const PATH_MTU: PathMtu = PathMtu::Mtu2048;
pub const MIN_RNR_TIMER: u8 = 0x12;
pub const RESPONSE_TIMEOUT: u8 = 0x12;
pub const RETRY_COUNT: u8 = 6;
pub const RNR_RETRY: u8 = 0;
pub const START_PSN: u32 = 0;
/// The peers are expected on the same subnet.
pub const HOP_LIMIT: u8 = 1;

/// Attribute sets for each connection state, built from the local port
/// configuration and the peer's routing info.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionEstablisher {
    ib_port: u8,
    gid_index: Option<u8>,
}

impl ConnectionEstablisher {
    pub fn new(ib_port: u8, gid_index: Option<u8>) -> Self {
        Self { ib_port, gid_index }
    }

    pub fn for_endpoint(endpoint: &RemoteMemoryEndpoint) -> Self {
        Self::new(endpoint.ib_port(), endpoint.gid_index())
    }

    pub fn init(&self) -> StateTransition {
        StateTransition::Init {
            port_num: self.ib_port,
            pkey_index: 0,
            access: AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        }
    }

    /// Global routing is only added when a GID index is configured.
    pub fn ready_to_receive(&self, remote: &RemoteRoutingInfo) -> StateTransition {
        StateTransition::ReadyToReceive {
            port_num: self.ib_port,
            path_mtu: PATH_MTU,
            dest_qp_num: remote.qp_num,
            dest_lid: remote.lid,
            rq_psn: START_PSN,
            max_dest_rd_atomic: 1,
            min_rnr_timer: MIN_RNR_TIMER,
            global_route: self.gid_index.map(|sgid_index| GlobalRoute {
                dgid: remote.gid,
                sgid_index,
                hop_limit: HOP_LIMIT,
                traffic_class: 0,
                flow_label: 0,
            }),
        }
    }

    pub fn ready_to_send(&self) -> StateTransition {
        StateTransition::ReadyToSend {
            timeout: RESPONSE_TIMEOUT,
            retry_count: RETRY_COUNT,
            rnr_retry: RNR_RETRY,
            sq_psn: START_PSN,
            max_rd_atomic: 1,
        }
    }

    /// Exchange routing info with the peer and bring the connection to RTS.
    ///
    /// The client pre-posts its single receive between INIT and RTR so the
    /// server's initial SEND has somewhere to land. Both sides finish by
    /// exchanging the `Q` barrier.
    pub fn establish(&self, endpoint: &mut RemoteMemoryEndpoint, msg_size: usize) -> Result<()> {
        let local = endpoint.local_routing_info()?;
        tracing::debug!("Local routing info: {}", local);

        let remote = endpoint.exchange_routing(&local)?;
        tracing::debug!("Remote routing info: {}", remote);
        endpoint.set_remote(remote);

        endpoint.transition(&self.init())?;
        if endpoint.role() == Role::Client {
            endpoint.post_receive(0, msg_size)?;
        }
        endpoint.transition(&self.ready_to_receive(&remote))?;
        endpoint.transition(&self.ready_to_send())?;
        tracing::info!("Queue pair connected to remote qp {:#x}", remote.qp_num);

        endpoint.sync(Barrier::QpReady).map_err(|e| match e {
            ProbeError::BarrierFailed { source, .. } => ProbeError::HandshakeFailed {
                context: "queue pair ready barrier",
                source,
            },
            e => e,
        })
    }
}
