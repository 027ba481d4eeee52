//! One side of the RDMA connection and everything it owns
//!
//! An endpoint holds the device context, protection domain, completion
//! queue, registered buffer, queue pair and rendezvous socket of its role.
//! Only one send-queue and one receive-queue operation may be outstanding
//! at a time. Resources are released in reverse order of creation, either
//! explicitly with [`RemoteMemoryEndpoint::close`] or on drop.

use crate::config::Role;
use crate::error::{ProbeError, Result};
use crate::memory::ProbeBuffer;
use crate::protocol::{Barrier, RemoteRoutingInfo, ROUTING_RECORD_LEN};
use crate::rendezvous::RendezvousChannel;
use crate::transport::{
    AccessFlags, CompletionStatus, ConnectionState, Gid, MemoryKeys, Opcode, PortAttributes,
    RecvRequest, RemoteAddress, Resource, SendRequest, StateTransition, Transport,
    TransportConfig, WorkCompletion,
};
use std::io;
use std::time::{Duration, Instant};

/// Depth of both work queues and of the completion queue
const QUEUE_DEPTH: u32 = 1;

pub(crate) fn not_registered() -> ProbeError {
    ProbeError::ResourceFailed {
        context: "memory region",
        source: io::Error::new(io::ErrorKind::NotConnected, "buffer not registered"),
    }
}

pub struct RemoteMemoryEndpoint {
    role: Role,
    transport: Box<dyn Transport>,
    ib_port: u8,
    gid_index: Option<u8>,
    port: Option<PortAttributes>,
    buffer: Option<ProbeBuffer>,
    keys: Option<MemoryKeys>,
    qp_num: Option<u32>,
    state: ConnectionState,
    remote: Option<RemoteRoutingInfo>,
    channel: Option<RendezvousChannel>,
    next_wr_id: u64,
    /// `wr_id` of the outstanding send-queue operation
    send_outstanding: Option<u64>,
    /// `wr_id` of the posted receive
    recv_outstanding: Option<u64>,
    acquired: Vec<Resource>,
}

impl RemoteMemoryEndpoint {
    /// Open the configured device and port, then allocate a protection
    /// domain and a completion queue.
    ///
    /// Anything acquired before a failure is released again.
    pub fn open(
        role: Role,
        transport: Box<dyn Transport>,
        config: &TransportConfig,
        channel: RendezvousChannel,
    ) -> Result<Self> {
        let mut endpoint = Self {
            role,
            transport,
            ib_port: config.ib_port,
            gid_index: config.gid_index,
            port: None,
            buffer: None,
            keys: None,
            qp_num: None,
            state: ConnectionState::Reset,
            remote: None,
            channel: Some(channel),
            next_wr_id: 0,
            send_outstanding: None,
            recv_outstanding: None,
            acquired: Vec::new(),
        };

        let port = endpoint
            .transport
            .open(config.device.as_deref(), config.ib_port)?;
        endpoint.acquired.push(Resource::Device);
        if !port.active {
            tracing::warn!("Port {} is not active", config.ib_port);
        }
        tracing::debug!("Opened port {} with lid {:#x}", config.ib_port, port.lid);
        endpoint.port = Some(port);

        endpoint.transport.alloc_protection_domain()?;
        endpoint.acquired.push(Resource::ProtectionDomain);
        endpoint.transport.create_completion_queue(QUEUE_DEPTH)?;
        endpoint.acquired.push(Resource::CompletionQueue);
        Ok(endpoint)
    }

    /// Allocate and register this side's buffer, then create the queue pair.
    ///
    /// The server's buffer holds `i as u8` in every byte of its `i`-th
    /// `cell_size` cell; the client's is zeroed.
    pub fn allocate_and_register(
        &mut self,
        size: usize,
        cell_size: usize,
        access: AccessFlags,
    ) -> Result<()> {
        let mut buffer = match self.role {
            Role::Server => ProbeBuffer::patterned(size, cell_size)?,
            Role::Client => ProbeBuffer::zeroed(size)?,
        };
        if let Err(e) = buffer.lock() {
            tracing::warn!("Could not lock {} buffer bytes in memory: {}", size, e);
        }
        let (addr, len) = (buffer.as_mut_ptr(), buffer.len());
        self.buffer = Some(buffer);

        // SAFETY: the buffer is only freed in `teardown`, after the
        // registration has been released.
        let keys = unsafe { self.transport.register_memory(addr, len, access)? };
        self.acquired.push(Resource::MemoryRegion);
        self.keys = Some(keys);
        tracing::debug!(
            "Registered {} bytes at {:#x} (lkey {:#x}, rkey {:#x})",
            len,
            addr as u64,
            keys.lkey,
            keys.rkey
        );

        self.create_connection()
    }

    fn create_connection(&mut self) -> Result<()> {
        let qp_num = self.transport.create_queue_pair(QUEUE_DEPTH)?;
        self.acquired.push(Resource::QueuePair);
        self.qp_num = Some(qp_num);
        self.state = ConnectionState::Reset;
        tracing::debug!("Created queue pair {:#x}", qp_num);
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ib_port(&self) -> u8 {
        self.ib_port
    }

    pub fn gid_index(&self) -> Option<u8> {
        self.gid_index
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn buffer(&self) -> Option<&ProbeBuffer> {
        self.buffer.as_ref()
    }

    /// Volatile load of one byte of the registered buffer
    pub fn local_byte(&self, offset: usize) -> Result<u8> {
        self.registered()?.0.byte(offset)
    }

    /// Volatile store of one byte of the registered buffer
    pub fn set_local_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        match (self.buffer.as_mut(), self.keys) {
            (Some(buffer), Some(_)) => buffer.set_byte(offset, value),
            _ => Err(not_registered()),
        }
    }

    /// Routing info received from the peer during the handshake
    pub fn remote(&self) -> Option<&RemoteRoutingInfo> {
        self.remote.as_ref()
    }

    pub fn set_remote(&mut self, remote: RemoteRoutingInfo) {
        self.remote = Some(remote);
    }

    /// Remote address the next RDMA operation targets
    pub fn remote_target(&self) -> Option<u64> {
        self.remote.map(|r| r.addr)
    }

    fn registered(&self) -> Result<(&ProbeBuffer, MemoryKeys)> {
        match (&self.buffer, self.keys) {
            (Some(buffer), Some(keys)) => Ok((buffer, keys)),
            _ => Err(not_registered()),
        }
    }

    /// What the peer needs to reach this endpoint. The GID is only queried
    /// when a GID index is configured and is all zero otherwise.
    pub fn local_routing_info(&self) -> Result<RemoteRoutingInfo> {
        let (buffer, keys) = self.registered()?;
        let qp_num = self.qp_num.ok_or_else(|| ProbeError::ResourceFailed {
            context: "queue pair",
            source: io::Error::new(io::ErrorKind::NotConnected, "queue pair not created"),
        })?;
        let gid = match self.gid_index {
            Some(index) => self.transport.query_gid(self.ib_port, index)?,
            None => Gid::default(),
        };
        Ok(RemoteRoutingInfo {
            addr: buffer.addr(),
            rkey: keys.rkey,
            qp_num,
            lid: self.port.map_or(0, |p| p.lid),
            gid,
        })
    }

    /// Move the connection one state forward.
    ///
    /// A transition that is not the immediate successor of the current
    /// state is rejected before the transport sees it.
    pub fn transition(&mut self, transition: &StateTransition) -> Result<()> {
        let target = transition.target();
        if self.state.next() != Some(target) {
            return Err(ProbeError::StateTransitionFailed {
                target,
                reason: format!("connection is in {}", self.state),
            });
        }
        self.transport.modify_queue_pair(transition)?;
        self.state = target;
        tracing::debug!("Queue pair moved to {}", target);
        Ok(())
    }

    /// Post one signalled send-queue operation on `length` bytes at
    /// `local_offset`. RDMA kinds target [`Self::remote_target`].
    pub fn post_operation(&mut self, kind: Opcode, local_offset: usize, length: usize) -> Result<()> {
        let failed = |reason: &str| ProbeError::PostFailed {
            op: kind,
            reason: reason.to_string(),
        };
        if kind == Opcode::Recv {
            return Err(failed("use post_receive for receives"));
        }
        if self.send_outstanding.is_some() {
            return Err(failed("another send-queue operation is outstanding"));
        }
        let (buffer, keys) = self.registered()?;
        if !buffer.contains(local_offset, length) {
            return Err(failed("local range outside the registered buffer"));
        }
        let length = u32::try_from(length).map_err(|_| failed("length exceeds u32"))?;
        let remote = if kind.is_rdma() {
            let remote = self.remote.ok_or_else(|| failed("no remote routing info"))?;
            Some(RemoteAddress {
                addr: remote.addr,
                rkey: remote.rkey,
            })
        } else {
            None
        };

        let request = SendRequest {
            wr_id: self.next_wr_id,
            opcode: kind,
            local_addr: buffer.addr() + local_offset as u64,
            length,
            lkey: keys.lkey,
            remote,
        };
        self.transport.post_send(&request)?;
        self.send_outstanding = Some(request.wr_id);
        self.next_wr_id += 1;
        Ok(())
    }

    /// Pre-post the single receive buffer.
    pub fn post_receive(&mut self, local_offset: usize, length: usize) -> Result<()> {
        let failed = |reason: &str| ProbeError::PostFailed {
            op: Opcode::Recv,
            reason: reason.to_string(),
        };
        if self.recv_outstanding.is_some() {
            return Err(failed("a receive is already posted"));
        }
        let (buffer, keys) = self.registered()?;
        if !buffer.contains(local_offset, length) {
            return Err(failed("local range outside the registered buffer"));
        }
        let request = RecvRequest {
            wr_id: self.next_wr_id,
            local_addr: buffer.addr() + local_offset as u64,
            length: u32::try_from(length).map_err(|_| failed("length exceeds u32"))?,
            lkey: keys.lkey,
        };
        self.transport.post_recv(&request)?;
        self.recv_outstanding = Some(request.wr_id);
        self.next_wr_id += 1;
        Ok(())
    }

    /// Match a completion to its request by `wr_id`; the opcode of a failed
    /// completion is undefined.
    fn complete(&mut self, wc: WorkCompletion) -> Result<WorkCompletion> {
        if self.recv_outstanding == Some(wc.wr_id) {
            self.recv_outstanding = None;
        } else if self.send_outstanding == Some(wc.wr_id) {
            self.send_outstanding = None;
        } else {
            tracing::warn!("Completion for unknown work request {}", wc.wr_id);
        }
        tracing::trace!("Completion {} with status {}", wc.wr_id, wc.status);
        if wc.status != CompletionStatus::Success {
            return Err(ProbeError::CompletionError {
                status: wc.status,
                vendor_err: wc.vendor_err,
            });
        }
        Ok(wc)
    }

    /// Busy-poll for one completion until `timeout` has passed since entry.
    pub fn poll_completion(&mut self, timeout: Duration) -> Result<WorkCompletion> {
        let start = Instant::now();
        loop {
            if let Some(wc) = self.transport.poll_cq()? {
                return self.complete(wc);
            }
            if start.elapsed() >= timeout {
                return Err(ProbeError::Timeout(timeout));
            }
            std::hint::spin_loop();
        }
    }

    /// Busy-poll for one completion without a deadline.
    #[inline]
    pub fn poll_until_complete(&mut self) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.transport.poll_cq()? {
                return self.complete(wc);
            }
        }
    }

    /// Run `f` with the remote target moved to `addr`; the previous target
    /// is restored whether `f` succeeds or not.
    pub fn with_remote_target<R>(
        &mut self,
        addr: u64,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let original = self.remote.as_mut().map(|remote| std::mem::replace(&mut remote.addr, addr));
        let Some(original) = original else {
            return Err(ProbeError::PostFailed {
                op: Opcode::RdmaRead,
                reason: "no remote routing info".to_string(),
            });
        };
        let result = f(self);
        if let Some(remote) = self.remote.as_mut() {
            remote.addr = original;
        }
        result
    }

    fn channel(&mut self) -> io::Result<&mut RendezvousChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "rendezvous socket closed"))
    }

    /// Exchange a barrier byte with the peer.
    pub fn sync(&mut self, barrier: Barrier) -> Result<()> {
        self.channel()
            .and_then(|channel| channel.sync(barrier))
            .map_err(|source| ProbeError::BarrierFailed { barrier, source })
    }

    /// Swap routing records with the peer in one round trip.
    pub fn exchange_routing(&mut self, local: &RemoteRoutingInfo) -> Result<RemoteRoutingInfo> {
        let handshake = |context: &'static str| {
            move |source: io::Error| ProbeError::HandshakeFailed { context, source }
        };

        let encoded = local.encode().map_err(handshake("encode routing record"))?;
        let mut received = [0u8; ROUTING_RECORD_LEN];
        self.channel()
            .and_then(|channel| channel.exchange(&encoded, &mut received))
            .map_err(handshake("exchange routing record"))?;
        RemoteRoutingInfo::decode(&received).map_err(handshake("decode routing record"))
    }

    /// Release everything, reporting every step that failed.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn release(&mut self, resource: Resource, failed: &mut Vec<&'static str>) -> bool {
        let Some(pos) = self.acquired.iter().position(|r| *r == resource) else {
            return true;
        };
        self.acquired.remove(pos);
        match self.transport.release(resource) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to release {}: {}", resource.name(), e);
                failed.push(resource.name());
                false
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        let mut failed = Vec::new();

        self.release(Resource::QueuePair, &mut failed);
        self.qp_num = None;
        self.state = ConnectionState::Reset;
        self.send_outstanding = None;
        self.recv_outstanding = None;

        let unregistered = self.release(Resource::MemoryRegion, &mut failed);
        self.keys = None;
        if let Some(buffer) = self.buffer.take() {
            if unregistered {
                drop(buffer);
            } else {
                // the device may still write into it
                tracing::error!("Leaking {} byte buffer that is still registered", buffer.len());
                std::mem::forget(buffer);
                failed.push("buffer");
            }
        }

        self.release(Resource::CompletionQueue, &mut failed);
        self.release(Resource::ProtectionDomain, &mut failed);
        self.release(Resource::Device, &mut failed);

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.shutdown() {
                tracing::error!("Failed to close rendezvous socket: {}", e);
                failed.push("rendezvous socket");
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ProbeError::TeardownFailed(failed))
        }
    }
}

impl Drop for RemoteMemoryEndpoint {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("{}", e);
        }
    }
}

impl std::fmt::Debug for RemoteMemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMemoryEndpoint")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("qp_num", &self.qp_num)
            .field("buffer", &self.buffer)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{channel_pair, connected_pair, loopback_config, open_endpoint};
    use crate::connection::ConnectionEstablisher;
    use crate::transport::{LoopbackFabric, LoopbackTransport, PathMtu};
    use std::thread;

    fn access() -> AccessFlags {
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE
    }

    #[test]
    fn test_open_unknown_device() {
        let fabric = LoopbackFabric::new();
        let (_peer, channel) = channel_pair();
        let config = TransportConfig {
            device: Some("mlx5_9".to_string()),
            ..loopback_config(&fabric)
        };
        let transport = Box::new(fabric.transport());
        let err = RemoteMemoryEndpoint::open(Role::Client, transport, &config, channel).unwrap_err();
        assert!(matches!(err, ProbeError::DeviceNotFound(Some(name)) if name == "mlx5_9"));
    }

    #[test]
    fn test_server_buffer_is_patterned() {
        let fabric = LoopbackFabric::new();
        let (_peer, channel) = channel_pair();
        let mut server = open_endpoint(&fabric, Role::Server, channel);
        server.allocate_and_register(4 * 8, 8, access()).unwrap();

        assert_eq!(server.local_byte(0).unwrap(), 0);
        assert_eq!(server.local_byte(8).unwrap(), 1);
        assert_eq!(server.local_byte(3 * 8 + 7).unwrap(), 3);
        assert_eq!(server.state(), ConnectionState::Reset);
        assert_eq!(fabric.region_count(), 1);

        let info = server.local_routing_info().unwrap();
        assert_eq!(info.addr, server.buffer().unwrap().addr());
        assert!(info.gid.is_zero());
    }

    #[test]
    fn test_out_of_order_transition_is_rejected() {
        let fabric = LoopbackFabric::new();
        let (_peer, channel) = channel_pair();
        let mut client = open_endpoint(&fabric, Role::Client, channel);
        client.allocate_and_register(8, 8, access()).unwrap();

        let err = client
            .transition(&StateTransition::ReadyToReceive {
                port_num: 1,
                path_mtu: PathMtu::Mtu2048,
                dest_qp_num: 0x11,
                dest_lid: 1,
                rq_psn: 0,
                max_dest_rd_atomic: 1,
                min_rnr_timer: 0x12,
                global_route: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::StateTransitionFailed {
                target: ConnectionState::ReadyToReceive,
                ..
            }
        ));
        assert_eq!(client.state(), ConnectionState::Reset);
    }

    #[test]
    fn test_poll_times_out_when_nothing_is_posted() {
        let fabric = LoopbackFabric::new();
        let (_server, mut client) = connected_pair(&fabric, 8, 1, 1);

        let start = Instant::now();
        let err = client.poll_completion(Duration::from_millis(50)).unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, ProbeError::Timeout(t) if t == Duration::from_millis(50)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed <= Duration::from_millis(100));
    }

    #[test]
    fn test_single_outstanding_operation() {
        let fabric = LoopbackFabric::new();
        let (_server, mut client) = connected_pair(&fabric, 8, 2, 2);

        client.post_operation(Opcode::RdmaRead, 0, 8).unwrap();
        let err = client.post_operation(Opcode::RdmaRead, 0, 8).unwrap_err();
        assert!(matches!(err, ProbeError::PostFailed { op: Opcode::RdmaRead, .. }));

        let wc = client.poll_completion(Duration::from_secs(1)).unwrap();
        assert_eq!(wc.opcode, Opcode::RdmaRead);
        assert_eq!(wc.status, CompletionStatus::Success);
        client.post_operation(Opcode::RdmaRead, 0, 8).unwrap();
        client.poll_until_complete().unwrap();
    }

    #[test]
    fn test_post_outside_local_buffer() {
        let fabric = LoopbackFabric::new();
        let (_server, mut client) = connected_pair(&fabric, 8, 1, 1);
        let err = client.post_operation(Opcode::RdmaWrite, 4, 8).unwrap_err();
        assert!(matches!(err, ProbeError::PostFailed { op: Opcode::RdmaWrite, .. }));
    }

    #[test]
    fn test_remote_target_restored_after_closure() {
        let fabric = LoopbackFabric::new();
        let (_server, mut client) = connected_pair(&fabric, 8, 2, 2);
        let base = client.remote_target().unwrap();

        let seen = client
            .with_remote_target(base + 16, |endpoint| Ok(endpoint.remote_target()))
            .unwrap();
        assert_eq!(seen, Some(base + 16));
        assert_eq!(client.remote_target(), Some(base));
    }

    #[test]
    fn test_close_releases_everything() {
        let fabric = LoopbackFabric::new();
        let (server, client) = connected_pair(&fabric, 8, 2, 2);
        assert_eq!(fabric.region_count(), 2);

        client.close().unwrap();
        assert_eq!(fabric.region_count(), 1);
        server.close().unwrap();
        assert_eq!(fabric.region_count(), 0);
    }

    #[test]
    fn test_teardown_reports_every_failure() {
        let fabric = LoopbackFabric::new();
        let (_peer, channel) = channel_pair();
        let mut client = open_endpoint(&fabric, Role::Client, channel);
        client.allocate_and_register(8, 8, access()).unwrap();

        fabric.fail_release(Resource::MemoryRegion);
        fabric.fail_release(Resource::ProtectionDomain);
        match client.close() {
            Err(ProbeError::TeardownFailed(failed)) => {
                assert_eq!(failed, vec!["memory region", "buffer", "protection domain"]);
            }
            other => panic!("unexpected teardown result: {:?}", other),
        }
    }

    /// Reports failed completions with a meaningless opcode, as verbs may.
    struct UndefinedErrorOpcode(LoopbackTransport);

    impl Transport for UndefinedErrorOpcode {
        fn open(&mut self, device: Option<&str>, port: u8) -> Result<PortAttributes> {
            self.0.open(device, port)
        }
        fn query_gid(&self, port: u8, index: u8) -> Result<Gid> {
            self.0.query_gid(port, index)
        }
        fn alloc_protection_domain(&mut self) -> Result<()> {
            self.0.alloc_protection_domain()
        }
        fn create_completion_queue(&mut self, depth: u32) -> Result<()> {
            self.0.create_completion_queue(depth)
        }
        unsafe fn register_memory(
            &mut self,
            addr: *mut u8,
            len: usize,
            access: AccessFlags,
        ) -> Result<MemoryKeys> {
            self.0.register_memory(addr, len, access)
        }
        fn create_queue_pair(&mut self, depth: u32) -> Result<u32> {
            self.0.create_queue_pair(depth)
        }
        fn modify_queue_pair(&mut self, transition: &StateTransition) -> Result<()> {
            self.0.modify_queue_pair(transition)
        }
        fn post_send(&mut self, request: &SendRequest) -> Result<()> {
            self.0.post_send(request)
        }
        fn post_recv(&mut self, request: &RecvRequest) -> Result<()> {
            self.0.post_recv(request)
        }
        fn poll_cq(&mut self) -> Result<Option<WorkCompletion>> {
            Ok(self.0.poll_cq()?.map(|mut wc| {
                if wc.status != CompletionStatus::Success {
                    wc.opcode = Opcode::RdmaWrite;
                }
                wc
            }))
        }
        fn release(&mut self, resource: Resource) -> Result<()> {
            self.0.release(resource)
        }
    }

    #[test]
    fn test_failed_receive_is_matched_by_wr_id() {
        let fabric = LoopbackFabric::new();
        let (server_channel, client_channel) = channel_pair();

        let server_fabric = fabric.clone();
        let server = thread::spawn(move || {
            let mut server = open_endpoint(&server_fabric, Role::Server, server_channel);
            server.allocate_and_register(32, 8, access()).unwrap();
            ConnectionEstablisher::for_endpoint(&server)
                .establish(&mut server, 8)
                .unwrap();
            server
        });

        let config = loopback_config(&fabric);
        let transport = Box::new(UndefinedErrorOpcode(fabric.transport()));
        let mut client =
            RemoteMemoryEndpoint::open(Role::Client, transport, &config, client_channel).unwrap();
        client.allocate_and_register(8, 8, access()).unwrap();
        ConnectionEstablisher::for_endpoint(&client)
            .establish(&mut client, 8)
            .unwrap();
        let mut server = server.join().unwrap();

        // longer than the 8-byte receive the client pre-posted
        server.post_operation(Opcode::Send, 0, 16).unwrap();
        assert!(server.poll_completion(Duration::from_secs(1)).is_err());

        let err = client.poll_completion(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::CompletionError {
                status: CompletionStatus::LocalLengthError,
                ..
            }
        ));
        // the receive slot is free again and the send queue was never used
        client.post_receive(0, 8).unwrap();
        client.post_operation(Opcode::RdmaRead, 0, 8).unwrap();
        client.poll_until_complete().unwrap();
    }
}
