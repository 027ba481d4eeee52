//! In-process loopback fabric
//!
//! Both peers hold a transport created from the same [`LoopbackFabric`] and
//! run in the same process (usually on two threads). Work requests are
//! executed synchronously while posting: the fabric looks up the peer queue
//! pair and the target memory region, copies the bytes and pushes a
//! completion onto the completion queues involved. Connection states,
//! access flags, queue depths and key checks follow the verbs rules closely
//! enough that protocol mistakes surface as the same errors real hardware
//! would report.

use super::{
    AccessFlags, CompletionStatus, ConnectionState, Gid, MemoryKeys, Opcode, PortAttributes,
    RecvRequest, Resource, SendRequest, StateTransition, Transport, WorkCompletion,
};
use crate::error::{ProbeError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;

const DEFAULT_DEVICE: &str = "loop0";
const PORT_NUM: u8 = 1;

struct Region {
    addr: u64,
    len: u64,
    access: AccessFlags,
}

impl Region {
    fn contains(&self, addr: u64, len: u32) -> bool {
        match addr.checked_add(len as u64) {
            Some(end) => addr >= self.addr && end <= self.addr + self.len,
            None => false,
        }
    }
}

struct QueuePairSlot {
    state: ConnectionState,
    access: AccessFlags,
    peer: Option<u32>,
    depth: usize,
    recv_queue: VecDeque<RecvRequest>,
    cq: Sender<WorkCompletion>,
}

struct FabricState {
    devices: Vec<String>,
    next_lid: u16,
    next_qp_num: u32,
    next_key: u32,
    regions: HashMap<u32, Region>,
    queue_pairs: HashMap<u32, QueuePairSlot>,
    failing_releases: Vec<Resource>,
}

/// Shared state of the simulated network
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<Mutex<FabricState>>,
}

impl LoopbackFabric {
    /// Create a fabric with a single device named `loop0`
    pub fn new() -> Self {
        Self::with_devices(&[DEFAULT_DEVICE])
    }

    /// Create a fabric exposing the given device names
    pub fn with_devices(names: &[&str]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FabricState {
                devices: names.iter().map(|n| n.to_string()).collect(),
                next_lid: 1,
                next_qp_num: 0x11,
                next_key: 0x100,
                regions: HashMap::new(),
                queue_pairs: HashMap::new(),
                failing_releases: Vec::new(),
            })),
        }
    }

    /// Create a transport attached to this fabric
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            fabric: self.clone(),
            device: None,
            lid: 0,
            protection_domain: false,
            cq: None,
            keys: Vec::new(),
            qp_num: None,
        }
    }

    /// Make the next release of `resource` (by any transport) fail.
    pub fn fail_release(&self, resource: Resource) {
        self.inner.lock().failing_releases.push(resource);
    }

    /// Current state of a queue pair, if it exists
    pub fn queue_pair_state(&self, qp_num: u32) -> Option<ConnectionState> {
        self.inner.lock().queue_pairs.get(&qp_num).map(|qp| qp.state)
    }

    /// Number of live memory registrations
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("LoopbackFabric")
            .field("devices", &state.devices)
            .field("queue_pairs", &state.queue_pairs.len())
            .field("regions", &state.regions.len())
            .finish()
    }
}

/// One peer's view of a [`LoopbackFabric`]
pub struct LoopbackTransport {
    fabric: LoopbackFabric,
    device: Option<String>,
    lid: u16,
    protection_domain: bool,
    cq: Option<(Sender<WorkCompletion>, Receiver<WorkCompletion>)>,
    keys: Vec<u32>,
    qp_num: Option<u32>,
}

fn not_ready(context: &'static str, what: &str) -> ProbeError {
    ProbeError::ResourceFailed {
        context,
        source: io::Error::new(io::ErrorKind::NotConnected, format!("{} not created", what)),
    }
}

impl LoopbackTransport {
    fn completion(request: &SendRequest, status: CompletionStatus) -> WorkCompletion {
        WorkCompletion {
            wr_id: request.wr_id,
            opcode: request.opcode,
            status,
            vendor_err: 0,
            byte_len: if status == CompletionStatus::Success {
                request.length
            } else {
                0
            },
        }
    }

    /// Execute `request` against the peer; returns the sender-side status.
    fn execute(state: &mut FabricState, qp_num: u32, request: &SendRequest) -> CompletionStatus {
        let local_ok = state
            .regions
            .get(&request.lkey)
            .is_some_and(|r| r.contains(request.local_addr, request.length));
        if !local_ok {
            return CompletionStatus::LocalProtectionError;
        }

        let Some(peer_num) = state.queue_pairs.get(&qp_num).and_then(|qp| qp.peer) else {
            return CompletionStatus::RetryExceeded;
        };
        let peer_access = match state.queue_pairs.get(&peer_num) {
            Some(peer) if peer.state >= ConnectionState::ReadyToReceive => peer.access,
            _ => return CompletionStatus::RetryExceeded,
        };

        match request.opcode {
            Opcode::RdmaRead | Opcode::RdmaWrite => {
                let Some(remote) = request.remote else {
                    return CompletionStatus::RemoteInvalidRequest;
                };
                let needed = if request.opcode == Opcode::RdmaRead {
                    AccessFlags::REMOTE_READ
                } else {
                    AccessFlags::REMOTE_WRITE
                };
                let remote_ok = state.regions.get(&remote.rkey).is_some_and(|r| {
                    r.access.contains(needed) && r.contains(remote.addr, request.length)
                });
                if !remote_ok || !peer_access.contains(needed) {
                    return CompletionStatus::RemoteAccessError;
                }
                let (src, dst) = if request.opcode == Opcode::RdmaRead {
                    (remote.addr, request.local_addr)
                } else {
                    (request.local_addr, remote.addr)
                };
                // SAFETY: both ranges were checked against live registrations,
                // which outlive the buffers they describe. Registrations are
                // only removed under the fabric lock held here.
                unsafe {
                    std::ptr::copy(src as *const u8, dst as *mut u8, request.length as usize);
                }
                CompletionStatus::Success
            }
            Opcode::Send => {
                let Some(peer) = state.queue_pairs.get_mut(&peer_num) else {
                    return CompletionStatus::RetryExceeded;
                };
                let Some(recv) = peer.recv_queue.pop_front() else {
                    // rnr_retry is 0: a missing receive is fatal immediately
                    return CompletionStatus::RnrRetryExceeded;
                };
                let peer_cq = peer.cq.clone();
                if request.length > recv.length {
                    let _ = peer_cq.send(WorkCompletion {
                        wr_id: recv.wr_id,
                        opcode: Opcode::Recv,
                        status: CompletionStatus::LocalLengthError,
                        vendor_err: 0,
                        byte_len: 0,
                    });
                    return CompletionStatus::RemoteInvalidRequest;
                }
                // SAFETY: as above; the receive buffer was checked when posted.
                unsafe {
                    std::ptr::copy(
                        request.local_addr as *const u8,
                        recv.local_addr as *mut u8,
                        request.length as usize,
                    );
                }
                let _ = peer_cq.send(WorkCompletion {
                    wr_id: recv.wr_id,
                    opcode: Opcode::Recv,
                    status: CompletionStatus::Success,
                    vendor_err: 0,
                    byte_len: request.length,
                });
                CompletionStatus::Success
            }
            Opcode::Recv => CompletionStatus::RemoteInvalidRequest,
        }
    }
}

impl Transport for LoopbackTransport {
    fn open(&mut self, device: Option<&str>, port: u8) -> Result<PortAttributes> {
        let mut state = self.fabric.inner.lock();
        let name = match device {
            Some(name) => state
                .devices
                .iter()
                .find(|d| d.as_str() == name)
                .cloned()
                .ok_or_else(|| ProbeError::DeviceNotFound(Some(name.to_string())))?,
            None => state
                .devices
                .first()
                .cloned()
                .ok_or(ProbeError::DeviceNotFound(None))?,
        };
        if port != PORT_NUM {
            return Err(ProbeError::PortQueryFailed {
                port,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("device {} has no port {}", name, port),
                ),
            });
        }
        self.lid = state.next_lid;
        state.next_lid += 1;
        self.device = Some(name);
        Ok(PortAttributes {
            lid: self.lid,
            active: true,
        })
    }

    fn query_gid(&self, port: u8, index: u8) -> Result<Gid> {
        if self.device.is_none() {
            return Err(not_ready("ibv_query_gid", "device context"));
        }
        if port != PORT_NUM {
            return Err(ProbeError::ResourceFailed {
                context: "ibv_query_gid",
                source: io::Error::new(io::ErrorKind::InvalidInput, "no such port"),
            });
        }
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[8] = index;
        gid[14..].copy_from_slice(&self.lid.to_be_bytes());
        Ok(Gid(gid))
    }

    fn alloc_protection_domain(&mut self) -> Result<()> {
        if self.device.is_none() {
            return Err(not_ready("ibv_alloc_pd", "device context"));
        }
        self.protection_domain = true;
        Ok(())
    }

    fn create_completion_queue(&mut self, depth: u32) -> Result<()> {
        if self.device.is_none() {
            return Err(not_ready("ibv_create_cq", "device context"));
        }
        if depth == 0 {
            return Err(ProbeError::ResourceFailed {
                context: "ibv_create_cq",
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero entries"),
            });
        }
        self.cq = Some(unbounded());
        Ok(())
    }

    unsafe fn register_memory(
        &mut self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryKeys> {
        if !self.protection_domain {
            return Err(not_ready("ibv_reg_mr", "protection domain"));
        }
        if addr.is_null() || len == 0 {
            return Err(ProbeError::RegistrationFailed {
                len,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty buffer"),
            });
        }
        let mut state = self.fabric.inner.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.regions.insert(
            key,
            Region {
                addr: addr as u64,
                len: len as u64,
                access,
            },
        );
        self.keys.push(key);
        Ok(MemoryKeys {
            lkey: key,
            rkey: key,
        })
    }

    fn create_queue_pair(&mut self, depth: u32) -> Result<u32> {
        let Some((cq, _)) = &self.cq else {
            return Err(not_ready("ibv_create_qp", "completion queue"));
        };
        if !self.protection_domain {
            return Err(not_ready("ibv_create_qp", "protection domain"));
        }
        let mut state = self.fabric.inner.lock();
        let qp_num = state.next_qp_num;
        state.next_qp_num += 1;
        state.queue_pairs.insert(
            qp_num,
            QueuePairSlot {
                state: ConnectionState::Reset,
                access: AccessFlags::empty(),
                peer: None,
                depth: depth.max(1) as usize,
                recv_queue: VecDeque::new(),
                cq: cq.clone(),
            },
        );
        self.qp_num = Some(qp_num);
        Ok(qp_num)
    }

    fn modify_queue_pair(&mut self, transition: &StateTransition) -> Result<()> {
        let target = transition.target();
        let mut state = self.fabric.inner.lock();
        let slot = self
            .qp_num
            .and_then(|n| state.queue_pairs.get_mut(&n))
            .ok_or_else(|| ProbeError::StateTransitionFailed {
                target,
                reason: "no queue pair".to_string(),
            })?;
        if slot.state.next() != Some(target) {
            return Err(ProbeError::StateTransitionFailed {
                target,
                reason: format!("queue pair is in {}", slot.state),
            });
        }
        match transition {
            StateTransition::Init { access, .. } => slot.access = *access,
            StateTransition::ReadyToReceive { dest_qp_num, .. } => slot.peer = Some(*dest_qp_num),
            StateTransition::ReadyToSend { .. } => {}
        }
        slot.state = target;
        Ok(())
    }

    fn post_send(&mut self, request: &SendRequest) -> Result<()> {
        let failed = |reason: &str| ProbeError::PostFailed {
            op: request.opcode,
            reason: reason.to_string(),
        };
        let qp_num = self.qp_num.ok_or_else(|| failed("no queue pair"))?;
        let Some((cq, _)) = &self.cq else {
            return Err(failed("no completion queue"));
        };
        if request.opcode == Opcode::Recv {
            return Err(failed("receive is not a send-queue operation"));
        }
        if request.opcode.is_rdma() && request.remote.is_none() {
            return Err(failed("missing remote address"));
        }

        let mut state = self.fabric.inner.lock();
        match state.queue_pairs.get(&qp_num) {
            Some(qp) if qp.state == ConnectionState::ReadyToSend => {}
            Some(qp) => return Err(failed(&format!("queue pair is in {}", qp.state))),
            None => return Err(failed("queue pair destroyed")),
        }
        let status = Self::execute(&mut state, qp_num, request);
        let _ = cq.send(Self::completion(request, status));
        Ok(())
    }

    fn post_recv(&mut self, request: &RecvRequest) -> Result<()> {
        let failed = |reason: String| ProbeError::PostFailed {
            op: Opcode::Recv,
            reason,
        };
        let qp_num = self.qp_num.ok_or_else(|| failed("no queue pair".to_string()))?;
        let mut state = self.fabric.inner.lock();
        let registered = state
            .regions
            .get(&request.lkey)
            .is_some_and(|r| r.contains(request.local_addr, request.length));
        let slot = state
            .queue_pairs
            .get_mut(&qp_num)
            .ok_or_else(|| failed("queue pair destroyed".to_string()))?;
        if slot.state == ConnectionState::Reset {
            return Err(failed("queue pair is in RESET".to_string()));
        }
        if slot.recv_queue.len() >= slot.depth {
            return Err(failed("receive queue full".to_string()));
        }
        if !registered {
            return Err(failed(format!("lkey {:#x} does not cover buffer", request.lkey)));
        }
        slot.recv_queue.push_back(*request);
        Ok(())
    }

    fn poll_cq(&mut self) -> Result<Option<WorkCompletion>> {
        match &self.cq {
            Some((_, rx)) => Ok(rx.try_recv().ok()),
            None => Err(not_ready("ibv_poll_cq", "completion queue")),
        }
    }

    fn release(&mut self, resource: Resource) -> Result<()> {
        let mut state = self.fabric.inner.lock();
        if let Some(pos) = state.failing_releases.iter().position(|r| *r == resource) {
            state.failing_releases.remove(pos);
            return Err(ProbeError::ResourceFailed {
                context: resource.name(),
                source: io::Error::other("injected release failure"),
            });
        }
        let held = match resource {
            Resource::QueuePair => self
                .qp_num
                .take()
                .map(|n| state.queue_pairs.remove(&n))
                .is_some(),
            Resource::MemoryRegion => {
                let held = !self.keys.is_empty();
                for key in self.keys.drain(..) {
                    state.regions.remove(&key);
                }
                held
            }
            Resource::CompletionQueue => self.cq.take().is_some(),
            Resource::ProtectionDomain => std::mem::replace(&mut self.protection_domain, false),
            Resource::Device => self.device.take().is_some(),
        };
        if !held {
            return Err(ProbeError::ResourceFailed {
                context: resource.name(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not allocated"),
            });
        }
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut state = self.fabric.inner.lock();
        if let Some(qp_num) = self.qp_num.take() {
            state.queue_pairs.remove(&qp_num);
        }
        for key in self.keys.drain(..) {
            state.regions.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PathMtu, RemoteAddress};

    struct Peer {
        transport: LoopbackTransport,
        buffer: Vec<u8>,
        keys: MemoryKeys,
        qp_num: u32,
    }

    fn peer(fabric: &LoopbackFabric, fill: u8) -> Peer {
        let mut transport = fabric.transport();
        transport.open(None, 1).unwrap();
        transport.alloc_protection_domain().unwrap();
        transport.create_completion_queue(1).unwrap();
        let mut buffer = vec![fill; 64];
        let keys = unsafe {
            transport.register_memory(
                buffer.as_mut_ptr(),
                buffer.len(),
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
            )
        }
        .unwrap();
        let qp_num = transport.create_queue_pair(1).unwrap();
        Peer {
            transport,
            buffer,
            keys,
            qp_num,
        }
    }

    fn connect(a: &mut Peer, b_qp: u32) {
        let transitions = [
            StateTransition::Init {
                port_num: 1,
                pkey_index: 0,
                access: AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
            },
            StateTransition::ReadyToReceive {
                port_num: 1,
                path_mtu: PathMtu::Mtu2048,
                dest_qp_num: b_qp,
                dest_lid: 0,
                rq_psn: 0,
                max_dest_rd_atomic: 1,
                min_rnr_timer: 0x12,
                global_route: None,
            },
            StateTransition::ReadyToSend {
                timeout: 0x12,
                retry_count: 6,
                rnr_retry: 0,
                sq_psn: 0,
                max_rd_atomic: 1,
            },
        ];
        for t in &transitions {
            a.transport.modify_queue_pair(t).unwrap();
        }
    }

    fn read_request(local: &Peer, remote: &Peer, offset: u64) -> SendRequest {
        SendRequest {
            wr_id: 0,
            opcode: Opcode::RdmaRead,
            local_addr: local.buffer.as_ptr() as u64,
            length: 8,
            lkey: local.keys.lkey,
            remote: Some(RemoteAddress {
                addr: remote.buffer.as_ptr() as u64 + offset,
                rkey: remote.keys.rkey,
            }),
        }
    }

    #[test]
    fn test_rdma_read_copies_remote_bytes() {
        let fabric = LoopbackFabric::new();
        let mut a = peer(&fabric, 0);
        let mut b = peer(&fabric, 7);
        let (a_qp, b_qp) = (a.qp_num, b.qp_num);
        connect(&mut a, b_qp);
        connect(&mut b, a_qp);

        let request = read_request(&a, &b, 0);
        a.transport.post_send(&request).unwrap();
        let wc = a.transport.poll_cq().unwrap().unwrap();
        assert_eq!(wc.status, CompletionStatus::Success);
        assert_eq!(wc.byte_len, 8);
        assert_eq!(&a.buffer[..8], &[7u8; 8]);
        assert!(a.transport.poll_cq().unwrap().is_none());
    }

    #[test]
    fn test_out_of_bounds_read_is_remote_access_error() {
        let fabric = LoopbackFabric::new();
        let mut a = peer(&fabric, 0);
        let mut b = peer(&fabric, 7);
        let (a_qp, b_qp) = (a.qp_num, b.qp_num);
        connect(&mut a, b_qp);
        connect(&mut b, a_qp);

        let request = read_request(&a, &b, 60);
        a.transport.post_send(&request).unwrap();
        let wc = a.transport.poll_cq().unwrap().unwrap();
        assert_eq!(wc.status, CompletionStatus::RemoteAccessError);
    }

    #[test]
    fn test_send_without_receive_is_rnr_error() {
        let fabric = LoopbackFabric::new();
        let mut a = peer(&fabric, 0);
        let mut b = peer(&fabric, 7);
        let (a_qp, b_qp) = (a.qp_num, b.qp_num);
        connect(&mut a, b_qp);
        connect(&mut b, a_qp);

        let mut request = read_request(&b, &a, 0);
        request.opcode = Opcode::Send;
        request.remote = None;
        b.transport.post_send(&request).unwrap();
        let wc = b.transport.poll_cq().unwrap().unwrap();
        assert_eq!(wc.status, CompletionStatus::RnrRetryExceeded);
    }

    #[test]
    fn test_post_before_ready_to_send_fails() {
        let fabric = LoopbackFabric::new();
        let mut a = peer(&fabric, 0);
        let b = peer(&fabric, 7);
        let request = read_request(&a, &b, 0);
        let err = a.transport.post_send(&request).unwrap_err();
        assert!(matches!(err, ProbeError::PostFailed { .. }));
    }

    #[test]
    fn test_skipping_a_state_is_rejected() {
        let fabric = LoopbackFabric::new();
        let mut a = peer(&fabric, 0);
        let err = a
            .transport
            .modify_queue_pair(&StateTransition::ReadyToSend {
                timeout: 0x12,
                retry_count: 6,
                rnr_retry: 0,
                sq_psn: 0,
                max_rd_atomic: 1,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::StateTransitionFailed {
                target: ConnectionState::ReadyToSend,
                ..
            }
        ));
        assert_eq!(fabric.queue_pair_state(a.qp_num), Some(ConnectionState::Reset));
    }

    #[test]
    fn test_unknown_device() {
        let fabric = LoopbackFabric::with_devices(&["mlx5_0"]);
        let mut t = fabric.transport();
        assert!(matches!(
            t.open(Some("mlx5_9"), 1),
            Err(ProbeError::DeviceNotFound(Some(_)))
        ));
        assert!(matches!(t.open(None, 2), Err(ProbeError::PortQueryFailed { port: 2, .. })));

        let empty = LoopbackFabric::with_devices(&[]);
        assert!(matches!(
            empty.transport().open(None, 1),
            Err(ProbeError::DeviceNotFound(None))
        ));
    }

    #[test]
    fn test_drop_unregisters_memory() {
        let fabric = LoopbackFabric::new();
        let a = peer(&fabric, 0);
        assert_eq!(fabric.region_count(), 1);
        drop(a);
        assert_eq!(fabric.region_count(), 0);
    }
}
