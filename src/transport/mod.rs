//! RDMA transport abstraction
//!
//! This module models the verbs library as a capability object: open a
//! device, register memory, configure a reliable connection, post work
//! requests and poll for completions. There is an in-process loopback
//! implementation for testing without RDMA hardware, and a libibverbs
//! implementation behind the `rdma` feature.

mod loopback;
#[cfg(feature = "rdma")]
mod verbs;

pub use loopback::{LoopbackFabric, LoopbackTransport};

use crate::error::Result;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Memory and connection access flags, valued as in libibverbs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

/// Global identifier of a port (an IPv6-formatted address on RoCE).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Attributes of the local port that the handshake needs
#[derive(Clone, Copy, Debug)]
pub struct PortAttributes {
    /// Local identifier of the port
    pub lid: u16,
    /// Whether the port reported an active link
    pub active: bool,
}

/// Keys handed out by a memory registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// Resources a transport hands out, in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Device,
    ProtectionDomain,
    CompletionQueue,
    MemoryRegion,
    QueuePair,
}

impl Resource {
    pub fn name(&self) -> &'static str {
        match self {
            Resource::Device => "device context",
            Resource::ProtectionDomain => "protection domain",
            Resource::CompletionQueue => "completion queue",
            Resource::MemoryRegion => "memory region",
            Resource::QueuePair => "queue pair",
        }
    }
}

/// Configuration stages of a reliable connection.
///
/// Stages only move forward; see [`ConnectionState::next`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    #[default]
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

impl ConnectionState {
    /// The only state reachable from `self`, if any.
    pub fn next(self) -> Option<ConnectionState> {
        match self {
            ConnectionState::Reset => Some(ConnectionState::Init),
            ConnectionState::Init => Some(ConnectionState::ReadyToReceive),
            ConnectionState::ReadyToReceive => Some(ConnectionState::ReadyToSend),
            ConnectionState::ReadyToSend => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Reset => "RESET",
            ConnectionState::Init => "INIT",
            ConnectionState::ReadyToReceive => "RTR",
            ConnectionState::ReadyToSend => "RTS",
        })
    }
}

/// Path MTU of the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathMtu {
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl PathMtu {
    /// Value of the matching `ibv_mtu` enumerator.
    pub fn as_raw(self) -> u32 {
        match self {
            PathMtu::Mtu1024 => 3,
            PathMtu::Mtu2048 => 4,
            PathMtu::Mtu4096 => 5,
        }
    }
}

/// Global routing header data, only used when a GID index is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
}

/// Attribute subset for one connection state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateTransition {
    Init {
        port_num: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    ReadyToReceive {
        port_num: u8,
        path_mtu: PathMtu,
        dest_qp_num: u32,
        dest_lid: u16,
        rq_psn: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
        global_route: Option<GlobalRoute>,
    },
    ReadyToSend {
        timeout: u8,
        retry_count: u8,
        rnr_retry: u8,
        sq_psn: u32,
        max_rd_atomic: u8,
    },
}

impl StateTransition {
    /// The state this transition moves the connection into.
    pub fn target(&self) -> ConnectionState {
        match self {
            StateTransition::Init { .. } => ConnectionState::Init,
            StateTransition::ReadyToReceive { .. } => ConnectionState::ReadyToReceive,
            StateTransition::ReadyToSend { .. } => ConnectionState::ReadyToSend,
        }
    }
}

/// Work request kinds, plus the receive kind reported by completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Send,
    RdmaRead,
    RdmaWrite,
    Recv,
}

impl Opcode {
    pub fn is_rdma(self) -> bool {
        matches!(self, Opcode::RdmaRead | Opcode::RdmaWrite)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Opcode::Send => "SEND",
            Opcode::RdmaRead => "RDMA_READ",
            Opcode::RdmaWrite => "RDMA_WRITE",
            Opcode::Recv => "RECV",
        })
    }
}

/// Remote half of an RDMA read or write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteAddress {
    pub addr: u64,
    pub rkey: u32,
}

/// A signalled send-queue work request with a single scatter/gather entry.
#[derive(Clone, Copy, Debug)]
pub struct SendRequest {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub local_addr: u64,
    pub length: u32,
    pub lkey: u32,
    pub remote: Option<RemoteAddress>,
}

/// A receive-queue work request with a single scatter/gather entry.
#[derive(Clone, Copy, Debug)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub local_addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Completion status, named after the `ibv_wc_status` values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    RemoteInvalidRequest,
    RemoteAccessError,
    RetryExceeded,
    RnrRetryExceeded,
    Other(u32),
}

impl CompletionStatus {
    pub fn from_raw(status: u32) -> Self {
        match status {
            0 => CompletionStatus::Success,
            1 => CompletionStatus::LocalLengthError,
            4 => CompletionStatus::LocalProtectionError,
            5 => CompletionStatus::WorkRequestFlushed,
            9 => CompletionStatus::RemoteInvalidRequest,
            10 => CompletionStatus::RemoteAccessError,
            12 => CompletionStatus::RetryExceeded,
            13 => CompletionStatus::RnrRetryExceeded,
            other => CompletionStatus::Other(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            CompletionStatus::Success => 0,
            CompletionStatus::LocalLengthError => 1,
            CompletionStatus::LocalProtectionError => 4,
            CompletionStatus::WorkRequestFlushed => 5,
            CompletionStatus::RemoteInvalidRequest => 9,
            CompletionStatus::RemoteAccessError => 10,
            CompletionStatus::RetryExceeded => 12,
            CompletionStatus::RnrRetryExceeded => 13,
            CompletionStatus::Other(other) => other,
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => f.write_str("success"),
            CompletionStatus::LocalLengthError => f.write_str("local length error"),
            CompletionStatus::LocalProtectionError => f.write_str("local protection error"),
            CompletionStatus::WorkRequestFlushed => f.write_str("work request flushed"),
            CompletionStatus::RemoteInvalidRequest => f.write_str("remote invalid request"),
            CompletionStatus::RemoteAccessError => f.write_str("remote access error"),
            CompletionStatus::RetryExceeded => f.write_str("transport retry counter exceeded"),
            CompletionStatus::RnrRetryExceeded => f.write_str("RNR retry counter exceeded"),
            CompletionStatus::Other(code) => write!(f, "{:#x}", code),
        }
    }
}

/// One entry popped from the completion queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub status: CompletionStatus,
    pub vendor_err: u32,
    pub byte_len: u32,
}

/// Capability object over an RDMA device.
///
/// One transport backs exactly one endpoint: one device context, one
/// protection domain, one completion queue, one memory region and one
/// reliable-connection queue pair.
pub trait Transport: Send {
    /// Open the named device, or the first one found, and query `port`.
    fn open(&mut self, device: Option<&str>, port: u8) -> Result<PortAttributes>;

    /// Look up the GID at `index` of `port`.
    fn query_gid(&self, port: u8, index: u8) -> Result<Gid>;

    fn alloc_protection_domain(&mut self) -> Result<()>;

    fn create_completion_queue(&mut self, depth: u32) -> Result<()>;

    /// Register `len` bytes starting at `addr`.
    ///
    /// # Safety
    /// The memory must stay valid until [`Resource::MemoryRegion`] is released.
    unsafe fn register_memory(
        &mut self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryKeys>;

    /// Create the reliable-connection queue pair; returns its number.
    fn create_queue_pair(&mut self, depth: u32) -> Result<u32>;

    /// Apply one state transition to the queue pair.
    fn modify_queue_pair(&mut self, transition: &StateTransition) -> Result<()>;

    fn post_send(&mut self, request: &SendRequest) -> Result<()>;

    fn post_recv(&mut self, request: &RecvRequest) -> Result<()>;

    /// Pop at most one completion (non-blocking).
    fn poll_cq(&mut self) -> Result<Option<WorkCompletion>>;

    fn release(&mut self, resource: Resource) -> Result<()>;
}

/// Which transport implementation backs an endpoint
#[derive(Clone, Debug, Default)]
pub enum Backend {
    /// libibverbs (requires the `rdma` feature)
    #[default]
    Verbs,
    /// In-process fabric shared by both peers
    Loopback(LoopbackFabric),
}

/// Configuration for the RDMA transport
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Device name; the first device found when unset
    pub device: Option<String>,
    /// Local port number
    pub ib_port: u8,
    /// GID index used for global routing; no GRH when unset
    pub gid_index: Option<u8>,
    pub backend: Backend,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device: None,
            ib_port: 1,
            gid_index: None,
            backend: Backend::Verbs,
        }
    }
}

/// Create the transport selected by `config`.
pub fn new_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match &config.backend {
        Backend::Loopback(fabric) => Ok(Box::new(fabric.transport())),
        Backend::Verbs => {
            #[cfg(feature = "rdma")]
            {
                Ok(Box::new(verbs::VerbsTransport::new()))
            }
            #[cfg(not(feature = "rdma"))]
            {
                tracing::error!("Real RDMA requested but binary was not compiled with 'rdma' feature");
                Err(crate::error::ProbeError::Unsupported(
                    "real RDMA not available; rebuild with '--features rdma' or use --loopback",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;

    #[test]
    fn test_state_order() {
        assert_eq!(ConnectionState::Reset.next(), Some(ConnectionState::Init));
        assert_eq!(
            ConnectionState::ReadyToReceive.next(),
            Some(ConnectionState::ReadyToSend)
        );
        assert_eq!(ConnectionState::ReadyToSend.next(), None);
        assert!(ConnectionState::Init < ConnectionState::ReadyToSend);
    }

    #[test]
    fn test_completion_status_raw() {
        for raw in [0, 1, 4, 5, 9, 10, 12, 13, 21] {
            assert_eq!(CompletionStatus::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(CompletionStatus::from_raw(21), CompletionStatus::Other(21));
    }

    #[test]
    fn test_gid_display() {
        let mut gid = Gid::default();
        assert!(gid.is_zero());
        gid.0[15] = 0xab;
        assert!(!gid.is_zero());
        assert!(gid.to_string().ends_with(":00:ab"));
    }

    #[cfg(not(feature = "rdma"))]
    #[test]
    fn test_verbs_requires_feature() {
        let err = new_transport(&TransportConfig::default()).err().unwrap();
        assert!(matches!(err, ProbeError::Unsupported(_)));
    }
}
