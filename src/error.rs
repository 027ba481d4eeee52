use std::io;
use std::time::Duration;

use crate::protocol::Barrier;
use crate::transport::{CompletionStatus, ConnectionState, Opcode};

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Every failure is terminal for the current run; nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("RDMA device {} not found", .0.as_deref().unwrap_or("<any>"))]
    DeviceNotFound(Option<String>),

    #[error("failed to query port {port}: {source}")]
    PortQueryFailed { port: u8, source: io::Error },

    #[error("failed to register {len} bytes of memory: {source}")]
    RegistrationFailed { len: usize, source: io::Error },

    #[error("{context} failed: {source}")]
    ResourceFailed {
        context: &'static str,
        source: io::Error,
    },

    #[error("failed to move connection to {target}: {reason}")]
    StateTransitionFailed {
        target: ConnectionState,
        reason: String,
    },

    #[error("failed to post {op}: {reason}")]
    PostFailed { op: Opcode, reason: String },

    #[error("no completion found after {0:?}")]
    Timeout(Duration),

    #[error("bad completion with status {status} (vendor syndrome {vendor_err:#x})")]
    CompletionError {
        status: CompletionStatus,
        vendor_err: u32,
    },

    #[error("handshake failed: {context}: {source}")]
    HandshakeFailed {
        context: &'static str,
        source: io::Error,
    },

    #[error("sync on barrier {barrier} failed: {source}")]
    BarrierFailed { barrier: Barrier, source: io::Error },

    #[error("range {offset}+{len} is outside the {size}-byte buffer")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("failed to write probe result: {0}")]
    Output(#[source] io::Error),

    #[error("teardown failed for: {}", .0.join(", "))]
    TeardownFailed(Vec<&'static str>),
}

#[cfg(feature = "rdma")]
impl ProbeError {
    pub(crate) fn resource(context: &'static str) -> Self {
        Self::ResourceFailed {
            context,
            source: io::Error::last_os_error(),
        }
    }
}
