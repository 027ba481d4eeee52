//! Wire types exchanged over the rendezvous channel
//!
//! The routing record is a fixed 34-byte, big-endian structure so that peers
//! built independently agree on its layout. Barriers are single ASCII bytes.

use crate::transport::Gid;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Encoded size of [`RemoteRoutingInfo`]
pub const ROUTING_RECORD_LEN: usize = 34;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Everything a peer needs to reach this side's buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRoutingInfo {
    /// Virtual address of the registered buffer
    pub addr: u64,
    /// Remote key of the registration
    pub rkey: u32,
    /// Queue pair number
    pub qp_num: u32,
    /// Local identifier of the port
    pub lid: u16,
    /// All zero when no GID index is configured
    pub gid: Gid,
}

impl RemoteRoutingInfo {
    pub fn encode(&self) -> io::Result<[u8; ROUTING_RECORD_LEN]> {
        let bytes = wire_options()
            .serialize(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        bytes.try_into().map_err(|b: Vec<u8>| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("routing record encoded to {} bytes", b.len()),
            )
        })
    }

    pub fn decode(bytes: &[u8; ROUTING_RECORD_LEN]) -> io::Result<Self> {
        wire_options()
            .deserialize(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl fmt::Display for RemoteRoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr={:#x} rkey={:#x} qp_num={:#x} lid={:#x}",
            self.addr, self.rkey, self.qp_num, self.lid
        )?;
        if !self.gid.is_zero() {
            write!(f, " gid={}", self.gid)?;
        }
        Ok(())
    }
}

/// Synchronisation points of a run, each identified by one byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    /// Both sides polled the initial SEND completion
    Ready,
    /// Both queue pairs reached RTS
    QpReady,
    /// Prober finished a probe; the passive side may flush
    FlushStart,
    /// Passive side finished flushing
    FlushDone,
    /// End of the run
    Wrapup,
}

impl Barrier {
    pub fn as_byte(self) -> u8 {
        match self {
            Barrier::Ready => b'R',
            Barrier::QpReady => b'Q',
            Barrier::FlushStart => b'A',
            Barrier::FlushDone => b'B',
            Barrier::Wrapup => b'W',
        }
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.as_byte() as char)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RemoteRoutingInfo {
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[15] = 0x01;
        RemoteRoutingInfo {
            addr: 0x0000_7f00_dead_b000,
            rkey: 0x1234_5678,
            qp_num: 0x0000_0abc,
            lid: 0x0011,
            gid: Gid(gid),
        }
    }

    #[test]
    fn test_routing_record_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[0..8], &[0x00, 0x00, 0x7f, 0x00, 0xde, 0xad, 0xb0, 0x00]);
        assert_eq!(&bytes[8..12], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&bytes[12..16], &[0x00, 0x00, 0x0a, 0xbc]);
        assert_eq!(&bytes[16..18], &[0x00, 0x11]);
        assert_eq!(bytes[18], 0xfe);
        assert_eq!(bytes[33], 0x01);
    }

    #[test]
    fn test_routing_record_decode() {
        let info = sample();
        let decoded = RemoteRoutingInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_barrier_bytes() {
        let bytes: Vec<u8> = [
            Barrier::Ready,
            Barrier::QpReady,
            Barrier::FlushStart,
            Barrier::FlushDone,
            Barrier::Wrapup,
        ]
        .iter()
        .map(|b| b.as_byte())
        .collect();
        assert_eq!(bytes, b"RQABW");
        assert_eq!(Barrier::QpReady.to_string(), "'Q'");
    }
}
